//! The PBFT driver task.
//!
//! Mirrors the Raft driver's shape: one task owns the [`PbftState`] engine,
//! receives client requests, peer protocol messages, and the primary-timeout
//! tick through a channel, and executes the returned actions (protocol
//! broadcasts are fire-and-forget on spawned tasks).

use crate::error::NodeError;
use crate::peers::PeerClient;
use crate::timers::TimerManager;
use concord_pbft::{PbftAction, PbftMessage, PbftReceipt, PbftState, PbftStatus, SubmitError};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Inputs to the driver task.
#[derive(Debug)]
pub enum PbftEvent {
    Request {
        request: serde_json::Value,
        reply: oneshot::Sender<Result<PbftReceipt, SubmitError>>,
    },
    Message(PbftMessage),
    PrimaryTick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PbftTimer {
    Primary,
}

/// Cheap handle the transport layer uses to talk to the driver.
#[derive(Clone)]
pub struct PbftHandle {
    tx: mpsc::Sender<PbftEvent>,
    status: Arc<RwLock<PbftStatus>>,
}

impl PbftHandle {
    /// Latest published engine snapshot.
    pub fn status(&self) -> PbftStatus {
        self.status.read().clone()
    }

    /// Submit a client request. `Err(SubmitError::NotPrimary)` tells the
    /// caller where to forward.
    pub async fn submit(
        &self,
        request: serde_json::Value,
    ) -> Result<Result<PbftReceipt, SubmitError>, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PbftEvent::Request { request, reply })
            .await
            .map_err(|_| NodeError::Transient("pbft driver stopped".into()))?;
        rx.await
            .map_err(|_| NodeError::Transient("pbft driver stopped".into()))
    }

    /// Deliver a peer protocol message.
    pub async fn deliver(&self, msg: PbftMessage) -> Result<(), NodeError> {
        self.tx
            .send(PbftEvent::Message(msg))
            .await
            .map_err(|_| NodeError::Transient("pbft driver stopped".into()))
    }
}

/// Spawn the driver task and return its handle.
pub fn spawn(state: PbftState, peers: PeerClient, primary_timeout: Duration) -> PbftHandle {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let status = Arc::new(RwLock::new(state.status()));

    let mut timers = TimerManager::new(tx.clone());
    timers.set_interval(PbftTimer::Primary, primary_timeout, || {
        PbftEvent::PrimaryTick
    });

    let driver = PbftDriver {
        state,
        status: status.clone(),
        peers,
        _timers: timers,
    };
    tokio::spawn(driver.run(rx));

    PbftHandle { tx, status }
}

struct PbftDriver {
    state: PbftState,
    status: Arc<RwLock<PbftStatus>>,
    peers: PeerClient,
    /// Kept for its Drop: cancels the primary tick with the driver.
    _timers: TimerManager<PbftTimer, PbftEvent>,
}

impl PbftDriver {
    async fn run(mut self, mut rx: mpsc::Receiver<PbftEvent>) {
        info!("PBFT driver started");
        while let Some(event) = rx.recv().await {
            let actions = match event {
                PbftEvent::Request { request, reply } => match self.state.on_client_request(request)
                {
                    Ok((receipt, actions)) => {
                        let _ = reply.send(Ok(receipt));
                        actions
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                        vec![]
                    }
                },
                PbftEvent::Message(msg) => self.state.handle_message(msg),
                PbftEvent::PrimaryTick => {
                    self.state.on_primary_timeout();
                    vec![]
                }
            };
            self.execute(actions);
            *self.status.write() = self.state.status();
        }
        info!("PBFT driver stopped");
    }

    fn execute(&mut self, actions: Vec<PbftAction>) {
        for action in actions {
            match action {
                PbftAction::Broadcast(msg) => {
                    let peers = self.peers.clone();
                    tokio::spawn(async move {
                        peers.broadcast_pbft(&msg).await;
                    });
                }
                PbftAction::Executed { sequence, .. } => {
                    info!(sequence, "PBFT request executed");
                }
            }
        }
    }
}
