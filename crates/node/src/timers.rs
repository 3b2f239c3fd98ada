//! Timer management for the driver tasks.
//!
//! Each timer is a tokio task that sleeps (or ticks) and then sends an event
//! into the owning driver's channel. Setting a timer with an id that is
//! already armed replaces it; cancelling aborts the task.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Manages the cancellable timers of one driver.
pub struct TimerManager<K, E> {
    timers: HashMap<K, JoinHandle<()>>,
    event_tx: mpsc::Sender<E>,
}

impl<K, E> TimerManager<K, E>
where
    K: Eq + Hash + Clone + Debug,
    E: Send + 'static,
{
    pub fn new(event_tx: mpsc::Sender<E>) -> Self {
        Self {
            timers: HashMap::new(),
            event_tx,
        }
    }

    /// Arm a one-shot timer that delivers `event` after `duration`.
    pub fn set_timeout(&mut self, id: K, duration: Duration, event: E) {
        self.cancel(&id);
        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = event_tx.send(event).await;
        });
        trace!(?id, ?duration, "Timer set");
        self.timers.insert(id, handle);
    }

    /// Arm a repeating timer that delivers `make_event()` every `period`,
    /// starting one period from now.
    pub fn set_interval<F>(&mut self, id: K, period: Duration, make_event: F)
    where
        F: Fn() -> E + Send + 'static,
    {
        self.cancel(&id);
        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                if event_tx.send(make_event()).await.is_err() {
                    break;
                }
            }
        });
        trace!(?id, ?period, "Interval timer set");
        self.timers.insert(id, handle);
    }

    /// Cancel a timer. A no-op if it does not exist or already fired.
    pub fn cancel(&mut self, id: &K) {
        if let Some(handle) = self.timers.remove(id) {
            handle.abort();
            trace!(?id, "Timer cancelled");
        }
    }

    /// Cancel every timer; called on shutdown.
    pub fn cancel_all(&mut self) {
        for (id, handle) in self.timers.drain() {
            handle.abort();
            trace!(?id, "Timer cancelled (shutdown)");
        }
    }
}

impl<K, E> Drop for TimerManager<K, E> {
    fn drop(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Id {
        A,
        B,
    }

    #[tokio::test]
    async fn timeout_fires_once() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = TimerManager::new(tx);
        timers.set_timeout(Id::A, Duration::from_millis(10), "fired");

        let event = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, "fired");

        let again = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn cancel_prevents_delivery() {
        let (tx, mut rx) = mpsc::channel::<&str>(8);
        let mut timers = TimerManager::new(tx);
        timers.set_timeout(Id::A, Duration::from_millis(30), "fired");
        timers.cancel(&Id::A);

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn setting_replaces_existing_timer() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = TimerManager::new(tx);
        timers.set_timeout(Id::A, Duration::from_millis(500), "slow");
        timers.set_timeout(Id::A, Duration::from_millis(10), "fast");

        let event = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, "fast");
    }

    #[tokio::test]
    async fn interval_repeats() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = TimerManager::new(tx);
        timers.set_interval(Id::B, Duration::from_millis(10), || "tick");

        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event, "tick");
        }
    }
}
