//! Multi-node scenarios over real HTTP: in-process nodes on loopback ports
//! sharing one durable list store, the way a deployment shares Redis.

use axum::http::StatusCode;
use concord_data::{DataSource, ListStore, MemoryListStore, StaticDataSource};
use concord_node::config::NodeConfig;
use concord_node::{build_node, telemetry};
use concord_raft::RaftConfig;
use concord_types::{ClusterTopology, NodeId, NodeSpec};
use serde_json::{json, Value};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

struct TestCluster {
    addrs: Vec<String>,
    topology: ClusterTopology,
    store: Arc<MemoryListStore>,
    client: reqwest::Client,
}

async fn spawn_cluster(n: usize, seeds: &[(&str, Value)]) -> TestCluster {
    telemetry::init_telemetry();

    let mut listeners = Vec::new();
    for _ in 0..n {
        listeners.push(tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    let specs: Vec<NodeSpec> = listeners
        .iter()
        .enumerate()
        .map(|(i, l)| NodeSpec {
            id: NodeId::new(format!("n{}", i + 1)),
            addr: format!("http://{}", l.local_addr().unwrap()),
        })
        .collect();
    let addrs: Vec<String> = specs.iter().map(|s| s.addr.clone()).collect();

    let store = Arc::new(MemoryListStore::new());
    let source = Arc::new(StaticDataSource::with_entries(
        seeds.iter().map(|(k, v)| (k.to_string(), v.clone())),
    ));

    for (i, listener) in listeners.into_iter().enumerate() {
        let config = NodeConfig {
            topology: ClusterTopology::new(specs[i].id.clone(), specs.clone()).unwrap(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            redis_url: None,
            cache_maxsize: NonZeroUsize::new(32).unwrap(),
            cluster_secret: "cluster-test-secret".into(),
            seed_data: vec![],
            raft: RaftConfig {
                heartbeat_interval: Duration::from_millis(50),
                election_timeout_min: Duration::from_millis(150),
                election_timeout_max: Duration::from_millis(300),
                rpc_timeout: Duration::from_millis(500),
            },
            rpc_timeout: Duration::from_millis(500),
            pbft_primary_timeout: Duration::from_secs(5),
        };
        let router = build_node(
            &config,
            store.clone() as Arc<dyn ListStore>,
            source.clone() as Arc<dyn DataSource>,
        )
        .unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
    }

    TestCluster {
        addrs,
        topology: ClusterTopology::new(specs[0].id.clone(), specs).unwrap(),
        store,
        client: reqwest::Client::new(),
    }
}

impl TestCluster {
    async fn get(&self, node: usize, path: &str) -> (StatusCode, Value) {
        let response = self
            .client
            .get(format!("{}{}", self.addrs[node], path))
            .send()
            .await
            .unwrap();
        let status = response.status();
        let body = response.json().await.unwrap_or(Value::Null);
        (StatusCode::from_u16(status.as_u16()).unwrap(), body)
    }

    async fn post(&self, node: usize, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = self.client.post(format!("{}{}", self.addrs[node], path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.unwrap();
        let status = response.status();
        let body = response.json().await.unwrap_or(Value::Null);
        (StatusCode::from_u16(status.as_u16()).unwrap(), body)
    }

    async fn delete(&self, node: usize, path: &str) -> (StatusCode, Value) {
        let response = self
            .client
            .delete(format!("{}{}", self.addrs[node], path))
            .send()
            .await
            .unwrap();
        let status = response.status();
        let body = response.json().await.unwrap_or(Value::Null);
        (StatusCode::from_u16(status.as_u16()).unwrap(), body)
    }

    /// Wait until exactly one node is LEADER and every node agrees on it.
    async fn wait_for_stable_leader(&self) -> String {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            let mut health = Vec::new();
            for i in 0..self.addrs.len() {
                let (_, body) = self.get(i, "/").await;
                health.push(body);
            }
            let leaders: Vec<&Value> = health
                .iter()
                .filter(|h| h["raft_state"] == "LEADER")
                .collect();
            let hints: Vec<&Value> = health.iter().map(|h| &h["leader"]).collect();
            if leaders.len() == 1 && hints.iter().all(|l| *l == hints[0] && !l.is_null()) {
                return hints[0].as_str().unwrap().to_string();
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no stable leader: {health:?}"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Index of the node with the given id.
    fn index_of(&self, id: &str) -> usize {
        self.topology
            .node_ids()
            .position(|n| n.as_str() == id)
            .unwrap()
    }

    /// Poll one endpoint until the predicate accepts the response.
    async fn wait_for(
        &self,
        node: usize,
        path: &str,
        what: &str,
        predicate: impl Fn(StatusCode, &Value) -> bool,
    ) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let (status, body) = self.get(node, path).await;
            if predicate(status, &body) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out: {what}; last response {status} {body}"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_elect_exactly_one_leader() {
    let cluster = spawn_cluster(3, &[]).await;
    let leader = cluster.wait_for_stable_leader().await;

    // Terms started moving and every /locks view names the same leader.
    for i in 0..3 {
        let (_, health) = cluster.get(i, "/").await;
        assert!(health["term"].as_u64().unwrap() >= 1);
        let (_, locks) = cluster.get(i, "/locks").await;
        assert_eq!(locks["leader"], leader.as_str());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exclusive_then_shared_hand_off() {
    let cluster = spawn_cluster(3, &[]).await;
    cluster.wait_for_stable_leader().await;

    // Node 1 takes the lock exclusively.
    let (status, body) = cluster
        .post(0, "/lock/x?lock_type=exclusive", None)
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["requester"], "n1");

    // Node 2's shared request queues behind it.
    let (status, body) = cluster.post(1, "/lock/x?lock_type=shared", None).await;
    assert_eq!(status, StatusCode::LOCKED, "{body}");
    assert_eq!(body["holders"], json!(["n1"]));

    // Node 1 releases; node 2 was promoted, so its retry is a grant.
    let (status, _) = cluster.delete(0, "/lock/x").await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = cluster.post(1, "/lock/x?lock_type=shared", None).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    // Replicated state settles everywhere: SHARED, held by n2, no waiters.
    for i in 0..3 {
        cluster
            .wait_for(i, "/lock/x", "lock state replicated", |status, body| {
                status == StatusCode::OK
                    && body["type"] == "SHARED"
                    && body["holders"] == json!(["n2"])
                    && body["waiters"] == json!([])
            })
            .await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deadlock_is_refused_not_queued() {
    let cluster = spawn_cluster(3, &[]).await;
    let leader = cluster.wait_for_stable_leader().await;

    // n1 holds x, n2 holds y.
    let (status, _) = cluster.post(0, "/lock/x?lock_type=exclusive", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = cluster.post(1, "/lock/y?lock_type=exclusive", None).await;
    assert_eq!(status, StatusCode::OK);

    // n1 waits on y.
    let (status, _) = cluster.post(0, "/lock/y?lock_type=exclusive", None).await;
    assert_eq!(status, StatusCode::LOCKED);

    // n2 asking for x would close the cycle: refused, nothing queued.
    let (status, body) = cluster.post(1, "/lock/x?lock_type=exclusive", None).await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");

    let leader_index = cluster.index_of(&leader);
    let (_, x) = cluster.get(leader_index, "/lock/x").await;
    assert!(!x["waiters"]
        .as_array()
        .unwrap()
        .iter()
        .any(|w| w["node"] == "n2"));
    let (_, y) = cluster.get(leader_index, "/lock/y").await;
    assert!(!y["waiters"]
        .as_array()
        .unwrap()
        .iter()
        .any(|w| w["node"] == "n2"));

    // The wait-for graph shows n1 → n2 and nothing else.
    let (_, locks) = cluster.get(leader_index, "/locks").await;
    assert_eq!(locks["wait_for_graph"]["n1"], json!(["n2"]));
    assert!(locks["wait_for_graph"].get("n2").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queue_operations_forward_to_the_responsible_node() {
    let cluster = spawn_cluster(3, &[]).await;

    // Find a queue that hashes to n2.
    let queue = (0..256)
        .map(|i| format!("orders-{i}"))
        .find(|name| cluster.topology.responsible(name).as_str() == "n2")
        .unwrap();

    // Produce via n1, consume via n3: both forwarded to n2.
    let (status, body) = cluster
        .post(0, &format!("/queue/{queue}"), Some(json!({"id": 1})))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["node"], "n2");

    let (status, body) = cluster.get(2, &format!("/queue/{queue}")).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["node"], "n2");
    assert_eq!(body["message"], json!({"id": 1}));

    // The durable processing list holds exactly that message.
    let processing = cluster
        .store
        .items(&format!("{queue}:processing"))
        .await
        .unwrap();
    assert_eq!(processing.len(), 1);
    assert_eq!(
        serde_json::from_str::<Value>(&processing[0]).unwrap(),
        json!({"id": 1})
    );

    // Ack through yet another node empties it.
    let (status, body) = cluster
        .post(
            0,
            &format!("/queue/ack/{queue}:processing"),
            Some(json!({"id": 1})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], true);
    let processing = cluster
        .store
        .items(&format!("{queue}:processing"))
        .await
        .unwrap();
    assert!(processing.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cache_invalidation_propagates() {
    let cluster = spawn_cluster(3, &[("k", json!("v1"))]).await;

    // Both n1 and n2 read through to the origin: SHARED copies.
    for node in [0, 1] {
        let (status, body) = cluster.get(node, "/cache/k").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cache_state"], "SHARED");
        assert_eq!(body["data"], "v1");
    }

    // n1 writes: locally MODIFIED, peers invalidated.
    let (status, body) = cluster
        .post(0, "/cache/k", Some(json!({"data": "v2"})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cache_state"], "MODIFIED");

    // n2 eventually misses, refetches the written-through value, SHARED.
    cluster
        .wait_for(1, "/cache/k", "peer copy invalidated", |_, body| {
            body["data"] == "v2" && body["cache_state"] == "SHARED"
        })
        .await;

    // Never two MODIFIED copies: n1 holds the only one.
    let (_, m1) = cluster.get(0, "/metrics").await;
    let (_, m2) = cluster.get(1, "/metrics").await;
    assert_eq!(m1["cache"]["states"]["k"], "MODIFIED");
    assert_eq!(m2["cache"]["states"]["k"], "SHARED");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pbft_four_nodes_agree_on_total_order() {
    let cluster = spawn_cluster(4, &[]).await;

    // Submit three requests through different nodes; replicas forward to
    // the primary (n1 in view 0).
    for (node, op) in [(0, "r1"), (1, "r2"), (3, "r3")] {
        let (status, body) = cluster
            .post(node, "/pbft/request", Some(json!({"op": op})))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["status"], "accepted");
    }

    // Every node executes all three, in the same order.
    for node in 0..4 {
        cluster
            .wait_for(node, "/pbft/status", "pbft execution converged", |_, body| {
                body["executed_count"] == 3 && body["last_executed"] == 3
            })
            .await;
    }

    let (_, status) = cluster.get(0, "/pbft/status").await;
    assert_eq!(status["f"], 1);
    assert_eq!(status["quorum"], 3);
    assert_eq!(status["byzantine_nodes"], json!([]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simulated_byzantine_behavior_raises_suspicion() {
    let cluster = spawn_cluster(4, &[]).await;

    // Seed one honest round so sequence 1 has an accepted pre-prepare.
    let (status, _) = cluster
        .post(0, "/pbft/request", Some(json!({"op": "seed"})))
        .await;
    assert_eq!(status, StatusCode::OK);
    cluster
        .wait_for(0, "/pbft/status", "seed executed", |_, body| {
            body["executed_count"] == 1
        })
        .await;

    // n2 emits a prepare whose digest conflicts with the accepted one.
    let (status, _) = cluster
        .post(1, "/pbft/simulate-byzantine?behavior=conflicting_prepare", None)
        .await;
    assert_eq!(status, StatusCode::OK);

    cluster
        .wait_for(0, "/pbft/status", "suspicion recorded", |_, body| {
            body["suspicions"]
                .get("n2")
                .map(|c| c.as_u64().unwrap_or(0) >= 1)
                == Some(true)
        })
        .await;
}
