//! Cluster routing against in-process cluster nodes

mod common;

use common::{cluster_node, ClusterState, MockServer};
use futures_util::future::join_all;
use resp_oxide::{
    cmd, key_slot, Client, ClusterConfig, ClusterRouter, ConnectionConfig, ConnectionEvent,
    FixedDelay, ReadPolicy, RedisError, SharedRetryPolicy,
};
use std::sync::Arc;
use std::time::Duration;

const LAST_SLOT: u16 = 16383;

fn quick_retry(max_attempts: u32) -> SharedRetryPolicy {
    SharedRetryPolicy::new(FixedDelay {
        delay: Duration::from_millis(10),
        max_attempts,
    })
}

fn client_config(seed: &MockServer) -> ConnectionConfig {
    ConnectionConfig::new(seed.url()).with_reconnect(quick_retry(1))
}

struct TestCluster {
    state: Arc<ClusterState>,
    a: MockServer,
    b: MockServer,
    client: Client,
}

impl TestCluster {
    async fn start() -> Self {
        let state = ClusterState::new();
        let a = MockServer::start(cluster_node(Arc::clone(&state))).await;
        let b = MockServer::start(cluster_node(Arc::clone(&state))).await;
        state.assign(vec![(0, LAST_SLOT, a.port)]);

        let client = Client::connect(client_config(&a))
            .await
            .expect("Failed to connect to mock cluster");
        Self { state, a, b, client }
    }

    fn router(&self) -> &ClusterRouter {
        self.client.router().expect("cluster client")
    }

    fn slots_requests(server: &MockServer) -> usize {
        server
            .commands()
            .iter()
            .filter(|args| args[0] == "CLUSTER" && args[1] == "SLOTS")
            .count()
    }
}

#[tokio::test]
async fn test_detects_cluster_and_loads_slot_map() {
    let cluster = TestCluster::start().await;

    assert!(cluster.client.is_cluster());
    assert_eq!(cluster.router().refresh_count(), 1);
    let map = cluster.router().slot_map().await;
    assert!(map.is_complete());
    assert_eq!(map.primary_for_slot(0), Some(cluster.a.address().as_str()));
}

#[tokio::test]
async fn test_moved_refreshes_and_retries_at_new_owner() {
    let cluster = TestCluster::start().await;
    cluster.client.set("foo", "bar").await.unwrap();

    cluster.state.assign(vec![(0, LAST_SLOT, cluster.b.port)]);
    assert_eq!(cluster.client.get("foo").await.unwrap(), Some("bar".to_string()));

    let map = cluster.router().slot_map().await;
    assert_eq!(
        map.primary_for_slot(key_slot(b"foo")),
        Some(cluster.b.address().as_str())
    );
    assert_eq!(cluster.router().refresh_count(), 2);
    assert_eq!(cluster.b.count("GET"), 1);
}

#[tokio::test]
async fn test_concurrent_redirects_share_one_refresh() {
    let cluster = TestCluster::start().await;
    cluster.state.assign(vec![(0, LAST_SLOT, cluster.b.port)]);

    let keys: Vec<String> = (0..20).map(|i| format!("key:{i}")).collect();
    let replies = join_all(keys.iter().map(|key| cluster.client.incr(key.as_str()))).await;
    for reply in replies {
        assert_eq!(reply.unwrap(), 1);
    }

    assert_eq!(cluster.router().refresh_count(), 2);
    assert_eq!(TestCluster::slots_requests(&cluster.b), 1);
}

#[tokio::test]
async fn test_cross_slot_command_is_rejected_before_sending() {
    let cluster = TestCluster::start().await;

    let result = cluster.client.send(&cmd("MGET").arg("a").arg("b")).await;
    assert!(matches!(result, Err(RedisError::CrossSlot { command }) if command == "MGET"));
    assert_eq!(cluster.a.count("MGET"), 0);
}

#[tokio::test]
async fn test_hash_tags_keep_keys_together() {
    let cluster = TestCluster::start().await;

    cluster
        .client
        .send(&cmd("DEL").arg("{user1000}.following").arg("{user1000}.followers"))
        .await
        .unwrap();
    assert_eq!(cluster.a.count("DEL"), 1);
}

#[tokio::test]
async fn test_ask_is_followed_without_touching_the_slot_map() {
    let cluster = TestCluster::start().await;
    let slot = key_slot(b"migrating");
    cluster.state.migrate(slot, cluster.b.port);

    cluster.client.set("migrating", "v").await.unwrap();
    assert_eq!(
        cluster.client.get("migrating").await.unwrap(),
        Some("v".to_string())
    );

    let commands = cluster.b.commands();
    let asking = commands.iter().position(|c| c[0] == "ASKING").unwrap();
    assert_eq!(commands[asking + 1][0], "SET");
    assert_eq!(cluster.router().refresh_count(), 1);
    let map = cluster.router().slot_map().await;
    assert_eq!(map.primary_for_slot(slot), Some(cluster.a.address().as_str()));
}

#[tokio::test]
async fn test_pipeline_spanning_nodes_is_cross_slot() {
    let cluster = TestCluster::start().await;
    cluster.state.assign(vec![
        (0, 8191, cluster.a.port),
        (8192, LAST_SLOT, cluster.b.port),
    ]);
    cluster.router().refresh().await.unwrap();

    // "b" hashes to slot 3300, "a" to 15495
    let mut pipeline = cluster.client.pipeline();
    pipeline.get("a").get("b");
    assert!(matches!(
        pipeline.execute().await,
        Err(RedisError::CrossSlot { .. })
    ));

    let mut pipeline = cluster.client.pipeline();
    pipeline.set("{tag}x", "1").incr("{tag}y");
    let mut results = pipeline.execute().await.unwrap();
    assert_eq!(results.next::<String>().unwrap(), "OK");
    assert_eq!(results.next::<i64>().unwrap(), 1);
}

#[tokio::test]
async fn test_transaction_follows_moved_slot() {
    let cluster = TestCluster::start().await;
    cluster.state.assign(vec![(0, LAST_SLOT, cluster.b.port)]);

    let mut transaction = cluster.client.transaction();
    transaction.set("{order}total", "10").incr("{order}count");
    let mut results = transaction.exec().await.unwrap();
    assert_eq!(results.next::<String>().unwrap(), "OK");
    assert_eq!(results.next::<i64>().unwrap(), 1);
    assert_eq!(cluster.b.count("EXEC"), 1);
}

#[tokio::test]
async fn test_unreachable_node_fails_fast() {
    let cluster = TestCluster::start().await;
    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    cluster.state.assign(vec![
        (0, 8191, cluster.a.port),
        (8192, LAST_SLOT, dead_port),
    ]);
    cluster.router().refresh().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), cluster.client.get("a")).await;
    assert!(matches!(
        result.unwrap(),
        Err(RedisError::NodeUnreachable { endpoint, .. }) if endpoint.ends_with(&dead_port.to_string())
    ));
    assert_eq!(cluster.client.get("b").await.unwrap(), None);
}

#[tokio::test]
async fn test_refresh_announces_new_nodes() {
    let cluster = TestCluster::start().await;
    let mut events = cluster.client.events();

    cluster.state.assign(vec![
        (0, 8191, cluster.a.port),
        (8192, LAST_SLOT, cluster.b.port),
    ]);
    cluster.router().refresh().await.unwrap();

    let expected = cluster.b.address();
    let announced = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::NodeAdded { address }) if address == expected => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await;
    assert_eq!(announced, Ok(true));
}

#[tokio::test]
async fn test_replica_reads_and_primary_writes() {
    let state = ClusterState::new();
    let primary = MockServer::start(cluster_node(Arc::clone(&state))).await;
    let replica = MockServer::start(cluster_node(Arc::clone(&state))).await;
    state.assign(vec![(0, LAST_SLOT, primary.port)]);
    state.add_replica(primary.port, replica.port);

    let config = client_config(&primary).with_cluster(ClusterConfig {
        read_policy: ReadPolicy::Replica,
        ..ClusterConfig::default()
    });
    let client = Client::connect(config).await.unwrap();

    client.set("color", "teal").await.unwrap();
    assert_eq!(client.get("color").await.unwrap(), Some("teal".to_string()));

    assert_eq!(primary.count("SET"), 1);
    assert_eq!(primary.count("GET"), 0);
    assert_eq!(replica.count("SET"), 0);
    assert_eq!(replica.count("GET"), 1);
    assert_eq!(replica.count("READONLY"), 1);
    assert_eq!(primary.count("READONLY"), 0);
}

#[tokio::test]
async fn test_endless_moved_exhausts_retry_budget() {
    let state = ClusterState::new();
    let a = MockServer::start(cluster_node(Arc::clone(&state))).await;
    let b = MockServer::start(cluster_node(Arc::clone(&state))).await;
    state.assign(vec![(0, LAST_SLOT, a.port)]);

    let config = client_config(&a).with_cluster(ClusterConfig {
        retry: quick_retry(2),
        ..ClusterConfig::default()
    });
    let client = Client::connect(config).await.unwrap();
    state.bounce(b.port);

    let result = client.get("pingpong").await;
    match result {
        Err(RedisError::RedirectExhausted {
            command,
            attempts,
            source,
        }) => {
            assert_eq!(command, "GET");
            assert_eq!(attempts, 3);
            assert!(matches!(*source, RedisError::Moved { .. }));
        }
        other => panic!("expected RedirectExhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_transient_cluster_errors_are_retried() {
    let state = ClusterState::new();
    let a = MockServer::start(cluster_node(Arc::clone(&state))).await;
    state.assign(vec![(0, LAST_SLOT, a.port)]);

    let config = client_config(&a).with_cluster(ClusterConfig {
        retry: quick_retry(3),
        ..ClusterConfig::default()
    });
    let client = Client::connect(config).await.unwrap();
    state.fail_next(&[
        "TRYAGAIN Multiple keys request during rehashing of slot",
        "CLUSTERDOWN The cluster is down",
    ]);

    assert_eq!(client.incr("retried").await.unwrap(), 1);
    assert_eq!(a.count("INCR"), 3);
}
