use std::time::Duration;

use fleet_core::heartbeat::{HeartbeatCache, HeartbeatRecord};
use fleet_db::models::Labels;

async fn connect(namespace: &str) -> HeartbeatCache {
    let (_client, url, prefix) = fleet_test_utils::create_test_redis_with_url().await;
    let ns = format!("{prefix}_{namespace}");
    HeartbeatCache::connect_namespaced(&url, &ns)
        .await
        .expect("should connect heartbeat cache")
}

fn record(node_id: &str) -> HeartbeatRecord {
    let mut labels = Labels::new();
    labels.insert("os".to_string(), "linux".to_string());
    HeartbeatRecord {
        node_id: node_id.to_string(),
        labels,
        max_concurrent: 4,
        running_count: 1,
    }
}

#[tokio::test]
async fn write_then_get_returns_record() {
    let cache = connect("write_get").await;
    cache
        .write(&record("node-a"), Duration::from_secs(30))
        .await
        .expect("write");

    let fetched = cache.get("node-a").await.expect("get").expect("present");
    assert_eq!(fetched.node_id, "node-a");
    assert_eq!(fetched.max_concurrent, 4);
}

#[tokio::test]
async fn missing_node_is_not_alive() {
    let cache = connect("missing").await;
    assert!(!cache.is_alive("ghost").await.expect("is_alive"));
}

#[tokio::test]
async fn expired_record_is_no_longer_alive() {
    let cache = connect("expire").await;
    cache
        .write(&record("node-a"), Duration::from_millis(1))
        .await
        .expect("write");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!cache.is_alive("node-a").await.expect("is_alive"));
}

#[tokio::test]
async fn list_alive_returns_every_live_record() {
    let cache = connect("list").await;
    cache
        .write(&record("node-a"), Duration::from_secs(30))
        .await
        .expect("write a");
    cache
        .write(&record("node-b"), Duration::from_secs(30))
        .await
        .expect("write b");

    let mut ids: Vec<String> = cache
        .list_alive()
        .await
        .expect("list_alive")
        .into_iter()
        .map(|r| r.node_id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["node-a".to_string(), "node-b".to_string()]);
}
