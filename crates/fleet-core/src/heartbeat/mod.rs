//! Heartbeat cache: a short-TTL Redis view of per-node liveness, labels,
//! and declared capacity.
//!
//! Writers are node managers (indirectly, via the controller's
//! `/api/v1/nodes/heartbeat` endpoint); the scheduler is the only reader.
//! Dispatch decisions never consult the persistent `nodes` table for
//! liveness -- only this cache, which expires naturally when a node stops
//! heartbeating.

use std::time::Duration;

use anyhow::{Context, Result};
use fleet_db::models::Labels;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

const DEFAULT_NAMESPACE: &str = "fleet";

/// A node's declared state as last reported in a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub node_id: String,
    pub labels: Labels,
    pub max_concurrent: i32,
    pub running_count: i32,
}

/// Thin wrapper around a Redis connection manager, scoped to heartbeat
/// reads and writes.
#[derive(Clone)]
pub struct HeartbeatCache {
    conn: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl HeartbeatCache {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        Self::connect_namespaced(redis_url, DEFAULT_NAMESPACE).await
    }

    /// Connect with an explicit key namespace, so tests can isolate
    /// themselves on a shared Redis instance without a dedicated
    /// container per test.
    pub async fn connect_namespaced(redis_url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid redis URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis for heartbeat cache")?;
        Ok(Self {
            conn,
            key_prefix: format!("{namespace}:heartbeat:"),
        })
    }

    fn key(&self, node_id: &str) -> String {
        format!("{}{node_id}", self.key_prefix)
    }

    /// Write (or refresh) a node's heartbeat record with the given TTL.
    /// Last-writer-wins: there is no versioning, the most recent write
    /// replaces the previous record outright.
    pub async fn write(&self, record: &HeartbeatRecord, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(record).context("failed to serialize heartbeat")?;
        let ttl_secs: u64 = ttl.as_secs().max(1);
        let _: () = conn
            .set_ex(self.key(&record.node_id), payload, ttl_secs)
            .await
            .context("failed to write heartbeat record")?;
        Ok(())
    }

    /// Fetch a single node's heartbeat record if it is still alive
    /// (i.e. has not expired out of the cache).
    pub async fn get(&self, node_id: &str) -> Result<Option<HeartbeatRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(self.key(node_id))
            .await
            .context("failed to read heartbeat record")?;
        match raw {
            Some(s) => {
                let record = serde_json::from_str(&s).context("corrupt heartbeat record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// True iff the node has a live (unexpired) heartbeat record.
    pub async fn is_alive(&self, node_id: &str) -> Result<bool> {
        Ok(self.get(node_id).await?.is_some())
    }

    /// List every currently-alive node's heartbeat record.
    ///
    /// Backed by a `SCAN` over the heartbeat key namespace rather than
    /// `KEYS`, so it does not block the server on a large fleet.
    pub async fn list_alive(&self) -> Result<Vec<HeartbeatRecord>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut node_keys = Vec::new();

        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{}*", self.key_prefix))
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .context("failed to scan heartbeat keys")?;

            node_keys.extend(batch);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        if node_keys.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = conn
            .mget(&node_keys)
            .await
            .context("failed to fetch heartbeat records")?;

        let mut records = Vec::with_capacity(values.len());
        for value in values.into_iter().flatten() {
            if let Ok(record) = serde_json::from_str::<HeartbeatRecord>(&value) {
                records.push(record);
            }
        }
        Ok(records)
    }
}
