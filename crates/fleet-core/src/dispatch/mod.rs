//! Dispatch queue: a Redis Stream carrying pending-run notifications,
//! drained through a single consumer group so delivery is at-least-once
//! with explicit acknowledgment and pending-entry inspection.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use redis::streams::{StreamPendingReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisResult};
use uuid::Uuid;

use crate::wire::DispatchMessage;

/// Default namespace for the stream key and consumer group name, used in
/// production. Tests supply a unique namespace per run to avoid
/// colliding on a shared Redis instance.
const DEFAULT_NAMESPACE: &str = "fleet";

/// An entry read off the stream, paired with its Redis stream id so the
/// caller can acknowledge or claim it.
#[derive(Debug, Clone)]
pub struct DispatchEntry {
    pub stream_id: String,
    pub message: DispatchMessage,
}

/// A pending (unacknowledged) entry observed via `XPENDING`, with its
/// idle time so the reconciler can decide whether to claim it.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub stream_id: String,
    pub idle: Duration,
}

/// Client for the dispatch queue, wrapping a Redis connection manager.
#[derive(Clone)]
pub struct DispatchQueue {
    conn: redis::aio::ConnectionManager,
    consumer_name: String,
    stream_key: String,
    group_name: String,
}

impl DispatchQueue {
    pub async fn connect(redis_url: &str, consumer_name: impl Into<String>) -> Result<Self> {
        Self::connect_namespaced(redis_url, DEFAULT_NAMESPACE, consumer_name).await
    }

    /// Connect with an explicit namespace for the stream key and consumer
    /// group name, so tests can isolate themselves on a shared Redis
    /// instance without a dedicated container per test.
    pub async fn connect_namespaced(
        redis_url: &str,
        namespace: &str,
        consumer_name: impl Into<String>,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid redis URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis for dispatch queue")?;
        let queue = Self {
            conn,
            consumer_name: consumer_name.into(),
            stream_key: format!("{namespace}:dispatch"),
            group_name: format!("{namespace}:scheduler"),
        };
        queue.ensure_group().await?;
        Ok(queue)
    }

    /// Create the stream and consumer group if they do not already exist.
    /// `MKSTREAM` means this also creates the stream itself on first use.
    async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group_name)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(()),
            // BUSYGROUP means the group already exists -- fine.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e).context("failed to create dispatch queue consumer group"),
        }
    }

    /// Publish a dispatch message for a newly-created run.
    pub async fn publish(&self, run_id: Uuid, task_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        let message = DispatchMessage {
            run_id,
            task_id,
            enqueued_at: Utc::now(),
        };
        let _: String = conn
            .xadd(
                &self.stream_key,
                "*",
                &[
                    ("run_id", message.run_id.to_string()),
                    ("task_id", message.task_id.to_string()),
                    ("enqueued_at", message.enqueued_at.to_rfc3339()),
                ],
            )
            .await
            .context("failed to publish dispatch message")?;
        Ok(())
    }

    /// Block for up to `timeout` reading up to `count` new messages for
    /// this consumer.
    pub async fn read(&self, count: usize, timeout: Duration) -> Result<Vec<DispatchEntry>> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(&self.group_name, &self.consumer_name)
            .count(count)
            .block(timeout.as_millis() as usize);

        let reply: StreamReadReply = conn
            .xread_options(&[&self.stream_key], &[">"], &opts)
            .await
            .context("failed to read from dispatch queue")?;

        Ok(parse_entries(reply))
    }

    /// Acknowledge a message, removing it from the pending-entry list.
    pub async fn ack(&self, stream_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(&self.stream_key, &self.group_name, &[stream_id])
            .await
            .context("failed to acknowledge dispatch message")?;
        Ok(())
    }

    /// List pending entries idle for at least `min_idle`, bounded to
    /// `limit` entries, for the fallback reconciler's pending-entry scan.
    pub async fn pending(&self, min_idle: Duration, limit: usize) -> Result<Vec<PendingEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group_name)
            .arg("IDLE")
            .arg(min_idle.as_millis() as usize)
            .arg("-")
            .arg("+")
            .arg(limit)
            .query_async(&mut conn)
            .await
            .context("failed to inspect pending dispatch entries")?;

        let entries = match reply {
            StreamPendingReply::Empty => Vec::new(),
            StreamPendingReply::Data(data) => data
                .ids
                .into_iter()
                .map(|id| PendingEntry {
                    stream_id: id.id,
                    idle: Duration::from_millis(id.time_since_delivered as u64),
                })
                .collect(),
        };
        Ok(entries)
    }

    /// Claim idle pending entries into this consumer. `XREADGROUP ... ID
    /// ">"` only ever returns never-before-delivered entries, so a claimed
    /// entry does NOT resurface through [`Self::read`] -- the caller must
    /// act on the returned entries directly (see
    /// `scheduler::reconciler::claim_idle_pending`).
    pub async fn claim(&self, stream_ids: &[String]) -> Result<Vec<DispatchEntry>> {
        if stream_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.stream_key)
            .arg(&self.group_name)
            .arg(&self.consumer_name)
            .arg(0);
        for id in stream_ids {
            cmd.arg(id);
        }
        let reply: StreamReadReply = cmd
            .query_async(&mut conn)
            .await
            .context("failed to claim pending dispatch entries")?;

        // XCLAIM's reply shape differs slightly from XREAD's, but the
        // `redis` crate parses both into the same stream-entry structure
        // when asked for a `StreamReadReply`; reuse the same parser.
        Ok(parse_flat_entries(reply))
    }
}

fn parse_entries(reply: StreamReadReply) -> Vec<DispatchEntry> {
    let mut entries = Vec::new();
    for key in reply.keys {
        for id in key.ids {
            if let Some(entry) = parse_one(&id.id, &id.map) {
                entries.push(entry);
            }
        }
    }
    entries
}

fn parse_flat_entries(reply: StreamReadReply) -> Vec<DispatchEntry> {
    parse_entries(reply)
}

fn parse_one(
    stream_id: &str,
    fields: &HashMap<String, redis::Value>,
) -> Option<DispatchEntry> {
    let run_id_str = field_str(fields, "run_id")?;
    let task_id_str = field_str(fields, "task_id")?;
    let enqueued_at_str = field_str(fields, "enqueued_at")?;

    let run_id = Uuid::parse_str(&run_id_str).ok()?;
    let task_id = Uuid::parse_str(&task_id_str).ok()?;
    let enqueued_at = chrono::DateTime::parse_from_rfc3339(&enqueued_at_str)
        .ok()?
        .with_timezone(&Utc);

    Some(DispatchEntry {
        stream_id: stream_id.to_string(),
        message: DispatchMessage {
            run_id,
            task_id,
            enqueued_at,
        },
    })
}

fn field_str(fields: &HashMap<String, redis::Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}
