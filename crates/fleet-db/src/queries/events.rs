//! Database query functions for the `run_events` table.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::RunEvent;

/// Parameters for inserting a new run event row.
#[derive(Debug, Clone)]
pub struct NewRunEvent {
    pub run_id: Uuid,
    pub seq: i64,
    pub event_type: String,
    pub payload: Value,
}

/// Insert a new run event row, keyed by `(run_id, seq)`.
///
/// A node manager may redeliver the same event after a retry; the unique
/// index on `(run_id, seq)` combined with `ON CONFLICT DO NOTHING` makes
/// this idempotent. Returns `None` when the event was already recorded.
pub async fn insert_run_event(pool: &PgPool, new: &NewRunEvent) -> Result<Option<RunEvent>> {
    let event = sqlx::query_as::<_, RunEvent>(
        "INSERT INTO run_events (run_id, seq, event_type, payload) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (run_id, seq) DO NOTHING \
         RETURNING *",
    )
    .bind(new.run_id)
    .bind(new.seq)
    .bind(&new.event_type)
    .bind(&new.payload)
    .fetch_optional(pool)
    .await
    .with_context(|| {
        format!(
            "failed to insert run event for run {} seq {}",
            new.run_id, new.seq
        )
    })?;

    Ok(event)
}

/// Get all events for a given run, ordered by sequence number.
pub async fn list_events_for_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<RunEvent>> {
    let events = sqlx::query_as::<_, RunEvent>(
        "SELECT * FROM run_events WHERE run_id = $1 ORDER BY seq ASC",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list events for run {run_id}"))?;

    Ok(events)
}

/// Highest sequence number recorded so far for a run, or `None` if it has
/// no events yet. Used by the node manager to resume an interrupted event
/// stream at the right offset.
pub async fn max_seq_for_run(pool: &PgPool, run_id: Uuid) -> Result<Option<i64>> {
    let row: (Option<i64>,) =
        sqlx::query_as("SELECT MAX(seq) FROM run_events WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to get max seq for run {run_id}"))?;

    Ok(row.0)
}

/// Count the number of events recorded for a run.
pub async fn count_events_for_run(pool: &PgPool, run_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM run_events WHERE run_id = $1")
        .bind(run_id)
        .fetch_one(pool)
        .await
        .with_context(|| format!("failed to count events for run {run_id}"))?;

    Ok(row.0)
}
