//! Database query functions for the `runs` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Run, RunStatus, Task, TaskSnapshot};

/// Maximum number of times a run may be reclaimed before it is failed
/// permanently.
pub const RECLAIM_LIMIT: i32 = 3;

/// Insert a new run for `task` in `queued` status, capturing an immutable
/// snapshot of the task's current definition.
pub async fn insert_run(pool: &PgPool, task: &Task) -> Result<Run> {
    let snapshot = TaskSnapshot::from(task);
    let run = sqlx::query_as::<_, Run>(
        "INSERT INTO runs (task_id, status, snapshot) \
         VALUES ($1, 'queued', $2) \
         RETURNING *",
    )
    .bind(task.id)
    .bind(sqlx::types::Json(&snapshot))
    .fetch_one(pool)
    .await
    .context("failed to insert run")?;

    Ok(run)
}

/// Fetch a single run by ID.
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<Option<Run>> {
    let run = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch run")?;

    Ok(run)
}

/// List all runs for a task, most recent first.
pub async fn list_runs_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(
        "SELECT * FROM runs WHERE task_id = $1 ORDER BY created_at DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list runs for task")?;

    Ok(runs)
}

/// List all runs currently in a given status.
pub async fn list_runs_by_status(pool: &PgPool, status: RunStatus) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE status = $1")
        .bind(status)
        .fetch_all(pool)
        .await
        .context("failed to list runs by status")?;

    Ok(runs)
}

/// List queued runs that have not moved in at least `stale_after_secs`,
/// bounded to `limit` rows. Used by the fallback reconciler to find runs
/// whose dispatch message may have been lost.
pub async fn list_stale_queued_runs(
    pool: &PgPool,
    stale_after_secs: i64,
    limit: i64,
) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(
        "SELECT * FROM runs \
         WHERE status = 'queued' \
           AND updated_at < NOW() - ($1 || ' seconds')::interval \
         ORDER BY updated_at ASC \
         LIMIT $2",
    )
    .bind(stale_after_secs.to_string())
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list stale queued runs")?;

    Ok(runs)
}

/// Atomically transition a run from one status to another.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `status = $from`, so the row only changes if the current status still
/// matches. Returns the number of rows affected; 0 means a concurrent
/// writer already moved the run (the caller should treat this as a no-op,
/// not an error, to satisfy at-least-once delivery semantics).
pub async fn transition_run_status(
    pool: &PgPool,
    run_id: Uuid,
    from: RunStatus,
    to: RunStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE runs \
         SET status = $1, \
             updated_at = NOW(), \
             started_at = CASE WHEN $1 = 'running' AND started_at IS NULL THEN NOW() ELSE started_at END, \
             finished_at = CASE WHEN $1 IN ('done', 'failed', 'cancelled') THEN NOW() ELSE finished_at END \
         WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(run_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition run status")?;

    Ok(result.rows_affected())
}

/// Transition a run's status the way a node reports it: additionally
/// guarded by `node_id`, so a late report from a node that has since been
/// superseded by a reassignment is silently dropped rather than clobbering
/// the newer assignment.
pub async fn transition_run_status_from_node(
    pool: &PgPool,
    run_id: Uuid,
    node_id: &str,
    from: RunStatus,
    to: RunStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE runs \
         SET status = $1, \
             updated_at = NOW(), \
             started_at = CASE WHEN $1 = 'running' AND started_at IS NULL THEN NOW() ELSE started_at END, \
             finished_at = CASE WHEN $1 IN ('done', 'failed', 'cancelled') THEN NOW() ELSE finished_at END \
         WHERE id = $2 AND status = $3 AND node_id = $4",
    )
    .bind(to)
    .bind(run_id)
    .bind(from)
    .bind(node_id)
    .execute(pool)
    .await
    .context("failed to transition run status from node")?;

    Ok(result.rows_affected())
}

/// Assign a queued run to a node, moving it to `assigned`.
pub async fn assign_run(pool: &PgPool, run_id: Uuid, node_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE runs \
         SET status = 'assigned', node_id = $1, updated_at = NOW() \
         WHERE id = $2 AND status = 'queued'",
    )
    .bind(node_id)
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to assign run")?;

    Ok(result.rows_affected())
}

/// Mark a run terminally failed, recording the error message.
pub async fn fail_run(pool: &PgPool, run_id: Uuid, from: RunStatus, error: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE runs \
         SET status = 'failed', error = $1, updated_at = NOW(), finished_at = NOW() \
         WHERE id = $2 AND status = $3",
    )
    .bind(error)
    .bind(run_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to fail run")?;

    Ok(result.rows_affected())
}

/// Reclaim a run whose node stopped heartbeating: increment
/// `reclaim_count`, clear the node assignment, and either return it to
/// `queued` (if under [`RECLAIM_LIMIT`]) or fail it permanently.
///
/// Returns the run's new status, or `None` if `from` no longer matches
/// (already reclaimed or completed by a concurrent writer).
pub async fn reclaim_run(pool: &PgPool, run_id: Uuid, from: RunStatus) -> Result<Option<RunStatus>> {
    let mut tx = pool.begin().await.context("failed to start transaction")?;

    let row: Option<(i32,)> = sqlx::query_as(
        "SELECT reclaim_count FROM runs WHERE id = $1 AND status = $2 FOR UPDATE",
    )
    .bind(run_id)
    .bind(from)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to lock run for reclaim")?;

    let Some((reclaim_count,)) = row else {
        tx.rollback().await.ok();
        return Ok(None);
    };

    let next_count = reclaim_count + 1;
    let new_status = if next_count >= RECLAIM_LIMIT {
        RunStatus::Failed
    } else {
        RunStatus::Queued
    };

    if new_status == RunStatus::Failed {
        sqlx::query(
            "UPDATE runs \
             SET status = 'failed', \
                 node_id = NULL, \
                 reclaim_count = $1, \
                 error = 'exceeded reclaim limit', \
                 updated_at = NOW(), \
                 finished_at = NOW() \
             WHERE id = $2",
        )
        .bind(next_count)
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .context("failed to fail run after exceeding reclaim limit")?;
    } else {
        sqlx::query(
            "UPDATE runs \
             SET status = 'queued', \
                 node_id = NULL, \
                 reclaim_count = $1, \
                 updated_at = NOW() \
             WHERE id = $2",
        )
        .bind(next_count)
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .context("failed to requeue reclaimed run")?;
    }

    tx.commit().await.context("failed to commit reclaim")?;
    Ok(Some(new_status))
}

/// Record an error message on a run without touching its status. Used
/// when a node-reported terminal transition (guarded by `node_id`) has
/// already applied and the caller wants to attach the failure detail.
pub async fn set_run_error(pool: &PgPool, run_id: Uuid, error: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE runs SET error = $1, updated_at = NOW() WHERE id = $2")
        .bind(error)
        .bind(run_id)
        .execute(pool)
        .await
        .context("failed to set run error")?;

    Ok(result.rows_affected())
}

/// Mark a run cancelled from any non-terminal status.
pub async fn cancel_run(pool: &PgPool, run_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE runs \
         SET status = 'cancelled', updated_at = NOW(), finished_at = NOW() \
         WHERE id = $1 AND status IN ('queued', 'assigned', 'running')",
    )
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to cancel run")?;

    Ok(result.rows_affected())
}
