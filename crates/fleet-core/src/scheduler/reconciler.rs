//! Fallback reconciler: a periodic sweep that re-drives stuck runs and
//! keeps the in-memory `running_count` map honest.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use fleet_db::models::RunStatus;
use fleet_db::queries::{nodes as node_db, runs as run_db};
use sqlx::PgPool;

use crate::config::{FallbackConfig, StrategyConfig};
use crate::dispatch::DispatchQueue;
use crate::heartbeat::HeartbeatCache;
use crate::scheduler::select_and_assign;

/// Maximum rows pulled per reconciler tick for each of the two stuck-run
/// categories. Bounds the sweep's store load on a large fleet.
const BATCH_LIMIT: i64 = 500;

/// One pass of the fallback reconciler: reclaim stuck runs, claim idle
/// pending dispatch entries, mark long-silent nodes offline, and rebuild
/// the running-count map.
pub async fn tick(
    pool: &PgPool,
    queue: &DispatchQueue,
    heartbeats: &HeartbeatCache,
    config: &FallbackConfig,
    strategy: &StrategyConfig,
    requeue_offline_threshold: std::time::Duration,
    running_counts: &Mutex<HashMap<String, i32>>,
) -> Result<()> {
    reclaim_stale_queued(pool, queue, config).await?;
    reclaim_orphaned_assignments(pool, queue, heartbeats).await?;
    claim_idle_pending(
        pool,
        queue,
        heartbeats,
        strategy,
        requeue_offline_threshold,
        running_counts,
    )
    .await?;
    mark_stale_nodes(pool, requeue_offline_threshold).await?;
    refresh_running_counts(pool, running_counts).await?;
    Ok(())
}

/// Flip the advisory `nodes.status` column to `offline` for nodes whose
/// last heartbeat predates `offline_threshold`. Does not touch their
/// runs -- `reclaim_orphaned_assignments` does that via the heartbeat
/// cache, which is authoritative for dispatch decisions.
async fn mark_stale_nodes(pool: &PgPool, offline_threshold: std::time::Duration) -> Result<()> {
    let affected = node_db::mark_stale_nodes_offline(pool, offline_threshold.as_secs() as i64).await?;
    if affected > 0 {
        tracing::info!(count = affected, "marked stale nodes offline");
    }
    Ok(())
}

/// Runs stuck `queued` past `stale_threshold`: their dispatch message was
/// presumably lost. Re-publish it.
async fn reclaim_stale_queued(
    pool: &PgPool,
    queue: &DispatchQueue,
    config: &FallbackConfig,
) -> Result<()> {
    let stale = run_db::list_stale_queued_runs(
        pool,
        config.stale_threshold.as_secs() as i64,
        BATCH_LIMIT,
    )
    .await?;

    for run in stale {
        if let Err(error) = queue.publish(run.id, run.task_id).await {
            tracing::warn!(run_id = %run.id, %error, "failed to republish stale queued run");
        }
    }
    Ok(())
}

/// Runs `assigned`/`running` on a node whose heartbeat has expired: move
/// them back to `queued` (subject to the reclaim limit) and re-publish.
async fn reclaim_orphaned_assignments(
    pool: &PgPool,
    queue: &DispatchQueue,
    heartbeats: &HeartbeatCache,
) -> Result<()> {
    let alive = heartbeats.list_alive().await?;
    let alive_ids: std::collections::HashSet<&str> =
        alive.iter().map(|h| h.node_id.as_str()).collect();

    for status in [RunStatus::Assigned, RunStatus::Running] {
        let runs = run_db::list_runs_by_status(pool, status).await?;
        for run in runs {
            let Some(node_id) = run.node_id.as_deref() else {
                continue;
            };
            if alive_ids.contains(node_id) {
                continue;
            }

            match run_db::reclaim_run(pool, run.id, status).await {
                Ok(Some(RunStatus::Queued)) => {
                    if let Err(error) = queue.publish(run.id, run.task_id).await {
                        tracing::warn!(run_id = %run.id, %error, "failed to republish reclaimed run");
                    }
                }
                Ok(Some(RunStatus::Failed)) => {
                    tracing::warn!(run_id = %run.id, node_id, "run failed, exceeded reclaim limit");
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(run_id = %run.id, %error, "failed to reclaim orphaned run");
                }
            }
        }
    }
    Ok(())
}

/// Claim dispatch-queue entries idle longer than `offline_threshold` into
/// this consumer and re-drive each into node selection/assignment
/// directly (claiming does not make an entry reappear from `read`, since
/// `XREADGROUP ... ID ">"` only ever returns never-before-delivered
/// entries; this function is the only place a claimed entry gets acted
/// on).
async fn claim_idle_pending(
    pool: &PgPool,
    queue: &DispatchQueue,
    heartbeats: &HeartbeatCache,
    strategy: &StrategyConfig,
    offline_threshold: std::time::Duration,
    running_counts: &Mutex<HashMap<String, i32>>,
) -> Result<()> {
    let pending = queue.pending(offline_threshold, BATCH_LIMIT as usize).await?;
    if pending.is_empty() {
        return Ok(());
    }

    let stale_ids: Vec<String> = pending
        .into_iter()
        .filter(|p| p.idle >= offline_threshold)
        .map(|p| p.stream_id)
        .collect();

    let claimed = queue.claim(&stale_ids).await?;
    for entry in &claimed {
        let run_id = entry.message.run_id;
        let Ok(Some(run)) = fleet_db::queries::runs::get_run(pool, run_id).await else {
            continue;
        };

        if run.status.is_terminal() || run.status != RunStatus::Queued {
            // Already terminal, or already assigned by a different path:
            // either way this entry is spent.
            let _ = queue.ack(&entry.stream_id).await;
            continue;
        }

        match select_and_assign(pool, heartbeats, strategy, running_counts, &run).await {
            Ok(Some(_node_id)) => {
                let _ = queue.ack(&entry.stream_id).await;
            }
            Ok(None) => {
                // Still no suitable node. Leave unacknowledged so the
                // next sweep's pending-entry scan claims and retries it.
            }
            Err(error) => {
                tracing::warn!(run_id = %run_id, %error, "failed to re-drive claimed dispatch entry");
            }
        }
    }
    Ok(())
}

/// Rebuild the in-memory `running_count` map from a single authoritative
/// scan of `assigned`/`running` runs, grouped by node.
async fn refresh_running_counts(
    pool: &PgPool,
    running_counts: &Mutex<HashMap<String, i32>>,
) -> Result<()> {
    let mut counts: HashMap<String, i32> = HashMap::new();
    for status in [RunStatus::Assigned, RunStatus::Running] {
        let runs = run_db::list_runs_by_status(pool, status).await?;
        for run in runs {
            if let Some(node_id) = run.node_id {
                *counts.entry(node_id).or_insert(0) += 1;
            }
        }
    }
    *running_counts.lock().expect("running_counts mutex poisoned") = counts;
    Ok(())
}
