//! The scheduler: one actor with a fast-path stream consumer and a
//! periodic fallback reconciler, sharing the in-memory `running_count`
//! map behind a mutex. Everything else lives in the store.

pub mod reconciler;
pub mod strategies;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use fleet_db::models::RunStatus;
use fleet_db::queries::{nodes as node_db, runs as run_db};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::config::{SchedulerConfig, StrategyConfig};
use crate::dispatch::{DispatchEntry, DispatchQueue};
use crate::heartbeat::HeartbeatCache;
use crate::scheduler::strategies::{alive_nodes, select_node};

/// Shared scheduler state. Cheap to clone; the store pool, queue, and
/// heartbeat cache each wrap their own connection handle internally.
#[derive(Clone)]
pub struct Scheduler {
    pool: PgPool,
    queue: DispatchQueue,
    heartbeats: HeartbeatCache,
    config: SchedulerConfig,
    running_counts: Arc<Mutex<HashMap<String, i32>>>,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        queue: DispatchQueue,
        heartbeats: HeartbeatCache,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            heartbeats,
            config,
            running_counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run the fast path and the fallback reconciler concurrently until
    /// `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let fast_path = self.run_fast_path(cancel.clone());
        let reconciler = self.run_reconciler(cancel.clone());
        tokio::join!(fast_path, reconciler);
    }

    async fn run_fast_path(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            tokio::select! {
                result = self.queue.read(
                    self.config.redis.read_count,
                    self.config.redis.read_timeout,
                ) => {
                    match result {
                        Ok(entries) => {
                            for entry in entries {
                                if let Err(error) = self.handle_entry(&entry).await {
                                    tracing::warn!(run_id = %entry.message.run_id, %error, "failed to handle dispatch entry");
                                }
                            }
                        }
                        Err(error) => {
                            tracing::error!(%error, "dispatch queue read failed");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn run_reconciler(&self, cancel: CancellationToken) {
        let offline_threshold = self.config.requeue.offline_threshold;
        let mut ticker = tokio::time::interval(self.config.fallback.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = reconciler::tick(
                        &self.pool,
                        &self.queue,
                        &self.heartbeats,
                        &self.config.fallback,
                        &self.config.strategy,
                        offline_threshold,
                        &self.running_counts,
                    ).await {
                        tracing::error!(%error, "fallback reconciler tick failed");
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// Handle one dispatch-queue entry per §4.3/4.4's fast path.
    async fn handle_entry(&self, entry: &DispatchEntry) -> Result<()> {
        let run_id = entry.message.run_id;

        let Some(run) = run_db::get_run(&self.pool, run_id).await? else {
            self.queue.ack(&entry.stream_id).await?;
            return Ok(());
        };

        if run.status.is_terminal() {
            self.queue.ack(&entry.stream_id).await?;
            return Ok(());
        }

        if run.status != RunStatus::Queued {
            // Another path already assigned it.
            self.queue.ack(&entry.stream_id).await?;
            return Ok(());
        }

        let assigned = select_and_assign(
            &self.pool,
            &self.heartbeats,
            &self.config.strategy,
            &self.running_counts,
            &run,
        )
        .await?;

        if assigned.is_none() {
            // No suitable node: leave the message unacknowledged so a
            // future read or pending-entry claim retries it.
            return Ok(());
        }

        // Whether we won the assignment race or lost it to a concurrent
        // writer, the message is now spent either way.
        self.queue.ack(&entry.stream_id).await?;
        Ok(())
    }
}

/// Pick a node for `run` via the configured strategy chain and, if one is
/// found, assign the run to it and update `running_counts`. Returns
/// `None` (leaving the run untouched) when no candidate matches, so the
/// caller can decide how to retry -- used by both the fast path and the
/// fallback reconciler's claimed-entry re-drive.
pub(crate) async fn select_and_assign(
    pool: &PgPool,
    heartbeats: &HeartbeatCache,
    strategy: &StrategyConfig,
    running_counts: &Mutex<HashMap<String, i32>>,
    run: &fleet_db::models::Run,
) -> Result<Option<String>> {
    let nodes = node_db::list_nodes(pool).await?;
    let alive = heartbeats.list_alive().await?;
    let counts = running_counts
        .lock()
        .expect("running_counts mutex poisoned")
        .clone();
    let candidates = alive_nodes(&nodes, &alive, &counts);

    let siblings = run_db::list_runs_for_task(pool, run.task_id).await?;
    let nodes_with_task: Vec<String> = siblings
        .iter()
        .filter(|r| matches!(r.status, RunStatus::Assigned | RunStatus::Running))
        .filter_map(|r| r.node_id.clone())
        .collect();

    let Some(node_id) = select_node(
        &strategy.chain,
        run.snapshot.requested_node_id.as_deref(),
        &nodes_with_task,
        &run.snapshot.labels,
        &strategy.label_match,
        &candidates,
    ) else {
        return Ok(None);
    };

    let rows = run_db::assign_run(pool, run.id, &node_id).await?;
    if rows > 0 {
        let mut counts = running_counts.lock().expect("running_counts mutex poisoned");
        *counts.entry(node_id.clone()).or_insert(0) += 1;
    }
    Ok(Some(node_id))
}
