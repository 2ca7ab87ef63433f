//! The node manager control loop: heartbeat, poll assignments, launch
//! runs via an [`Adapter`], stream events, report terminal status, and
//! fire local cancellation for runs the controller no longer lists.

use std::collections::HashMap;
use std::sync::Arc;

use fleet_db::models::RunStatus;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use fleet_core::wire::{EventRecord, HeartbeatRequest, RUN_STARTED_EVENT_TYPE};

use crate::adapter::{Adapter, AdapterEvent};
use crate::client::ControllerClient;
use crate::config::NodeConfig;

/// Bookkeeping for a run this node manager is currently executing.
struct InFlight {
    cancel: CancellationToken,
}

/// Run the node manager loop until `cancel` fires.
///
/// Each iteration: heartbeat, then poll assigned runs, then launch any
/// newly-assigned run and fire local cancellation for runs the controller
/// no longer lists (it was cancelled centrally).
pub async fn run(
    config: NodeConfig,
    client: ControllerClient,
    adapter: Arc<dyn Adapter>,
    cancel: CancellationToken,
) {
    let client = Arc::new(client);
    let mut in_flight: HashMap<Uuid, InFlight> = HashMap::new();
    let mut heartbeat_tick = tokio::time::interval(config.heartbeat_interval);
    let mut poll_tick = tokio::time::interval(config.poll_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(node_id = %config.node_id, "node manager shutting down, cancelling in-flight runs");
                for (run_id, entry) in in_flight.drain() {
                    tracing::info!(run_id = %run_id, "cancelling run on shutdown");
                    entry.cancel.cancel();
                }
                return;
            }
            _ = heartbeat_tick.tick() => {
                send_heartbeat(&config, &client, in_flight.len() as i32).await;
            }
            _ = poll_tick.tick() => {
                poll_and_dispatch(&config, &client, adapter.clone(), &mut in_flight).await;
            }
        }
    }
}

async fn send_heartbeat(config: &NodeConfig, client: &ControllerClient, running_count: i32) {
    let req = HeartbeatRequest {
        node_id: config.node_id.clone(),
        labels: config.labels.clone(),
        max_concurrent: config.max_concurrent,
        running_count,
    };
    if let Err(error) = client.heartbeat(&req).await {
        tracing::warn!(node_id = %config.node_id, %error, "heartbeat failed");
    }
}

async fn poll_and_dispatch(
    config: &NodeConfig,
    client: &Arc<ControllerClient>,
    adapter: Arc<dyn Adapter>,
    in_flight: &mut HashMap<Uuid, InFlight>,
) {
    let assigned = match client.assigned_runs(&config.node_id).await {
        Ok(runs) => runs,
        Err(error) => {
            tracing::warn!(node_id = %config.node_id, %error, "failed to poll assigned runs");
            return;
        }
    };

    let still_assigned: std::collections::HashSet<Uuid> =
        assigned.iter().map(|r| r.id).collect();

    // Runs we're tracking that the controller no longer lists as assigned
    // to us were cancelled centrally (or reassigned elsewhere). Fire their
    // local cancellation token.
    in_flight.retain(|run_id, entry| {
        if still_assigned.contains(run_id) {
            true
        } else {
            tracing::info!(run_id = %run_id, "run no longer assigned, cancelling locally");
            entry.cancel.cancel();
            false
        }
    });

    if in_flight.len() as i32 >= config.max_concurrent {
        return;
    }

    for run in assigned {
        if in_flight.contains_key(&run.id) {
            continue;
        }
        if in_flight.len() as i32 >= config.max_concurrent {
            tracing::debug!(node_id = %config.node_id, "at capacity, skipping remaining assigned runs this tick");
            break;
        }

        let run_cancel = CancellationToken::new();
        in_flight.insert(run.id, InFlight { cancel: run_cancel.clone() });

        let node_id = config.node_id.clone();
        let client = Arc::clone(client);
        let adapter = Arc::clone(&adapter);
        let run_id = run.id;
        let snapshot = run.snapshot.clone();

        tokio::spawn(async move {
            execute_run(node_id, client, adapter, run_id, snapshot, run_cancel).await;
        });
    }
}

async fn execute_run(
    node_id: String,
    client: Arc<ControllerClient>,
    adapter: Arc<dyn Adapter>,
    run_id: Uuid,
    snapshot: fleet_db::models::TaskSnapshot,
    cancel: CancellationToken,
) {
    if let Err(error) = client
        .update_run_status(run_id, RunStatus::Running, Some(&node_id), None)
        .await
    {
        tracing::warn!(run_id = %run_id, %error, "failed to transition run to running, skipping launch");
        return;
    }

    let handle = match adapter.spawn(run_id, &snapshot).await {
        Ok(handle) => handle,
        Err(error) => {
            tracing::warn!(run_id = %run_id, %error, "adapter failed to spawn run");
            report_terminal(&client, run_id, &node_id, false, Some(error.to_string())).await;
            return;
        }
    };

    let mut seq: i64 = 1;
    let mut events = adapter.events(&handle);
    let mut pending = Vec::new();
    let mut outcome = (false, Some("run did not report completion".to_string()));

    pending.push(EventRecord {
        event_type: RUN_STARTED_EVENT_TYPE.to_string(),
        timestamp: chrono::Utc::now(),
        seq,
        data: serde_json::json!({ "node_id": node_id }),
    });
    seq += 1;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(run_id = %run_id, "cancellation requested, killing adapter process");
                let _ = adapter.kill(&handle).await;
                flush_events(&client, run_id, &mut pending).await;
                return;
            }
            next = events.next() => {
                match next {
                    Some(AdapterEvent::Message(line)) => {
                        pending.push(EventRecord {
                            event_type: "message".to_string(),
                            timestamp: chrono::Utc::now(),
                            seq,
                            data: serde_json::json!({ "text": line }),
                        });
                        seq += 1;
                    }
                    Some(AdapterEvent::Completed { success, error }) => {
                        pending.push(EventRecord {
                            event_type: "run_completed".to_string(),
                            timestamp: chrono::Utc::now(),
                            seq,
                            data: serde_json::json!({ "success": success, "error": error }),
                        });
                        outcome = (success, error);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    flush_events(&client, run_id, &mut pending).await;
    report_terminal(&client, run_id, &node_id, outcome.0, outcome.1).await;
}

async fn flush_events(client: &ControllerClient, run_id: Uuid, pending: &mut Vec<EventRecord>) {
    if pending.is_empty() {
        return;
    }
    if let Err(error) = client.post_events(run_id, pending).await {
        tracing::warn!(run_id = %run_id, %error, "failed to post run events");
    }
    pending.clear();
}

async fn report_terminal(
    client: &ControllerClient,
    run_id: Uuid,
    node_id: &str,
    success: bool,
    error: Option<String>,
) {
    let status = if success { RunStatus::Done } else { RunStatus::Failed };
    if let Err(e) = client
        .update_run_status(run_id, status, Some(node_id), error.as_deref())
        .await
    {
        tracing::warn!(run_id = %run_id, error = %e, "failed to report terminal run status");
    }
}
