//! Wire types shared between the controller's HTTP surface and node
//! managers. These are the JSON bodies exchanged over `/api/v1/*` and the
//! dispatch-queue message layout.

use chrono::{DateTime, Utc};
use fleet_db::models::{Labels, Run, RunStatus, TaskSnapshot};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of `POST /api/v1/tasks/{id}/runs` response and
/// `GET /api/v1/runs/{id}` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunBody {
    pub id: Uuid,
    pub task_id: Uuid,
    pub status: RunStatus,
    pub node_id: Option<String>,
    pub reclaim_count: i32,
    /// Immutable snapshot of the task definition taken at run creation,
    /// carried so a node manager can construct the adapter command
    /// without a second lookup against the task table.
    pub snapshot: TaskSnapshot,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl From<Run> for RunBody {
    fn from(r: Run) -> Self {
        Self {
            id: r.id,
            task_id: r.task_id,
            status: r.status,
            node_id: r.node_id,
            reclaim_count: r.reclaim_count,
            snapshot: r.snapshot,
            created_at: r.created_at,
            updated_at: r.updated_at,
            started_at: r.started_at,
            finished_at: r.finished_at,
            error: r.error,
        }
    }
}

/// Body of `GET /api/v1/tasks/{id}/runs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunListBody {
    pub runs: Vec<RunBody>,
    pub count: usize,
}

/// Body of `PATCH /api/v1/runs/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRunStatusRequest {
    pub status: RunStatus,
    /// Required when `status` is a terminal node-reported state so the
    /// update can be rejected if the run has since been reassigned to a
    /// different node.
    pub node_id: Option<String>,
    pub error: Option<String>,
}

/// Response of `PATCH /api/v1/runs/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRunStatusResponse {
    pub status: RunStatus,
}

/// Body of `POST /api/v1/nodes/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    pub labels: Labels,
    pub max_concurrent: i32,
    /// Number of runs currently `running` on this node, as observed by
    /// the node manager itself. Advisory; the controller rebuilds its own
    /// counts from the store on every reconciler tick.
    pub running_count: i32,
}

/// Response of `POST /api/v1/nodes/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub accepted: bool,
}

/// Body of `GET /api/v1/nodes/{id}/runs?status=assigned`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignedRunsResponse {
    pub runs: Vec<RunBody>,
}

/// One line of `POST /api/v1/runs/{id}/events`: `{type, timestamp, seq, data}`.
///
/// `event_type` is from the closed set enforced by the `run_events` table
/// CHECK constraint: `run_started`, `message`, `tool_use_start`,
/// `tool_result`, `command`, `command_output`, `run_completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub seq: i64,
    pub data: serde_json::Value,
}

/// The event type that, on first arrival, flips a task's derived status
/// to `running`. Pinned per the spec's open question.
pub const RUN_STARTED_EVENT_TYPE: &str = "run_started";

/// A dispatch-queue entry: `{run_id, task_id, enqueued_at}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub run_id: Uuid,
    pub task_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
}
