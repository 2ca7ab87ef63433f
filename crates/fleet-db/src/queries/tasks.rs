//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Labels, Task, TaskStatus};

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, created_at, updated_at, status = pending).
pub async fn insert_task(
    pool: &PgPool,
    name: &str,
    prompt: &str,
    labels: &Labels,
    requested_node_id: Option<&str>,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (name, prompt, labels, requested_node_id) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(name)
    .bind(prompt)
    .bind(sqlx::types::Json(labels))
    .bind(requested_node_id)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks, most recently created first.
pub async fn list_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
        .context("failed to list tasks")?;

    Ok(tasks)
}

/// Directly set a task's status. Used for operator-initiated cancellation;
/// all other status changes are derived from run outcomes (see
/// `recompute_task_status`).
pub async fn set_task_status(pool: &PgPool, id: Uuid, status: TaskStatus) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET status = $1, updated_at = NOW() WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update task status")?;

    Ok(result.rows_affected())
}

/// Recompute a task's status by folding across the status of ALL of its
/// runs and write it back. A task with no runs stays `pending`.
///
/// Precedence: `running` if any run is `queued`/`assigned`/`running`;
/// `done` if all runs are `done`; otherwise `failed` if any run is
/// `failed`; otherwise `cancelled`. Cancellation is the one status a
/// caller may set directly and this function will not override it once
/// applied.
pub async fn recompute_task_status(pool: &PgPool, task_id: Uuid) -> Result<()> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT status::text FROM runs WHERE task_id = $1")
            .bind(task_id)
            .fetch_all(pool)
            .await
            .context("failed to fetch run statuses")?;

    if rows.is_empty() {
        return Ok(());
    }

    let any = |want: &str| rows.iter().any(|(s,)| s == want);
    let all = |want: &str| rows.iter().all(|(s,)| s == want);

    let derived = if any("queued") || any("assigned") || any("running") {
        TaskStatus::Running
    } else if all("done") {
        TaskStatus::Done
    } else if any("failed") {
        TaskStatus::Failed
    } else {
        TaskStatus::Cancelled
    };

    sqlx::query(
        "UPDATE tasks SET status = $1, updated_at = NOW() \
         WHERE id = $2 AND status != 'cancelled'",
    )
    .bind(derived)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to recompute task status")?;

    Ok(())
}
