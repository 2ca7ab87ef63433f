//! Database query functions for the `nodes` table.
//!
//! This table is an advisory mirror of node liveness, used for operator
//! visibility (`fleetd node list`). Dispatch decisions never read from it;
//! the heartbeat cache in `fleet-core` is authoritative there.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{Labels, Node};

/// Insert or update a node's advertised labels and capacity, marking it
/// online and stamping the heartbeat time.
pub async fn upsert_node(
    pool: &PgPool,
    node_id: &str,
    labels: &Labels,
    max_concurrent: i32,
) -> Result<Node> {
    let node = sqlx::query_as::<_, Node>(
        "INSERT INTO nodes (id, status, labels, max_concurrent, last_heartbeat) \
         VALUES ($1, 'online', $2, $3, NOW()) \
         ON CONFLICT (id) DO UPDATE \
         SET status = 'online', \
             labels = EXCLUDED.labels, \
             max_concurrent = EXCLUDED.max_concurrent, \
             last_heartbeat = NOW() \
         RETURNING *",
    )
    .bind(node_id)
    .bind(sqlx::types::Json(labels))
    .bind(max_concurrent)
    .fetch_one(pool)
    .await
    .context("failed to upsert node")?;

    Ok(node)
}

/// Fetch a single node by ID.
pub async fn get_node(pool: &PgPool, node_id: &str) -> Result<Option<Node>> {
    let node = sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = $1")
        .bind(node_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch node")?;

    Ok(node)
}

/// List all known nodes.
pub async fn list_nodes(pool: &PgPool) -> Result<Vec<Node>> {
    let nodes = sqlx::query_as::<_, Node>("SELECT * FROM nodes ORDER BY id")
        .fetch_all(pool)
        .await
        .context("failed to list nodes")?;

    Ok(nodes)
}

/// Mark nodes offline whose last heartbeat is older than `stale_after`
/// seconds. Advisory only -- this does not reclaim their runs; the
/// reconciler does that by consulting the heartbeat cache directly.
pub async fn mark_stale_nodes_offline(pool: &PgPool, stale_after_secs: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE nodes \
         SET status = 'offline' \
         WHERE status = 'online' \
           AND last_heartbeat < NOW() - ($1 || ' seconds')::interval",
    )
    .bind(stale_after_secs.to_string())
    .execute(pool)
    .await
    .context("failed to mark stale nodes offline")?;

    Ok(result.rows_affected())
}
