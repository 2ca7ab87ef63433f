//! Operator subcommands for creating and listing tasks.

use anyhow::{Context, Result};
use sqlx::PgPool;

use fleet_db::models::Labels;
use fleet_db::queries::tasks;

use crate::TaskCommands;

pub async fn run_task_command(command: TaskCommands, pool: &PgPool) -> Result<()> {
    match command {
        TaskCommands::Create {
            name,
            prompt,
            label,
            node,
        } => cmd_create(pool, &name, &prompt, &label, node.as_deref()).await,
        TaskCommands::List => cmd_list(pool).await,
    }
}

async fn cmd_create(
    pool: &PgPool,
    name: &str,
    prompt: &str,
    raw_labels: &[String],
    node: Option<&str>,
) -> Result<()> {
    let labels = parse_labels(raw_labels)?;
    let task = tasks::insert_task(pool, name, prompt, &labels, node)
        .await
        .context("failed to create task")?;

    println!("Task created: {}", task.id);
    println!("  name   = {}", task.name);
    println!("  status = {}", task.status);
    if !labels.is_empty() {
        println!("  labels = {labels:?}");
    }
    if let Some(node) = node {
        println!("  requested_node_id = {node}");
    }

    Ok(())
}

async fn cmd_list(pool: &PgPool) -> Result<()> {
    let all = tasks::list_tasks(pool).await.context("failed to list tasks")?;

    if all.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!("{:<38} {:<10} {:<20} {}", "ID", "STATUS", "NAME", "LABELS");
    for task in &all {
        println!(
            "{:<38} {:<10} {:<20} {:?}",
            task.id, task.status, task.name, task.labels
        );
    }

    Ok(())
}

fn parse_labels(raw: &[String]) -> Result<Labels> {
    let mut labels = Labels::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("label {entry:?} is not in key=value form"))?;
        labels.insert(key.to_string(), value.to_string());
    }
    Ok(labels)
}
