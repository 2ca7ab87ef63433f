mod config;
mod serve_cmd;
mod task_cmds;
#[cfg(test)]
mod test_util;

use anyhow::Context;
use clap::{Parser, Subcommand};

use fleet_core::dispatch::DispatchQueue;
use fleet_core::heartbeat::HeartbeatCache;
use fleet_core::scheduler::Scheduler;
use fleet_db::pool;

use config::FleetConfig;

#[derive(Parser)]
#[command(name = "fleetd", about = "Control plane for a fleet of sandboxed agent workers")]
struct Cli {
    /// Database URL (overrides FLEET_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Redis URL (overrides FLEET_REDIS_URL env var)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the controller database (creates it and runs migrations)
    DbInit,
    /// Run the controller: HTTP surface + scheduler actor
    Serve {
        /// Address to bind the HTTP server to
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Port to bind the HTTP server to
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Task management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Create a task
    Create {
        /// Human-readable task name
        name: String,
        /// Prompt handed to the agent CLI adapter
        prompt: String,
        /// Required label in key=value form, may be repeated
        #[arg(long = "label")]
        label: Vec<String>,
        /// Pin this task's runs to a specific node id
        #[arg(long)]
        node: Option<String>,
    },
    /// List all tasks
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::DbInit => cmd_db_init(cli.database_url.as_deref()).await,
        Commands::Serve { bind, port } => {
            cmd_serve(cli.database_url.as_deref(), cli.redis_url.as_deref(), &bind, port).await
        }
        Commands::Task { command } => {
            let resolved = FleetConfig::resolve(cli.database_url.as_deref(), cli.redis_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = task_cmds::run_task_command(command, &db_pool).await;
            db_pool.close().await;
            result
        }
    };

    if let Err(err) = result {
        eprintln!("{err:#}");
        std::process::exit(1);
    }

    Ok(())
}

/// Execute `fleetd db-init`: create the database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = FleetConfig::resolve(cli_db_url, None)?;

    println!("Initializing fleet database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("fleetd db-init complete.");
    Ok(())
}

/// Execute `fleetd serve`: run the HTTP surface and the scheduler actor
/// concurrently until a shutdown signal arrives.
async fn cmd_serve(
    cli_db_url: Option<&str>,
    cli_redis_url: Option<&str>,
    bind: &str,
    port: u16,
) -> anyhow::Result<()> {
    let resolved = FleetConfig::resolve(cli_db_url, cli_redis_url)?;

    let db_pool = pool::create_pool(&resolved.db_config)
        .await
        .context("failed to connect to database")?;

    let dispatch_queue = DispatchQueue::connect(&resolved.redis_url, "scheduler")
        .await
        .context("failed to connect dispatch queue")?;
    let http_queue = DispatchQueue::connect(&resolved.redis_url, "api")
        .await
        .context("failed to connect dispatch queue for HTTP surface")?;
    let heartbeats = HeartbeatCache::connect(&resolved.redis_url)
        .await
        .context("failed to connect heartbeat cache")?;

    let scheduler = Scheduler::new(
        db_pool.clone(),
        dispatch_queue,
        heartbeats.clone(),
        resolved.scheduler.clone(),
    );

    let cancel = tokio_util::sync::CancellationToken::new();

    let scheduler_handle = {
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    let state = serve_cmd::AppState {
        pool: db_pool.clone(),
        queue: http_queue,
        heartbeats,
        heartbeat_config: resolved.heartbeat.clone(),
    };

    // `run_serve` blocks until a Ctrl+C signal triggers axum's graceful
    // shutdown, then returns. At that point the scheduler actor is
    // cancelled too so both halves of the controller wind down together.
    let serve_result = serve_cmd::run_serve(state, bind, port).await;

    cancel.cancel();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(30), scheduler_handle).await;

    db_pool.close().await;
    serve_result.context("HTTP server error")
}
