//! ferry - background task queue CLI

mod demo;
mod shutdown;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ferry_core::{QueueBuilder, QueueConfig, QueueManager, StoreConfig, TaskId};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// ferry - priority task queue with retries and timeouts
#[derive(Parser, Debug)]
#[command(name = "ferry", version, about = "Background task queue")]
struct Cli {
    /// Path to a JSON config file
    #[arg(long, global = true, env = "FERRY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the worker pool with the demo handlers
    Run {
        /// Do not submit the demo tasks; just serve until Ctrl+C
        #[arg(long)]
        no_demo: bool,
    },

    /// Show the status of a task
    Status {
        /// Task ID (`task-<ULID>` or bare ULID)
        task_id: TaskId,
    },

    /// Cancel a task that has not started yet
    Cancel { task_id: TaskId },

    /// Delete tasks older than N days (defaults to `retention_days`)
    Cleanup {
        #[arg(long)]
        days: Option<u32>,
    },

    /// Show task counts by status
    Stats,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Commands other than `run` inspect tasks written by another process
/// (typically a live `ferry run`), which needs a store both can open.
async fn open_shared(config: QueueConfig) -> Result<QueueManager> {
    match config.store {
        StoreConfig::Sqlite { .. } => {}
        StoreConfig::Memory => bail!(
            "this command needs a persistent store. Set FERRY_STORE_PATH or \
             configure {{\"store\": {{\"sqlite\": {{\"path\": ...}}}}}} in the config file."
        ),
        // sled locks its directory, so this only works while nothing else has it open
        StoreConfig::Sled { .. } => {
            warn!("sled store cannot be opened while another ferry process is using it")
        }
    }
    QueueBuilder::new()
        .config(config)
        .build()
        .await
        .context("failed to open task store")
}

async fn wait_all_terminal(manager: &QueueManager, ids: &[TaskId]) -> Result<()> {
    for id in ids {
        loop {
            let task = manager
                .get_status(*id)
                .await?
                .with_context(|| format!("task {id} disappeared"))?;
            if task.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
    Ok(())
}

async fn run(config: QueueConfig, submit_demo: bool) -> Result<()> {
    let grace = config.shutdown_timeout();
    let manager = demo::builder()?.config(config).build().await?;
    manager.start().await;

    let ids = if submit_demo {
        demo::submit_all(&manager).await?
    } else {
        Vec::new()
    };
    for id in &ids {
        println!("submitted {id}");
    }

    tokio::select! {
        () = shutdown::wait_for_shutdown_signal() => {}
        finished = wait_all_terminal(&manager, &ids), if !ids.is_empty() => {
            finished?;
            info!("all demo tasks finished");
        }
    }

    for id in &ids {
        if let Some(view) = manager.status_view(*id).await? {
            print_json(&view)?;
        }
    }
    print_json(&manager.get_queue_stats().await?)?;

    manager.stop(grace).await;
    Ok(())
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config = QueueConfig::load(cli.config.as_deref()).context("failed to load config")?;

    match cli.command {
        Commands::Run { no_demo } => run(config, !no_demo).await,
        Commands::Status { task_id } => {
            let manager = open_shared(config).await?;
            match manager.status_view(task_id).await? {
                Some(view) => print_json(&view),
                None => bail!("task {task_id} not found"),
            }
        }
        Commands::Cancel { task_id } => {
            let manager = open_shared(config).await?;
            if manager.cancel(task_id).await? {
                println!("cancelled {task_id}");
            } else {
                println!("{task_id} was not cancelled (unknown, running or finished)");
            }
            manager.store().flush().await?;
            Ok(())
        }
        Commands::Cleanup { days } => {
            let days = days.unwrap_or(config.retention_days);
            let manager = open_shared(config).await?;
            let removed = manager.store().cleanup_older_than(days).await?;
            manager.store().flush().await?;
            println!("removed {removed} task(s) older than {days} day(s)");
            Ok(())
        }
        Commands::Stats => {
            let manager = open_shared(config).await?;
            print_json(&manager.get_queue_stats().await?.tasks)
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = dispatch(Cli::parse()).await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
