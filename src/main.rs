use std::sync::Arc;
use std::sync::atomic::Ordering;

use claude_todo::config::QueueConfig;
use claude_todo::events;
use claude_todo::executor::{ClaudeExecutor, TaskExecutor};
use claude_todo::queue::TaskQueue;
use claude_todo::store::{LibSqlStore, TaskStore};
use claude_todo::worker::{Worker, WorkerOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Arc::new(QueueConfig::from_env());

    let group = std::env::var("CLAUDE_TODO_GROUP").ok();
    let idle_timeout_secs: u64 = std::env::var("CLAUDE_TODO_IDLE_TIMEOUT")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .unwrap_or(0);

    let db_path = std::env::var("CLAUDE_TODO_DB_PATH")
        .unwrap_or_else(|_| "./data/claude-todo.db".to_string());

    eprintln!("Claude Todo Worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   CLI: {}", config.cli_path);
    eprintln!("   Model: {}", config.model);
    eprintln!("   Database: {}", db_path);
    if let Some(ref group) = group {
        eprintln!("   Group: {}", group);
    }
    let idle_text = if idle_timeout_secs > 0 {
        format!("{idle_timeout_secs} seconds")
    } else {
        "disabled".to_string()
    };
    eprintln!("   Idle timeout: {}", idle_text);
    eprintln!("   Check interval: {} seconds\n", config.check_interval.as_secs());

    // ── Store and queue ──────────────────────────────────────────────
    let store: Arc<dyn TaskStore> =
        Arc::new(LibSqlStore::new_local(std::path::Path::new(&db_path)).await?);

    let (events_tx, _events_rx) = events::channel();
    let queue = Arc::new(TaskQueue::new(store, events_tx.clone()));

    if let Some(ref group) = group {
        let stats = queue.stats(group).await?;
        let mut line = String::new();
        let mut entries: Vec<_> = stats.iter().collect();
        entries.sort_by_key(|(status, _)| status.to_string());
        for (status, count) in entries {
            line.push_str(&format!("{status}: {count}  "));
        }
        eprintln!("   Queue: {}\n", line.trim_end());
    }

    // ── Executor ─────────────────────────────────────────────────────
    let executor = Arc::new(ClaudeExecutor::new(Arc::clone(&config), events_tx));
    if !executor.is_available().await {
        anyhow::bail!(
            "Claude CLI is not available at '{}'. Set CLAUDE_TODO_CLI_PATH or install the CLI.",
            config.cli_path
        );
    }

    // ── Worker ───────────────────────────────────────────────────────
    let worker = Worker::new(queue, executor, Arc::clone(&config));

    let shutdown = worker.shutdown_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nShutdown requested, finishing current task...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    let options = WorkerOptions {
        group,
        idle_timeout: std::time::Duration::from_secs(idle_timeout_secs),
        ..WorkerOptions::from_config(&config)
    };

    let stats = worker.run(&options).await;

    eprintln!("\nWorker Summary");
    eprintln!("   Tasks processed: {}", stats.processed);
    eprintln!("   Tasks failed: {}", stats.failed);
    eprintln!("   Total: {}", stats.processed + stats.failed);

    Ok(())
}
