use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gitlab_adapter::config::Config;
use gitlab_adapter::db::{Db, listen_for_changes};
use gitlab_adapter::dispatcher;
use gitlab_adapter::gitlab::HttpGitLab;
use gitlab_adapter::hooks::HookManager;
use gitlab_adapter::http;
use gitlab_adapter::queue::{Context, TaskQueue};
use gitlab_adapter::store::PgStore;
use gitlab_adapter::tasklog::TaskLogRegistry;
use gitlab_adapter::tasks::periodic::{ImportServers, MaintainHooks, RetryFailedExports};

#[derive(Parser)]
#[command(name = "gitlab-adapter", about = "GitLab synchronization adapter")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sync service: task queue, change listener, HTTP surface.
    Serve,
    /// Apply pending database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve => serve(config).await,
        Command::Migrate => {
            let db = Db::connect(config.database_url.expose_secret()).await?;
            db.migrate().await?;
            info!("migrations applied");
            Ok(())
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let db = Db::connect(config.database_url.expose_secret())
        .await
        .context("connecting to database")?;
    db.migrate().await.context("running migrations")?;

    let queue = TaskQueue::new(Context {
        store: Arc::new(PgStore::new(db.pool().clone())),
        gitlab: Arc::new(HttpGitLab::new()),
        hooks: Arc::new(HookManager::new()),
        logs: Arc::new(TaskLogRegistry::new()),
    });
    queue.schedule(Box::new(MaintainHooks::new()));
    queue.schedule(Box::new(RetryFailedExports));
    queue.schedule(Box::new(ImportServers));
    queue.start().await;

    // Change notifications feed the dispatcher until shutdown.
    let mut changes = listen_for_changes(db.pool(), &config.notify_channel)
        .await
        .context("subscribing to change notifications")?;
    {
        let queue = queue.clone();
        tokio::spawn(async move {
            while let Some(event) = changes.recv().await {
                if let Err(e) = dispatcher::dispatch(&queue, &event).await {
                    error!(table = %event.table, "dispatch failed: {e}");
                }
            }
        });
    }

    let app = http::router(queue.clone());
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    queue.stop().await;
    queue.logs().shutdown().await;
    info!("shutdown complete");
    Ok(())
}
