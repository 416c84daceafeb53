//! Periodic tasks: recurring maintenance that re-arms itself after each
//! run. Instances are registered once with the queue, which drives their
//! start/run/stop lifecycle and re-arms the delay timer after every run.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, warn};

use crate::error::Result;
use crate::hooks::ACTION_INSTALL_SERVER_HOOKS;
use crate::model::{ACTION_EXPORT_ISSUE, GLOBAL_SCHEMA};
use crate::queue::TaskQueue;
use crate::tasks::Task;

/// A recurring task. `delay(true)` is the wait before the first run,
/// `delay(false)` the wait between subsequent runs.
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn priority(&self) -> i32 {
        0
    }

    fn delay(&self, initial: bool) -> Duration;

    async fn start(&mut self, _queue: &TaskQueue) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, queue: &TaskQueue) -> Result<()>;

    async fn stop(&mut self, _queue: &TaskQueue) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Hook maintenance
// ---------------------------------------------------------------------------

/// Retries hook installation for servers where it previously failed.
///
/// Failed installation passes leave failed task rows behind; each cycle
/// picks up the recent ones and runs the installation again. A successful
/// retry overwrites the same row, taking the server out of rotation.
pub struct MaintainHooks {
    retry_window: ChronoDuration,
}

impl MaintainHooks {
    pub fn new() -> Self {
        Self {
            retry_window: ChronoDuration::days(1),
        }
    }
}

impl Default for MaintainHooks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeriodicTask for MaintainHooks {
    fn name(&self) -> &'static str {
        "maintain-hooks"
    }

    fn delay(&self, initial: bool) -> Duration {
        if initial {
            Duration::from_secs(60)
        } else {
            Duration::from_secs(600)
        }
    }

    async fn run(&mut self, queue: &TaskQueue) -> Result<()> {
        let cutoff = Utc::now() - self.retry_window;
        let failed = queue
            .store()
            .find_failed_tasks(GLOBAL_SCHEMA, ACTION_INSTALL_SERVER_HOOKS, cutoff)
            .await?;
        if failed.is_empty() {
            return Ok(());
        }
        let host = queue
            .store()
            .get_system()
            .await?
            .and_then(|s| s.trimmed_address());
        let Some(host) = host else {
            // No public address yet; the rows stay failed and the next
            // cycle tries again.
            return Ok(());
        };
        for row in failed {
            let Some(server_id) = row.options["server_id"].as_i64() else {
                continue;
            };
            match queue.store().get_server(server_id).await? {
                Some(server) if server.is_usable() => {}
                _ => continue,
            }
            debug!(server_id, "retrying hook installation");
            if let Err(e) = queue
                .hooks()
                .install_server_hooks(
                    queue.store(),
                    queue.gitlab().as_ref(),
                    queue.logs(),
                    &host,
                    server_id,
                )
                .await
            {
                warn!(server_id, "hook installation still failing: {e}");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Export retry sweep
// ---------------------------------------------------------------------------

/// How far back the sweep looks for failed exports worth retrying.
const RETRY_WINDOW_DAYS: i64 = 3;

/// Re-queues failed issue exports that are recent enough to retry.
pub struct RetryFailedExports;

#[async_trait]
impl PeriodicTask for RetryFailedExports {
    fn name(&self) -> &'static str {
        "retry-failed-exports"
    }

    fn delay(&self, initial: bool) -> Duration {
        if initial {
            Duration::ZERO
        } else {
            Duration::from_secs(300)
        }
    }

    async fn run(&mut self, queue: &TaskQueue) -> Result<()> {
        let cutoff = Utc::now() - ChronoDuration::days(RETRY_WINDOW_DAYS);
        for schema in queue.store().schemas().await? {
            let rows = queue
                .store()
                .find_failed_tasks(&schema, ACTION_EXPORT_ISSUE, cutoff)
                .await?;
            for row in rows {
                let queued = queue.add(Task::ExportStory {
                    schema: schema.clone(),
                    task_id: row.id,
                });
                if queued {
                    debug!(schema, task_id = row.id, "retrying failed export");
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server sweep
// ---------------------------------------------------------------------------

/// Periodically refreshes repos and users from every usable server, so
/// the pipeline converges even when hook deliveries are lost.
pub struct ImportServers;

#[async_trait]
impl PeriodicTask for ImportServers {
    fn name(&self) -> &'static str {
        "import-servers"
    }

    fn delay(&self, initial: bool) -> Duration {
        if initial {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(600)
        }
    }

    async fn run(&mut self, queue: &TaskQueue) -> Result<()> {
        for server in queue.store().find_servers().await? {
            if !server.is_usable() {
                continue;
            }
            queue.add(Task::ImportRepos { server_id: server.id });
            queue.add(Task::ImportUsers { server_id: server.id });
        }
        Ok(())
    }
}
