//! One-shot task definitions.
//!
//! A [`Task`] is a plain value: variant plus identifying parameters.
//! Structural equality is what the queue dedupes on, so two triggers for
//! the same resource produce one unit of work while triggers for
//! different resources never collapse.

pub mod periodic;

use std::fmt;

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::queue::TaskQueue;
use crate::{export, import};

/// A unit of work the queue can execute.
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    ImportRepos { server_id: i64 },
    ImportUsers { server_id: i64 },
    InstallHooks { host: String },
    RemoveHooks { host: String },
    InstallServerHooks { host: String, server_id: i64 },
    RemoveServerHooks { host: String, server_id: i64 },
    InstallProjectHook { host: String, server_id: i64, repo_id: i64, project_id: i64 },
    RemoveProjectHook { host: String, server_id: i64, repo_id: i64, project_id: i64 },
    ImportRepoEvents { repo_id: i64, project_id: i64 },
    ImportWikis { repo_id: i64, project_id: i64 },
    RemoveWikis { repo_id: i64, project_id: i64 },
    ReimportWiki { schema: String, repo_id: i64 },
    ImportMilestones { repo_id: i64, project_id: i64 },
    ProcessSystemHookEvent { server_id: i64, payload: Value },
    ProcessProjectHookEvent { repo_id: i64, project_id: i64, payload: Value },
    ExportStory { schema: String, task_id: i64 },
    ReexportStory { schema: String, story_id: i64 },
    ImportSnapshot { repo_id: i64 },
    DetectTemplate { repo_id: i64 },
}

impl Task {
    /// One-shot tasks all outrank periodic ones (which default to 0).
    pub fn priority(&self) -> i32 {
        1
    }

    pub async fn run(&self, queue: &TaskQueue) -> Result<()> {
        match self {
            Task::ImportRepos { server_id } => import::repos::import_repos(queue, *server_id).await,
            Task::ImportUsers { server_id } => import::users::import_users(queue, *server_id).await,
            Task::InstallHooks { host } => {
                for server in queue.store().find_servers().await? {
                    if !server.is_usable() {
                        continue;
                    }
                    if let Err(e) = queue
                        .hooks()
                        .install_server_hooks(
                            queue.store(),
                            queue.gitlab().as_ref(),
                            queue.logs(),
                            host,
                            server.id,
                        )
                        .await
                    {
                        debug!(server_id = server.id, "hook installation failed: {e}");
                    }
                }
                Ok(())
            }
            Task::RemoveHooks { host } => {
                for server in queue.store().find_servers().await? {
                    if server.api_url.is_none() || server.api_token.is_none() {
                        continue;
                    }
                    if let Err(e) = queue
                        .hooks()
                        .remove_server_hooks(
                            queue.store(),
                            queue.gitlab().as_ref(),
                            queue.logs(),
                            host,
                            server.id,
                        )
                        .await
                    {
                        debug!(server_id = server.id, "hook removal failed: {e}");
                    }
                }
                Ok(())
            }
            Task::InstallServerHooks { host, server_id } => {
                queue
                    .hooks()
                    .install_server_hooks(
                        queue.store(),
                        queue.gitlab().as_ref(),
                        queue.logs(),
                        host,
                        *server_id,
                    )
                    .await
            }
            Task::RemoveServerHooks { host, server_id } => {
                queue
                    .hooks()
                    .remove_server_hooks(
                        queue.store(),
                        queue.gitlab().as_ref(),
                        queue.logs(),
                        host,
                        *server_id,
                    )
                    .await
            }
            Task::InstallProjectHook { host, server_id, repo_id, project_id } => {
                let (server, repo, project) =
                    resolve_hook_rows(queue, *server_id, *repo_id, *project_id).await?;
                queue
                    .hooks()
                    .install_project_hook(
                        queue.gitlab().as_ref(),
                        host,
                        &server,
                        &repo,
                        &project,
                    )
                    .await
            }
            Task::RemoveProjectHook { host, server_id, repo_id, project_id } => {
                let (server, repo, project) =
                    resolve_hook_rows(queue, *server_id, *repo_id, *project_id).await?;
                queue
                    .hooks()
                    .remove_project_hook(
                        queue.gitlab().as_ref(),
                        Some(host),
                        &server,
                        &repo,
                        &project,
                    )
                    .await
            }
            Task::ImportRepoEvents { repo_id, project_id } => {
                import::events::import_repo_events(queue, *repo_id, *project_id).await
            }
            Task::ImportWikis { repo_id, project_id } => {
                import::wiki::import_wikis(queue, *repo_id, *project_id).await
            }
            Task::RemoveWikis { repo_id, project_id } => {
                import::wiki::remove_wikis(queue, *repo_id, *project_id).await
            }
            Task::ReimportWiki { schema, repo_id } => {
                import::wiki::reimport_wikis(queue, schema, *repo_id).await
            }
            Task::ImportMilestones { repo_id, project_id } => {
                import::milestones::import_milestones(queue, *repo_id, *project_id).await
            }
            Task::ProcessSystemHookEvent { server_id, payload } => {
                import::events::process_system_hook_event(queue, *server_id, payload).await
            }
            Task::ProcessProjectHookEvent { repo_id, project_id, payload } => {
                import::events::process_project_hook_event(queue, *repo_id, *project_id, payload)
                    .await
            }
            Task::ExportStory { schema, task_id } => {
                export::export_story(queue, schema, *task_id).await
            }
            Task::ReexportStory { schema, story_id } => {
                export::reexport_story(queue, schema, *story_id).await
            }
            Task::ImportSnapshot { repo_id } => {
                import::snapshot::import_snapshot(queue, *repo_id).await
            }
            Task::DetectTemplate { repo_id } => {
                import::snapshot::detect_template(queue, *repo_id).await
            }
        }
    }
}

async fn resolve_hook_rows(
    queue: &TaskQueue,
    server_id: i64,
    repo_id: i64,
    project_id: i64,
) -> Result<(crate::model::Server, crate::model::Repo, crate::model::Project)> {
    let store = queue.store();
    let server = store
        .get_server(server_id)
        .await?
        .ok_or(Error::NotFound("server"))?;
    let repo = store
        .get_repo(repo_id)
        .await?
        .ok_or(Error::NotFound("repo"))?;
    let project = store
        .get_project(project_id)
        .await?
        .ok_or(Error::NotFound("project"))?;
    Ok((server, repo, project))
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Task::ImportRepos { .. } => "import-repos",
            Task::ImportUsers { .. } => "import-users",
            Task::InstallHooks { .. } => "install-hooks",
            Task::RemoveHooks { .. } => "remove-hooks",
            Task::InstallServerHooks { .. } => "install-server-hooks",
            Task::RemoveServerHooks { .. } => "remove-server-hooks",
            Task::InstallProjectHook { .. } => "install-project-hook",
            Task::RemoveProjectHook { .. } => "remove-project-hook",
            Task::ImportRepoEvents { .. } => "import-repo-events",
            Task::ImportWikis { .. } => "import-wikis",
            Task::RemoveWikis { .. } => "remove-wikis",
            Task::ReimportWiki { .. } => "reimport-wiki",
            Task::ImportMilestones { .. } => "import-milestones",
            Task::ProcessSystemHookEvent { .. } => "process-system-hook-event",
            Task::ProcessProjectHookEvent { .. } => "process-project-hook-event",
            Task::ExportStory { .. } => "export-story",
            Task::ReexportStory { .. } => "reexport-story",
            Task::ImportSnapshot { .. } => "import-snapshot",
            Task::DetectTemplate { .. } => "detect-template",
        };
        f.write_str(name)
    }
}
