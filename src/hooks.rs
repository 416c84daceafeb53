//! Idempotent installation and removal of GitLab webhooks.
//!
//! The callback URL is deterministic for a given host/server (and
//! repo/project for project hooks), and that URL is the idempotency key:
//! installation lists the hooks at the target scope, deletes any with a
//! matching URL, then creates a fresh one carrying a shared secret token.
//! Inbound deliveries must echo that token or are rejected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::json;
use tracing::info;

use crate::error::{Error, Result};
use crate::gitlab::GitLabApi;
use crate::model::{GLOBAL_SCHEMA, Project, Repo, Server};
use crate::store::Store;
use crate::tasklog::{TaskLog, TaskLogRegistry};

/// Action name of persisted server-wide hook installation passes. Failed
/// rows under this action drive the periodic retry.
pub const ACTION_INSTALL_SERVER_HOOKS: &str = "install-server-hooks";

/// Installs, removes, and verifies webhooks.
///
/// Owns the per-server secret tokens, generated at most once per process.
pub struct HookManager {
    secrets: Mutex<HashMap<i64, String>>,
}

impl HookManager {
    pub fn new() -> Self {
        Self {
            secrets: Mutex::new(HashMap::new()),
        }
    }

    /// The shared secret for a server, generating it on first use.
    pub fn hook_secret(&self, server_id: i64) -> String {
        let mut secrets = self.secrets.lock().unwrap();
        secrets
            .entry(server_id)
            .or_insert_with(|| {
                rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(32)
                    .map(char::from)
                    .collect()
            })
            .clone()
    }

    /// Check the token carried by an inbound hook delivery.
    pub fn verify_hook_secret(&self, server_id: i64, provided: &str) -> Result<()> {
        let secrets = self.secrets.lock().unwrap();
        match secrets.get(&server_id) {
            Some(secret) if secret == provided => Ok(()),
            _ => Err(Error::Forbidden),
        }
    }

    /// Callback URL for a server's system hook.
    pub fn system_hook_url(host: &str, server_id: i64) -> String {
        format!("{host}/hook/{server_id}")
    }

    /// Callback URL for a project hook.
    pub fn project_hook_url(host: &str, server_id: i64, repo_id: i64, project_id: i64) -> String {
        format!("{host}/hook/{server_id}/{repo_id}/{project_id}")
    }

    /// Install the system-level hook for a server. Idempotent: a stale hook
    /// at the same URL is deleted first.
    pub async fn install_system_hook(
        &self,
        gitlab: &dyn GitLabApi,
        host: &str,
        server: &Server,
    ) -> Result<()> {
        if host.is_empty() {
            return Err(Error::Precondition(
                "system address is not configured".to_string(),
            ));
        }
        let url = Self::system_hook_url(host, server.id);
        self.destroy_matching(gitlab, server, "/hooks", &url).await?;
        let payload = json!({
            "url": url,
            "push_events": false,
            "tag_push_events": false,
            "merge_requests_events": false,
            "enable_ssl_verification": false,
            "token": self.hook_secret(server.id),
        });
        gitlab.post(server, "/hooks", payload).await?;
        info!(server_id = server.id, "installed system hook");
        Ok(())
    }

    /// Remove the system-level hook. Nothing to do when no host is
    /// configured; hooks cannot exist without one.
    pub async fn remove_system_hook(
        &self,
        gitlab: &dyn GitLabApi,
        host: Option<&str>,
        server: &Server,
    ) -> Result<()> {
        let Some(host) = host else { return Ok(()) };
        let url = Self::system_hook_url(host, server.id);
        self.destroy_matching(gitlab, server, "/hooks", &url).await?;
        info!(server_id = server.id, "removed system hook");
        Ok(())
    }

    /// Install the hook on the GitLab project a repo links to, subscribing
    /// to the content events the importers consume.
    pub async fn install_project_hook(
        &self,
        gitlab: &dyn GitLabApi,
        host: &str,
        server: &Server,
        repo: &Repo,
        project: &Project,
    ) -> Result<()> {
        if host.is_empty() {
            return Err(Error::Precondition(
                "system address is not configured".to_string(),
            ));
        }
        let url = Self::project_hook_url(host, server.id, repo.id, project.id);
        let scope = format!("/projects/{}/hooks", repo.external.id);
        self.destroy_matching(gitlab, server, &scope, &url).await?;
        let payload = json!({
            "url": url,
            "push_events": true,
            "issues_events": true,
            "merge_requests_events": true,
            "tag_push_events": true,
            "note_events": true,
            "job_events": true,
            "pipeline_events": true,
            "wiki_page_events": true,
            "confidential_note_events": true,
            "confidential_issues_events": true,
            "enable_ssl_verification": false,
            "token": self.hook_secret(server.id),
        });
        gitlab.post(server, &scope, payload).await?;
        info!(
            server_id = server.id,
            repo_id = repo.id,
            project_id = project.id,
            "installed project hook"
        );
        Ok(())
    }

    /// Remove the hook on the GitLab project a repo links to.
    pub async fn remove_project_hook(
        &self,
        gitlab: &dyn GitLabApi,
        host: Option<&str>,
        server: &Server,
        repo: &Repo,
        project: &Project,
    ) -> Result<()> {
        let Some(host) = host else { return Ok(()) };
        let url = Self::project_hook_url(host, server.id, repo.id, project.id);
        let scope = format!("/projects/{}/hooks", repo.external.id);
        self.destroy_matching(gitlab, server, &scope, &url).await?;
        Ok(())
    }

    /// Delete every hook at `scope` whose URL matches `url`.
    async fn destroy_matching(
        &self,
        gitlab: &dyn GitLabApi,
        server: &Server,
        scope: &str,
        url: &str,
    ) -> Result<()> {
        let hooks = gitlab.fetch_all(server, scope).await?;
        for hook in hooks {
            if hook["url"].as_str() == Some(url)
                && let Some(id) = hook["id"].as_i64()
            {
                gitlab.delete(server, &format!("{scope}/{id}")).await?;
            }
        }
        Ok(())
    }

    /// Install the system hook plus every project hook for one server,
    /// reporting progress per hook. A failed pass leaves a failed task row
    /// behind; the periodic maintenance task retries those.
    pub async fn install_server_hooks(
        &self,
        store: &Arc<dyn Store>,
        gitlab: &dyn GitLabApi,
        logs: &Arc<TaskLogRegistry>,
        host: &str,
        server_id: i64,
    ) -> Result<()> {
        let log = TaskLog::start_saved(
            logs,
            store.clone(),
            GLOBAL_SCHEMA,
            ACTION_INSTALL_SERVER_HOOKS,
            json!({ "server_id": server_id }),
        );
        match self
            .server_hook_pass(store, gitlab, host, server_id, &log, true)
            .await
        {
            Ok(()) => {
                log.finish(None).await;
                Ok(())
            }
            Err(e) => {
                log.abort(&e).await;
                Err(e)
            }
        }
    }

    /// Remove the system hook plus every project hook for one server.
    pub async fn remove_server_hooks(
        &self,
        store: &Arc<dyn Store>,
        gitlab: &dyn GitLabApi,
        logs: &Arc<TaskLogRegistry>,
        host: &str,
        server_id: i64,
    ) -> Result<()> {
        let log = TaskLog::start_saved(
            logs,
            store.clone(),
            GLOBAL_SCHEMA,
            "remove-server-hooks",
            json!({ "server_id": server_id }),
        );
        match self
            .server_hook_pass(store, gitlab, host, server_id, &log, false)
            .await
        {
            Ok(()) => {
                log.finish(None).await;
                Ok(())
            }
            Err(e) => {
                log.abort(&e).await;
                Err(e)
            }
        }
    }

    /// System hook first, then every (repo, project) pair where the repo is
    /// a member of the project's repo list.
    async fn server_hook_pass(
        &self,
        store: &Arc<dyn Store>,
        gitlab: &dyn GitLabApi,
        host: &str,
        server_id: i64,
        log: &TaskLog,
        install: bool,
    ) -> Result<()> {
        let server = store
            .get_server(server_id)
            .await?
            .ok_or(Error::NotFound("server"))?;
        let repos = store.find_repos_of_server(server_id).await?;
        let projects = store.find_projects().await?;

        let mut pairs = Vec::new();
        for repo in &repos {
            if repo.deleted {
                continue;
            }
            for project in &projects {
                if project.repo_ids.contains(&repo.id) {
                    pairs.push((repo, project));
                }
            }
        }
        let total = 1 + pairs.len();

        if install {
            self.install_system_hook(gitlab, host, &server).await?;
        } else {
            self.remove_system_hook(gitlab, Some(host), &server).await?;
        }
        log.report(1, total);

        for (index, (repo, project)) in pairs.iter().enumerate() {
            if install {
                self.install_project_hook(gitlab, host, &server, repo, project)
                    .await?;
            } else {
                self.remove_project_hook(gitlab, Some(host), &server, repo, project)
                    .await?;
            }
            log.report(index + 2, total);
        }
        Ok(())
    }
}

impl Default for HookManager {
    fn default() -> Self {
        Self::new()
    }
}
