//! Repo import: reconcile local repo rows against a server's project list.

use serde_json::json;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{ExternalKey, GLOBAL_SCHEMA, Repo};
use crate::queue::TaskQueue;
use crate::tasklog::TaskLog;

pub async fn import_repos(queue: &TaskQueue, server_id: i64) -> Result<()> {
    let store = queue.store();
    let Some(server) = store.get_server(server_id).await? else {
        return Err(Error::NotFound("server"));
    };
    if !server.is_usable() {
        debug!(server_id, "server not usable, skipping repo import");
        return Ok(());
    }
    let log = TaskLog::start_saved(
        queue.logs(),
        store.clone(),
        GLOBAL_SCHEMA,
        "import-repos",
        json!({ "server_id": server_id }),
    );
    match reconcile(queue, &server, &log).await {
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

async fn reconcile(
    queue: &TaskQueue,
    server: &crate::model::Server,
    log: &TaskLog,
) -> Result<()> {
    let store = queue.store();
    let local = store.find_repos_of_server(server.id).await?;
    let live = queue.gitlab().fetch_all(server, "/projects").await?;

    for repo in &local {
        let still_there = live.iter().any(|v| v["id"].as_i64() == Some(repo.external.id));
        if !repo.deleted && !still_there {
            let mut gone = repo.clone();
            gone.deleted = true;
            store.save_repo(gone).await?;
            log.append("deleted", repo.name.clone());
        }
    }

    let total = live.len().max(1);
    for (index, entry) in live.iter().enumerate() {
        let Some(external_id) = entry["id"].as_i64() else {
            continue;
        };
        let name = entry["name"].as_str().unwrap_or_default().to_string();
        match local.iter().find(|r| r.external.id == external_id) {
            Some(existing) => {
                let mut merged = existing.clone();
                merged.deleted = false;
                apply_external_fields(&mut merged, entry);
                if merged != *existing {
                    let name = merged.name.clone();
                    store.save_repo(merged).await?;
                    log.append("modified", name);
                }
            }
            None => {
                let mut repo = Repo {
                    id: 0,
                    deleted: false,
                    external: ExternalKey {
                        server_id: server.id,
                        id: external_id,
                    },
                    name,
                    default_branch: None,
                    archived: false,
                    issues_enabled: false,
                    web_url: None,
                    template: None,
                    snapshot_commit: None,
                };
                apply_external_fields(&mut repo, entry);
                let name = repo.name.clone();
                store.save_repo(repo).await?;
                log.append("added", name);
            }
        }
        log.report(index + 1, total);
    }
    Ok(())
}

/// Overwrite the externally-sourced fields only; `template`,
/// `snapshot_commit`, and anything else set locally survives.
fn apply_external_fields(repo: &mut Repo, entry: &serde_json::Value) {
    if let Some(name) = entry["name"].as_str() {
        repo.name = name.to_string();
    }
    repo.default_branch = entry["default_branch"].as_str().map(str::to_string);
    repo.archived = entry["archived"].as_bool().unwrap_or(false);
    repo.issues_enabled = entry["issues_enabled"].as_bool().unwrap_or(false);
    repo.web_url = entry["web_url"].as_str().map(str::to_string);
}
