//! Milestone import: milestones become stories in the activity feed.

use chrono::Utc;
use serde_json::json;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{ExternalKey, Story};
use crate::queue::TaskQueue;
use crate::tasklog::TaskLog;

pub async fn import_milestones(queue: &TaskQueue, repo_id: i64, project_id: i64) -> Result<()> {
    let store = queue.store();
    let Some(repo) = store.get_repo(repo_id).await? else {
        return Err(Error::NotFound("repo"));
    };
    let Some(project) = store.get_project(project_id).await? else {
        return Err(Error::NotFound("project"));
    };
    let Some(server) = store.get_server(repo.external.server_id).await? else {
        return Err(Error::NotFound("server"));
    };
    if !server.is_usable() {
        debug!(server_id = server.id, "server not usable, skipping milestone import");
        return Ok(());
    }
    let schema = project.name.clone();
    let log = TaskLog::start_saved(
        queue.logs(),
        store.clone(),
        &schema,
        "import-milestones",
        json!({ "repo_id": repo_id, "project_id": project_id }),
    );
    match reconcile(queue, &schema, &repo, &server, &log).await {
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
    schema: &str,
    repo: &crate::model::Repo,
    server: &crate::model::Server,
    log: &TaskLog,
) -> Result<()> {
    let store = queue.store();
    // Other repos of the same project keep their milestone stories; only
    // this repo's rows take part in the reconcile.
    let local: Vec<Story> = store
        .find_stories_of_kind(schema, "milestone")
        .await?
        .into_iter()
        .filter(|s| s.details["repo_id"].as_i64() == Some(repo.id))
        .collect();
    let uri = format!("/projects/{}/milestones", repo.external.id);
    let live = queue.gitlab().fetch_all(server, &uri).await?;

    for story in &local {
        let Some(key) = story.external else { continue };
        let still_there =
            key.server_id == server.id && live.iter().any(|v| v["id"].as_i64() == Some(key.id));
        if !story.deleted && !still_there {
            let mut gone = story.clone();
            gone.deleted = true;
            gone.mtime = Utc::now();
            store.save_story(schema, gone).await?;
            log.append("deleted", format!("milestone #{}", key.id));
        }
    }

    let total = live.len().max(1);
    for (index, entry) in live.iter().enumerate() {
        let Some(external_id) = entry["id"].as_i64() else {
            continue;
        };
        let key = ExternalKey {
            server_id: server.id,
            id: external_id,
        };
        let title = entry["title"].as_str().unwrap_or_default();
        let details = json!({
            "repo_id": repo.id,
            "title": title,
            "state": entry["state"],
            "due_date": entry["due_date"],
            "start_date": entry["start_date"],
        });

        let existing = local.iter().find(|s| s.external == Some(key));
        match existing {
            Some(existing) => {
                let mut merged = existing.clone();
                merged.deleted = false;
                merged.details = details;
                if merged != *existing {
                    merged.mtime = Utc::now();
                    merged.itime = Some(merged.mtime);
                    store.save_story(schema, merged).await?;
                    log.append("modified", title);
                }
            }
            None => {
                let now = Utc::now();
                let story = Story {
                    id: 0,
                    deleted: false,
                    kind: "milestone".to_string(),
                    details,
                    user_ids: Vec::new(),
                    external: Some(key),
                    mtime: now,
                    itime: Some(now),
                    etime: None,
                };
                store.save_story(schema, story).await?;
                log.append("added", title);
            }
        }
        log.report(index + 1, total);
    }
    Ok(())
}
