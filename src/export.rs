//! Issue export: push locally written issue stories out to GitLab.
//!
//! An export is driven by a persisted task row. The row doubles as the
//! progress record the UI watches: success stamps completion and the
//! created issue, failure records the error and leaves the row for the
//! retry sweep. Permanently failing rows are soft-deleted so they are
//! never retried.

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{ACTION_EXPORT_ISSUE, ExternalKey, Repo, TaskRow};
use crate::queue::TaskQueue;
use crate::tasks::Task;

/// Perform the export described by a persisted export-issue task row.
pub async fn export_story(queue: &TaskQueue, schema: &str, task_id: i64) -> Result<()> {
    let store = queue.store();
    let Some(row) = store.get_task(schema, task_id).await? else {
        return Err(Error::NotFound("task"));
    };
    if row.deleted || row.action != ACTION_EXPORT_ISSUE {
        debug!(task_id, "task row is not an active issue export, skipping");
        return Ok(());
    }
    let Some(story_id) = row.options["story_id"].as_i64() else {
        return Err(Error::Precondition("export task has no story_id".into()));
    };
    let Some(story) = store.get_story(schema, story_id).await? else {
        return Err(Error::NotFound("story"));
    };
    if story.deleted {
        debug!(story_id, "story was deleted, skipping export");
        return Ok(());
    }
    let repo = resolve_target_repo(queue, schema, &row).await?;
    let Some(server) = store.get_server(repo.external.server_id).await? else {
        return Err(Error::NotFound("server"));
    };
    if !server.is_usable() {
        return Err(Error::Precondition("server is not usable".into()));
    }

    let title = story.details["title"].as_str().unwrap_or("(no title)");
    let description = story.details["description"].as_str().unwrap_or("");
    let labels = story.details["labels"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default();
    let payload = json!({
        "title": title,
        "description": description,
        "labels": labels,
    });
    let uri = format!("/projects/{}/issues", repo.external.id);

    match queue.gitlab().post(&server, &uri, payload).await {
        Ok(issue) => {
            let issue_id = issue["id"].as_i64().unwrap_or(0);
            let now = Utc::now();

            let mut exported = story.clone();
            exported.external = Some(ExternalKey {
                server_id: server.id,
                id: issue_id,
            });
            exported.etime = Some(now);
            exported.mtime = now;
            store.save_story(schema, exported).await?;

            let mut done = row;
            done.completion = Some(100);
            done.failed = false;
            done.etime = Some(now);
            if let Value::Object(details) = &mut done.details {
                details.remove("error");
                details.insert(
                    "issue".to_string(),
                    json!({ "id": issue_id, "iid": issue["iid"], "web_url": issue["web_url"] }),
                );
            }
            store.save_task(schema, done).await?;
            info!(story_id, issue_id, "issue exported");
            Ok(())
        }
        Err(e) => {
            let mut failed = row;
            failed.failed = true;
            let mut detail = json!({ "message": e.to_string() });
            if let Some(status) = e.gitlab_status() {
                detail["status"] = status.into();
            }
            if let Value::Object(details) = &mut failed.details {
                details.insert("error".to_string(), detail);
            }
            // A client error will fail the same way every time, so the row
            // is retired instead of left for the retry sweep.
            if e.is_permanent() {
                failed.deleted = true;
                failed.etime = Some(Utc::now());
            }
            store.save_task(schema, failed).await?;
            Err(e)
        }
    }
}

/// Queue a fresh export after a user edited an already-exported issue
/// story.
pub async fn reexport_story(queue: &TaskQueue, schema: &str, story_id: i64) -> Result<()> {
    let store = queue.store();
    let Some(story) = store.get_story(schema, story_id).await? else {
        return Err(Error::NotFound("story"));
    };
    if story.deleted || story.is_self_caused() {
        return Ok(());
    }
    let options = json!({ "story_id": story_id });
    let Some(row) = store
        .find_task(schema, ACTION_EXPORT_ISSUE, &options)
        .await?
    else {
        debug!(story_id, "no export task for story, nothing to re-export");
        return Ok(());
    };
    if row.deleted {
        return Ok(());
    }
    // The exporting user must still be an author; otherwise the edit came
    // from someone who never asked for the export.
    if let Some(user_id) = row.user_id
        && !story.user_ids.contains(&user_id)
    {
        debug!(story_id, user_id, "exporting user no longer an author, skipping");
        return Ok(());
    }
    queue.add(Task::ExportStory {
        schema: schema.to_string(),
        task_id: row.id,
    });
    Ok(())
}

/// Pick the repo the issue goes to: the one named by the task row, or the
/// project's first live repo with issues enabled.
async fn resolve_target_repo(queue: &TaskQueue, schema: &str, row: &TaskRow) -> Result<Repo> {
    let store = queue.store();
    if let Some(repo_id) = row.options["repo_id"].as_i64() {
        return store
            .get_repo(repo_id)
            .await?
            .ok_or(Error::NotFound("repo"));
    }
    let Some(project) = store.find_project_by_name(schema).await? else {
        return Err(Error::NotFound("project"));
    };
    for repo_id in &project.repo_ids {
        if let Some(repo) = store.get_repo(*repo_id).await?
            && !repo.deleted
            && repo.issues_enabled
        {
            return Ok(repo);
        }
    }
    Err(Error::Precondition(
        "project has no repo with issues enabled".into(),
    ))
}
