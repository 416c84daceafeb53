//! Maps row-change notifications to queued tasks.
//!
//! Each rule looks at which top-level fields changed and the before/after
//! row images, and enqueues the tasks that bring the rest of the system
//! back in sync. Dispatch never does the work itself; the queue's
//! deduplication absorbs notification bursts.

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::debug;

use crate::db::{ChangeEvent, ChangeOp};
use crate::error::Result;
use crate::model::{ACTION_EXPORT_ISSUE, GLOBAL_SCHEMA, trim_address};
use crate::queue::TaskQueue;
use crate::tasks::Task;

pub async fn dispatch(queue: &TaskQueue, event: &ChangeEvent) -> Result<()> {
    debug!(table = %event.table, id = event.id, op = ?event.op, "change event");
    match event.table.as_str() {
        "server" => on_server_change(queue, event).await,
        "project" => on_project_change(queue, event).await,
        "repo" => on_repo_change(queue, event).await,
        "story" => on_story_change(queue, event).await,
        "task" => on_task_change(queue, event).await,
        "wiki" => on_wiki_change(queue, event).await,
        "system" => on_system_change(queue, event).await,
        _ => Ok(()),
    }
}

/// Hook callback host from the current system settings.
async fn current_host(queue: &TaskQueue) -> Result<Option<String>> {
    Ok(queue
        .store()
        .get_system()
        .await?
        .and_then(|s| s.trimmed_address()))
}

fn as_bool(row: &Value, field: &str) -> bool {
    row[field].as_bool().unwrap_or(false)
}

fn usable(row: &Value) -> bool {
    !as_bool(row, "deleted")
        && !as_bool(row, "disabled")
        && row["api_url"].as_str().is_some()
        && row["api_token"].as_str().is_some()
}

async fn on_server_change(queue: &TaskQueue, event: &ChangeEvent) -> Result<()> {
    let server_id = event.id;
    let was_usable = usable(&event.previous);
    let is_usable = usable(&event.current);

    if event.changed("deleted") || event.changed("disabled") {
        if let Some(host) = current_host(queue).await? {
            if is_usable && !was_usable {
                queue.add(Task::InstallServerHooks { host, server_id });
            } else if was_usable && !is_usable {
                queue.add(Task::RemoveServerHooks { host, server_id });
            }
        }
    }
    if is_usable && (event.changed("api_url") || event.changed("api_token") || !was_usable) {
        queue.add(Task::ImportRepos { server_id });
        queue.add(Task::ImportUsers { server_id });
    }
    Ok(())
}

fn id_list(row: &Value, field: &str) -> Vec<i64> {
    row[field]
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}

/// A repo is connected in a given row image when the project is live and
/// lists it as a member.
fn row_connected(row: &Value, repo_id: i64) -> bool {
    !as_bool(row, "archived")
        && !as_bool(row, "deleted")
        && id_list(row, "repo_ids").contains(&repo_id)
}

async fn on_project_change(queue: &TaskQueue, event: &ChangeEvent) -> Result<()> {
    if !(event.changed("archived") || event.changed("deleted") || event.changed("repo_ids")) {
        return Ok(());
    }
    let project_id = event.id;
    let store = queue.store();
    let host = current_host(queue).await?;

    // Every repo the project listed before or after the change gets a
    // connectivity decision; only those whose connectivity actually
    // flipped produce work.
    let affected: BTreeSet<i64> = id_list(&event.previous, "repo_ids")
        .into_iter()
        .chain(id_list(&event.current, "repo_ids"))
        .collect();

    for repo_id in affected {
        let before = row_connected(&event.previous, repo_id);
        let after = row_connected(&event.current, repo_id);
        if before == after {
            continue;
        }
        let Some(repo) = store.get_repo(repo_id).await? else {
            continue;
        };
        let server_id = repo.external.server_id;
        if after {
            if let Some(host) = host.clone() {
                queue.add(Task::InstallProjectHook { host, server_id, repo_id, project_id });
            }
            queue.add(Task::ImportRepoEvents { repo_id, project_id });
            queue.add(Task::ImportWikis { repo_id, project_id });
            queue.add(Task::ImportMilestones { repo_id, project_id });
        } else {
            if let Some(host) = host.clone() {
                queue.add(Task::RemoveProjectHook { host, server_id, repo_id, project_id });
            }
            queue.add(Task::RemoveWikis { repo_id, project_id });
        }
    }
    Ok(())
}

async fn on_repo_change(queue: &TaskQueue, event: &ChangeEvent) -> Result<()> {
    if !event.changed("template") {
        return Ok(());
    }
    let repo_id = event.id;
    match &event.current["template"] {
        Value::Bool(true) => {
            queue.add(Task::ImportSnapshot { repo_id });
        }
        Value::Null => {
            // The flag was reset; figure out afresh whether the repo is
            // a template.
            queue.add(Task::DetectTemplate { repo_id });
        }
        _ => {}
    }
    Ok(())
}

async fn on_story_change(queue: &TaskQueue, event: &ChangeEvent) -> Result<()> {
    if event.schema == GLOBAL_SCHEMA
        || event.current["type"].as_str() != Some("issue")
        || as_bool(&event.current, "deleted")
        || !event.changed("details")
    {
        return Ok(());
    }
    // Rows the importers or the exporter just wrote come back as change
    // events too; only genuine user edits trigger a re-export. The check
    // is repeated inside the task against the fresh row.
    let mtime = &event.current["mtime"];
    if !mtime.is_null()
        && (event.current["itime"] == *mtime || event.current["etime"] == *mtime)
    {
        return Ok(());
    }
    queue.add(Task::ReexportStory {
        schema: event.schema.clone(),
        story_id: event.id,
    });
    Ok(())
}

async fn on_task_change(queue: &TaskQueue, event: &ChangeEvent) -> Result<()> {
    if event.schema == GLOBAL_SCHEMA
        || event.current["action"].as_str() != Some(ACTION_EXPORT_ISSUE)
        || as_bool(&event.current, "deleted")
        || !(event.op == ChangeOp::Insert || event.changed("options"))
    {
        return Ok(());
    }
    queue.add(Task::ExportStory {
        schema: event.schema.clone(),
        task_id: event.id,
    });
    Ok(())
}

async fn on_wiki_change(queue: &TaskQueue, event: &ChangeEvent) -> Result<()> {
    if event.op != ChangeOp::Update || !event.changed("chosen") {
        return Ok(());
    }
    let Some(repo_id) = event.current["repo_id"].as_i64() else {
        return Ok(());
    };
    queue.add(Task::ReimportWiki {
        schema: event.schema.clone(),
        repo_id,
    });
    Ok(())
}

async fn on_system_change(queue: &TaskQueue, event: &ChangeEvent) -> Result<()> {
    if !event.changed("address") {
        return Ok(());
    }
    let old = trim_address(event.previous["address"].as_str());
    let new = trim_address(event.current["address"].as_str());
    if old == new {
        return Ok(()); // cosmetic change only
    }
    if let Some(host) = old {
        queue.add(Task::RemoveHooks { host });
    }
    if let Some(host) = new {
        queue.add(Task::InstallHooks { host });
    }
    Ok(())
}
