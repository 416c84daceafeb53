//! Template repo snapshots.
//!
//! Template repos carry website content in their tree. A snapshot pins
//! the head commit of the default branch, so file retrieval stays
//! consistent while the repo moves on.

use serde_json::json;
use tracing::debug;

use crate::error::{Error, Result};
use crate::gitlab::GitLabApi;
use crate::model::GLOBAL_SCHEMA;
use crate::queue::TaskQueue;
use crate::store::Store;
use crate::tasklog::TaskLog;

/// Record the current head of the default branch as the repo's snapshot.
pub async fn import_snapshot(queue: &TaskQueue, repo_id: i64) -> Result<()> {
    let store = queue.store();
    let Some(repo) = store.get_repo(repo_id).await? else {
        return Err(Error::NotFound("repo"));
    };
    if repo.template != Some(true) {
        debug!(repo_id, "repo is not a template, skipping snapshot");
        return Ok(());
    }
    let Some(server) = store.get_server(repo.external.server_id).await? else {
        return Err(Error::NotFound("server"));
    };
    if !server.is_usable() {
        debug!(server_id = server.id, "server not usable, skipping snapshot");
        return Ok(());
    }
    let log = TaskLog::start_saved(
        queue.logs(),
        store.clone(),
        GLOBAL_SCHEMA,
        "import-snapshot",
        json!({ "repo_id": repo_id }),
    );

    let result: Result<()> = async {
        let branch = repo.default_branch.as_deref().unwrap_or("master");
        let uri = format!(
            "/projects/{}/repository/branches/{}",
            repo.external.id,
            percent_encode(branch)
        );
        let info = queue.gitlab().fetch(&server, &uri).await?;
        let Some(commit) = info["commit"]["id"].as_str() else {
            return Err(Error::Precondition("branch has no head commit".into()));
        };
        if repo.snapshot_commit.as_deref() != Some(commit) {
            let mut updated = repo.clone();
            updated.snapshot_commit = Some(commit.to_string());
            store.save_repo(updated).await?;
            log.append("snapshot", commit);
        }
        log.report(1, 1);
        Ok(())
    }
    .await;

    match result {
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

/// Decide whether a repo is a template by looking for a `www` folder at
/// the root of its tree.
pub async fn detect_template(queue: &TaskQueue, repo_id: i64) -> Result<()> {
    let store = queue.store();
    let Some(repo) = store.get_repo(repo_id).await? else {
        return Err(Error::NotFound("repo"));
    };
    let Some(server) = store.get_server(repo.external.server_id).await? else {
        return Err(Error::NotFound("server"));
    };
    if !server.is_usable() {
        debug!(server_id = server.id, "server not usable, skipping template detection");
        return Ok(());
    }
    let uri = format!("/projects/{}/repository/tree", repo.external.id);
    let tree = queue.gitlab().fetch_all(&server, &uri).await?;
    let has_www = tree
        .iter()
        .any(|v| v["type"].as_str() == Some("tree") && v["name"].as_str() == Some("www"));
    if repo.template != Some(has_www) {
        let mut updated = repo.clone();
        updated.template = Some(has_www);
        store.save_repo(updated).await?;
        debug!(repo_id, template = has_www, "template detection updated repo");
    }
    Ok(())
}

/// Fetch one file out of a project's pinned template snapshot.
///
/// Walks project -> template repo -> server, then pulls the raw blob at
/// the snapshot commit. Any missing link in the chain is a not-found.
pub async fn retrieve_snapshot_file(
    store: &dyn Store,
    gitlab: &dyn GitLabApi,
    schema: &str,
    commit: &str,
    file_type: &str,
    path: &str,
) -> Result<Vec<u8>> {
    let Some(project) = store.find_project_by_name(schema).await? else {
        return Err(Error::NotFound("project"));
    };
    let Some(repo_id) = project.template_repo_id else {
        return Err(Error::NotFound("template repo"));
    };
    let Some(repo) = store.get_repo(repo_id).await? else {
        return Err(Error::NotFound("repo"));
    };
    let Some(server) = store.get_server(repo.external.server_id).await? else {
        return Err(Error::NotFound("server"));
    };
    let full_path = format!("{file_type}/{path}");
    let uri = format!(
        "/projects/{}/repository/files/{}/raw?ref={}",
        repo.external.id,
        percent_encode(&full_path),
        commit
    );
    gitlab.fetch_raw(&server, &uri).await
}

/// Minimal percent-encoding for path segments embedded in API URLs.
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::percent_encode;

    #[test]
    fn encodes_path_separators() {
        assert_eq!(percent_encode("www/index.html"), "www%2Findex.html");
    }

    #[test]
    fn passes_safe_characters_through() {
        assert_eq!(percent_encode("README.md"), "README.md");
    }
}
