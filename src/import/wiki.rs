//! Wiki page import and visibility resolution.
//!
//! A page is public when it is explicitly chosen, or when some public page
//! links to it, transitively, through references detected in page
//! content. Reference graphs can contain cycles, so resolution runs as a
//! worklist traversal with a visited set: each page is expanded at most
//! once, which makes termination self-evident.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use serde_json::json;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{ExternalKey, Wiki};
use crate::queue::TaskQueue;
use crate::tasklog::TaskLog;

/// A node in the reference graph, as far as visibility is concerned.
pub struct PageRef {
    pub slug: String,
    pub chosen: bool,
    pub references: Vec<String>,
}

/// Slugs of every page reachable from a chosen page (chosen pages
/// included).
pub fn resolve_public(pages: &[PageRef]) -> HashSet<String> {
    let by_slug: HashMap<&str, &PageRef> =
        pages.iter().map(|p| (p.slug.as_str(), p)).collect();
    let mut public = HashSet::new();
    let mut worklist: VecDeque<&str> = pages
        .iter()
        .filter(|p| p.chosen)
        .map(|p| p.slug.as_str())
        .collect();

    while let Some(slug) = worklist.pop_front() {
        if !public.insert(slug.to_string()) {
            continue; // already expanded
        }
        if let Some(page) = by_slug.get(slug) {
            for target in &page.references {
                if !public.contains(target.as_str()) {
                    worklist.push_back(target);
                }
            }
        }
    }
    public
}

/// Slugs of other pages referenced from page content.
///
/// Picks up `[[slug]]` wiki links and relative markdown link targets;
/// absolute URLs and anchors are not references to sibling pages.
pub fn extract_references(content: &str) -> Vec<String> {
    let mut refs = Vec::new();
    let mut push = |slug: &str| {
        let slug = slug.trim().trim_start_matches("./");
        let slug = slug.split('#').next().unwrap_or("");
        if !slug.is_empty()
            && !slug.contains("://")
            && !slug.starts_with('/')
            && !refs.iter().any(|r| r == slug)
        {
            refs.push(slug.to_string());
        }
    };

    let mut i = 0;
    while i < content.len() {
        if !content.is_char_boundary(i) {
            i += 1;
            continue;
        }
        if content[i..].starts_with("[[") {
            if let Some(end) = content[i + 2..].find("]]") {
                push(&content[i + 2..i + 2 + end]);
                i += end + 4;
                continue;
            }
        } else if content[i..].starts_with("](") {
            if let Some(end) = content[i + 2..].find(')') {
                push(&content[i + 2..i + 2 + end]);
                i += end + 3;
                continue;
            }
        }
        i += 1;
    }
    refs
}

/// Reconcile a repo's wiki pages against the live list on GitLab.
pub async fn import_wikis(queue: &TaskQueue, repo_id: i64, project_id: i64) -> Result<()> {
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
        debug!(server_id = server.id, "server not usable, skipping wiki import");
        return Ok(());
    }
    let schema = project.name.clone();
    let log = TaskLog::start_saved(
        queue.logs(),
        store.clone(),
        &schema,
        "import-wikis",
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
    let gitlab = queue.gitlab();
    let local = store.find_wikis(schema, repo.id).await?;
    let uri = format!("/projects/{}/wikis?with_content=1", repo.external.id);
    let live = gitlab.fetch_all(server, &uri).await?;

    // Pages gone from GitLab get soft-deleted, never removed.
    for wiki in &local {
        let still_there = live
            .iter()
            .any(|v| v["slug"].as_str() == Some(wiki.slug.as_str()));
        if !wiki.deleted && !still_there {
            let mut gone = wiki.clone();
            gone.deleted = true;
            gone.mtime = Utc::now();
            store.save_wiki(schema, gone).await?;
            log.append("deleted", wiki.slug.clone());
        }
    }

    // Resolve visibility over the live reference graph, with chosen flags
    // taken from the local rows.
    let pages: Vec<PageRef> = live
        .iter()
        .filter_map(|v| {
            let slug = v["slug"].as_str()?;
            Some(PageRef {
                slug: slug.to_string(),
                chosen: local
                    .iter()
                    .any(|w| w.slug == slug && w.chosen && !w.deleted),
                references: extract_references(v["content"].as_str().unwrap_or("")),
            })
        })
        .collect();
    let public = resolve_public(&pages);

    let total = live.len().max(1);
    for (index, entry) in live.iter().enumerate() {
        let Some(slug) = entry["slug"].as_str() else {
            continue;
        };
        let title = entry["title"].as_str().unwrap_or(slug).to_string();
        let content = entry["content"].as_str().map(str::to_string);
        let references = extract_references(content.as_deref().unwrap_or(""));

        match local.iter().find(|w| w.slug == slug) {
            Some(existing) => {
                let mut merged = existing.clone();
                merged.deleted = false;
                merged.title = title;
                merged.content = content;
                merged.references = references;
                merged.public = merged.chosen || public.contains(slug);
                // Keep the old mtime for comparison; only a real change
                // should bump it.
                merged.mtime = existing.mtime;
                if merged != *existing {
                    merged.mtime = Utc::now();
                    store.save_wiki(schema, merged).await?;
                    log.append("modified", slug);
                }
            }
            None => {
                let wiki = Wiki {
                    id: 0,
                    deleted: false,
                    repo_id: repo.id,
                    external: ExternalKey {
                        server_id: server.id,
                        id: repo.external.id,
                    },
                    slug: slug.to_string(),
                    title,
                    content,
                    references,
                    chosen: false,
                    public: public.contains(slug),
                    hidden: false,
                    mtime: Utc::now(),
                };
                store.save_wiki(schema, wiki).await?;
                log.append("added", slug);
            }
        }
        log.report(index + 1, total);
    }
    Ok(())
}

/// Soft-delete every wiki page of a repo that left a project.
pub async fn remove_wikis(queue: &TaskQueue, repo_id: i64, project_id: i64) -> Result<()> {
    let store = queue.store();
    let Some(project) = store.get_project(project_id).await? else {
        return Err(Error::NotFound("project"));
    };
    let schema = project.name.clone();
    let log = TaskLog::start_saved(
        queue.logs(),
        store.clone(),
        &schema,
        "remove-wikis",
        json!({ "repo_id": repo_id, "project_id": project_id }),
    );
    let wikis = match store.find_wikis(&schema, repo_id).await {
        Ok(wikis) => wikis,
        Err(e) => {
            log.abort(&e).await;
            return Err(e);
        }
    };
    for wiki in wikis {
        if wiki.deleted {
            continue;
        }
        let slug = wiki.slug.clone();
        let mut gone = wiki;
        gone.deleted = true;
        gone.mtime = Utc::now();
        if let Err(e) = store.save_wiki(&schema, gone).await {
            log.abort(&e).await;
            return Err(e);
        }
        log.append("deleted", slug);
    }
    log.finish(None).await;
    Ok(())
}

/// Full re-scan of a repo's wikis after a `chosen` flip; visibility of
/// referencing and referenced pages may change transitively.
pub async fn reimport_wikis(queue: &TaskQueue, schema: &str, repo_id: i64) -> Result<()> {
    let store = queue.store();
    let Some(project) = store.find_project_by_name(schema).await? else {
        return Err(Error::NotFound("project"));
    };
    import_wikis(queue, repo_id, project.id).await
}
