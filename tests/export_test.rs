mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use common::{MockGitLab, test_queue, usable_server};
use gitlab_adapter::export::export_story;
use gitlab_adapter::model::{ACTION_EXPORT_ISSUE, ExternalKey, Project, Repo, Story, TaskRow};
use gitlab_adapter::store::{MemStore, Store};

async fn seed(store: &Arc<MemStore>) -> (i64, i64) {
    store.put_server(usable_server(1));
    let repo = store
        .save_repo(Repo {
            id: 0,
            deleted: false,
            external: ExternalKey { server_id: 1, id: 7 },
            name: "widget".to_string(),
            default_branch: Some("main".to_string()),
            archived: false,
            issues_enabled: true,
            web_url: None,
            template: None,
            snapshot_commit: None,
        })
        .await
        .unwrap();
    store.put_project(Project {
        id: 500,
        deleted: false,
        archived: false,
        name: "widget".to_string(),
        repo_ids: vec![repo.id],
        user_ids: vec![3],
        template_repo_id: None,
    });

    let story = store
        .save_story(
            "widget",
            Story {
                id: 0,
                deleted: false,
                kind: "issue".to_string(),
                details: json!({ "title": "Crash on save", "description": "Steps..." }),
                user_ids: vec![3],
                external: None,
                mtime: Utc::now(),
                itime: None,
                etime: None,
            },
        )
        .await
        .unwrap();
    let row = store
        .save_task(
            "widget",
            TaskRow {
                id: 0,
                deleted: false,
                action: ACTION_EXPORT_ISSUE.to_string(),
                options: json!({ "story_id": story.id }),
                completion: None,
                details: json!({}),
                failed: false,
                user_id: Some(3),
                ctime: Utc::now(),
                etime: None,
                token: None,
            },
        )
        .await
        .unwrap();
    (story.id, row.id)
}

#[tokio::test]
async fn successful_export_stamps_story_and_task_row() {
    let store = Arc::new(MemStore::new());
    let (story_id, task_id) = seed(&store).await;
    let gitlab = Arc::new(MockGitLab::new());
    gitlab.set_post_response(json!({ "id": 99, "iid": 5, "web_url": "http://g/issues/5" }));
    let queue = test_queue(store.clone(), gitlab.clone());

    export_story(&queue, "widget", task_id).await.unwrap();

    let posts = gitlab.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].0, "/projects/7/issues");
    assert_eq!(posts[0].1["title"], json!("Crash on save"));

    let story = store.get_story("widget", story_id).await.unwrap().unwrap();
    assert_eq!(story.external, Some(ExternalKey { server_id: 1, id: 99 }));
    assert!(story.etime.is_some());

    let row = store.get_task("widget", task_id).await.unwrap().unwrap();
    assert_eq!(row.completion, Some(100));
    assert!(!row.failed);
    assert_eq!(row.details["issue"]["iid"], json!(5));
}

#[tokio::test]
async fn transient_failure_stays_eligible_for_retry() {
    let store = Arc::new(MemStore::new());
    let (_story_id, task_id) = seed(&store).await;
    let gitlab = Arc::new(MockGitLab::new());
    gitlab.fail("/projects/7/issues", 503);
    let queue = test_queue(store.clone(), gitlab);

    export_story(&queue, "widget", task_id).await.unwrap_err();

    let row = store.get_task("widget", task_id).await.unwrap().unwrap();
    assert!(row.failed);
    assert!(!row.deleted, "transient failures keep the row alive");
    assert_eq!(row.details["error"]["status"], json!(503));

    // The retry sweep would pick it up.
    let cutoff = Utc::now() - Duration::days(3);
    let retryable = store
        .find_failed_tasks("widget", ACTION_EXPORT_ISSUE, cutoff)
        .await
        .unwrap();
    assert_eq!(retryable.len(), 1);
    assert_eq!(retryable[0].id, task_id);
}

#[tokio::test]
async fn permanent_failure_retires_the_task_row() {
    let store = Arc::new(MemStore::new());
    let (_story_id, task_id) = seed(&store).await;
    let gitlab = Arc::new(MockGitLab::new());
    gitlab.fail("/projects/7/issues", 404);
    let queue = test_queue(store.clone(), gitlab);

    export_story(&queue, "widget", task_id).await.unwrap_err();

    let row = store.get_task("widget", task_id).await.unwrap().unwrap();
    assert!(row.failed);
    assert!(row.deleted, "client errors are never retried");

    let cutoff = Utc::now() - Duration::days(3);
    let retryable = store
        .find_failed_tasks("widget", ACTION_EXPORT_ISSUE, cutoff)
        .await
        .unwrap();
    assert!(retryable.is_empty());
}
