mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{MockGitLab, test_queue, usable_server};
use gitlab_adapter::store::{MemStore, Store};
use gitlab_adapter::tasks::Task;

#[tokio::test]
async fn webhook_payloads_dedupe_structurally() {
    let store = Arc::new(MemStore::new());
    let queue = test_queue(store, Arc::new(MockGitLab::new()));

    let push = json!({ "object_kind": "push", "ref": "refs/heads/main" });
    let tag = json!({ "object_kind": "tag_push", "ref": "refs/tags/v1" });

    assert!(queue.add(Task::ProcessProjectHookEvent {
        repo_id: 1,
        project_id: 2,
        payload: push.clone(),
    }));
    // Same delivery twice collapses into one queued task.
    assert!(!queue.add(Task::ProcessProjectHookEvent {
        repo_id: 1,
        project_id: 2,
        payload: push,
    }));
    // A different payload is different work.
    assert!(queue.add(Task::ProcessProjectHookEvent {
        repo_id: 1,
        project_id: 2,
        payload: tag,
    }));
    assert_eq!(queue.pending().len(), 2);
}

#[tokio::test]
async fn pull_loop_runs_tasks_and_chained_tasks() {
    let store = Arc::new(MemStore::new());
    store.put_server(usable_server(1));
    let gitlab = Arc::new(MockGitLab::new());
    gitlab.set_list(
        "/projects",
        vec![json!({ "id": 7, "name": "widget", "default_branch": "main" })],
    );
    let queue = test_queue(store.clone(), gitlab);

    // The hook event queues an import, which does the actual work.
    queue.add(Task::ProcessSystemHookEvent {
        server_id: 1,
        payload: json!({ "event_name": "project_create" }),
    });
    queue.start().await;

    let mut imported = Vec::new();
    for _ in 0..50 {
        imported = store.find_repos_of_server(1).await.unwrap();
        if !imported.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    queue.stop().await;

    assert_eq!(imported.len(), 1);
    assert_eq!(imported[0].name, "widget");
    assert_eq!(imported[0].external.id, 7);
}

#[tokio::test]
async fn failing_task_does_not_stop_the_loop() {
    let store = Arc::new(MemStore::new());
    store.put_server(usable_server(1));
    let gitlab = Arc::new(MockGitLab::new());
    gitlab.set_list("/projects", vec![json!({ "id": 7, "name": "widget" })]);
    let queue = test_queue(store.clone(), gitlab);

    // First task fails (unknown server); second must still run.
    queue.add(Task::ImportRepos { server_id: 99 });
    queue.add(Task::ImportRepos { server_id: 1 });
    queue.start().await;

    let mut imported = Vec::new();
    for _ in 0..50 {
        imported = store.find_repos_of_server(1).await.unwrap();
        if !imported.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    queue.stop().await;

    assert_eq!(imported.len(), 1);
}
