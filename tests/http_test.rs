mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use common::{MockGitLab, test_queue};
use gitlab_adapter::http::router;
use gitlab_adapter::queue::TaskQueue;
use gitlab_adapter::store::MemStore;
use gitlab_adapter::tasks::Task;

fn queue() -> TaskQueue {
    test_queue(Arc::new(MemStore::new()), Arc::new(MockGitLab::new()))
}

fn hook_request(uri: &str, token: &str, payload: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-gitlab-token", token)
        .body(Body::from(payload.to_string()))
        .unwrap()
}

#[tokio::test]
async fn delivery_with_wrong_secret_is_rejected() {
    let queue = queue();
    queue.hooks().hook_secret(1);
    let app = router(queue.clone());

    let resp = app
        .oneshot(hook_request(
            "/hook/1",
            "wrong-token",
            json!({ "event_name": "project_create" }),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(queue.pending().is_empty(), "nothing queued for a forger");
}

#[tokio::test]
async fn system_hook_delivery_queues_processing() {
    let queue = queue();
    let secret = queue.hooks().hook_secret(1);
    let app = router(queue.clone());

    let payload = json!({ "event_name": "user_create", "username": "alice" });
    let resp = app
        .oneshot(hook_request("/hook/1", &secret, payload.clone()))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        queue.pending(),
        vec![Task::ProcessSystemHookEvent { server_id: 1, payload }]
    );
}

#[tokio::test]
async fn project_hook_delivery_queues_processing() {
    let queue = queue();
    let secret = queue.hooks().hook_secret(1);
    let app = router(queue.clone());

    let payload = json!({ "object_kind": "wiki_page" });
    let resp = app
        .oneshot(hook_request("/hook/1/4/500", &secret, payload.clone()))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        queue.pending(),
        vec![Task::ProcessProjectHookEvent { repo_id: 4, project_id: 500, payload }]
    );
}

#[tokio::test]
async fn secret_for_one_server_does_not_open_another() {
    let queue = queue();
    let secret_for_2 = queue.hooks().hook_secret(2);
    let app = router(queue.clone());

    let resp = app
        .oneshot(hook_request(
            "/hook/1",
            &secret_for_2,
            json!({ "event_name": "project_create" }),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(queue.pending().is_empty());
}
