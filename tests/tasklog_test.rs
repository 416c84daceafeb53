use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use gitlab_adapter::error::Error;
use gitlab_adapter::model::TaskRow;
use gitlab_adapter::store::{MemStore, Store};
use gitlab_adapter::tasklog::{TaskLog, TaskLogRegistry};

fn saving_log(action: &str) -> (Arc<MemStore>, Arc<TaskLogRegistry>, TaskLog) {
    let store = Arc::new(MemStore::new());
    let registry = Arc::new(TaskLogRegistry::new());
    let log = TaskLog::start_saved(
        &registry,
        store.clone(),
        "widget",
        action,
        json!({ "repo_id": 1 }),
    );
    (store, registry, log)
}

#[tokio::test]
async fn log_that_recorded_nothing_is_never_saved() {
    let (store, _registry, log) = saving_log("import-wikis");
    log.finish(None).await;

    let row = store
        .find_task("widget", "import-wikis", &json!({ "repo_id": 1 }))
        .await
        .unwrap();
    assert!(row.is_none());
}

#[tokio::test]
async fn finished_log_persists_details_and_completion() {
    let (store, _registry, log) = saving_log("import-wikis");
    log.append("added", "home");
    log.append("added", "faq");
    log.finish(None).await;

    let row = store
        .find_task("widget", "import-wikis", &json!({ "repo_id": 1 }))
        .await
        .unwrap()
        .expect("task row saved");
    assert_eq!(row.completion, Some(100));
    assert!(!row.failed);
    assert!(row.etime.is_some());
    assert_eq!(row.details["added"], json!(["home", "faq"]));
}

#[tokio::test]
async fn logs_can_finish_inside_a_spawned_worker() {
    let (store, _registry, log) = saving_log("import-wikis");
    log.append("added", "home");

    // Task bodies run on the runtime's worker threads; finishing a log
    // there must work.
    let worker = log.clone();
    tokio::spawn(async move { worker.finish(None).await })
        .await
        .unwrap();

    let row = store
        .find_task("widget", "import-wikis", &json!({ "repo_id": 1 }))
        .await
        .unwrap()
        .expect("task row saved");
    assert_eq!(row.completion, Some(100));
}

#[tokio::test]
async fn multipart_log_finishes_only_when_every_part_is_done() {
    let (_store, _registry, log) = saving_log("import-project");
    log.require_parts(&["wikis", "milestones"]);
    log.set("started", true);

    log.finish(Some("wikis")).await;
    assert!(!log.finished());

    log.finish(Some("milestones")).await;
    assert!(log.finished());
    assert_eq!(log.completion(), Some(100));
}

#[tokio::test]
async fn aborted_log_records_the_error() {
    let (store, _registry, log) = saving_log("import-repos");
    let err = Error::GitLab {
        status: 503,
        message: "maintenance".to_string(),
    };
    log.abort(&err).await;

    let row = store
        .find_task("widget", "import-repos", &json!({ "repo_id": 1 }))
        .await
        .unwrap()
        .expect("aborted log saved");
    assert!(row.failed);
    assert_eq!(row.details["error"]["status"], json!(503));
    assert!(
        row.details["error"]["message"]
            .as_str()
            .unwrap()
            .contains("503")
    );
}

#[tokio::test]
async fn repeated_runs_reuse_one_task_row() {
    let (store, registry, log) = saving_log("import-wikis");
    log.append("added", "home");
    log.finish(None).await;

    let second = TaskLog::start_saved(
        &registry,
        store.clone(),
        "widget",
        "import-wikis",
        json!({ "repo_id": 1 }),
    );
    second.append("modified", "home");
    second.finish(None).await;

    let row = store
        .find_task("widget", "import-wikis", &json!({ "repo_id": 1 }))
        .await
        .unwrap()
        .expect("task row");
    assert_eq!(row.details["modified"], json!(["home"]));
}

#[tokio::test]
async fn obtain_rejects_a_token_for_a_different_action() {
    let store: Arc<MemStore> = Arc::new(MemStore::new());
    let registry = Arc::new(TaskLogRegistry::new());
    store
        .save_task(
            "widget",
            TaskRow {
                id: 0,
                deleted: false,
                action: "add-website".to_string(),
                options: json!({}),
                completion: None,
                details: json!({}),
                failed: false,
                user_id: Some(3),
                ctime: Utc::now(),
                etime: None,
                token: Some("tok123".to_string()),
            },
        )
        .await
        .unwrap();

    let store: Arc<dyn Store> = store;
    let err = registry
        .obtain(store.clone(), "widget", "tok123", "remove-website")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ActionMismatch));

    let log = registry
        .obtain(store, "widget", "tok123", "add-website")
        .await
        .unwrap();
    assert_eq!(log.action(), "add-website");
    assert!(format!("{log:?}").contains("add-website"));
}
