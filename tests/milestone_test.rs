mod common;

use std::sync::Arc;

use serde_json::json;

use common::{MockGitLab, test_queue, usable_server};
use gitlab_adapter::import::milestones::import_milestones;
use gitlab_adapter::model::{ExternalKey, Project, Repo};
use gitlab_adapter::store::{MemStore, Store};

async fn repo(store: &Arc<MemStore>, external_id: i64) -> i64 {
    store
        .save_repo(Repo {
            id: 0,
            deleted: false,
            external: ExternalKey {
                server_id: 1,
                id: external_id,
            },
            name: format!("repo-{external_id}"),
            default_branch: Some("main".to_string()),
            archived: false,
            issues_enabled: true,
            web_url: None,
            template: None,
            snapshot_commit: None,
        })
        .await
        .unwrap()
        .id
}

/// Server 1 plus two repos sharing one project.
async fn seed(store: &Arc<MemStore>) -> (i64, i64, i64) {
    store.put_server(usable_server(1));
    let repo_a = repo(store, 7).await;
    let repo_b = repo(store, 8).await;
    store.put_project(Project {
        id: 500,
        deleted: false,
        archived: false,
        name: "widget".to_string(),
        repo_ids: vec![repo_a, repo_b],
        user_ids: vec![],
        template_repo_id: None,
    });
    (repo_a, repo_b, 500)
}

#[tokio::test]
async fn milestones_become_stories() {
    let store = Arc::new(MemStore::new());
    let (repo_a, _repo_b, project_id) = seed(&store).await;

    let gitlab = Arc::new(MockGitLab::new());
    gitlab.set_list(
        "/projects/7/milestones",
        vec![json!({ "id": 100, "title": "v1", "state": "active" })],
    );
    let queue = test_queue(store.clone(), gitlab);

    import_milestones(&queue, repo_a, project_id).await.unwrap();

    let stories = store.find_stories_of_kind("widget", "milestone").await.unwrap();
    assert_eq!(stories.len(), 1);
    let story = &stories[0];
    assert_eq!(
        story.external,
        Some(ExternalKey { server_id: 1, id: 100 })
    );
    assert_eq!(story.details["title"], json!("v1"));
    assert_eq!(story.details["repo_id"], json!(repo_a));
}

#[tokio::test]
async fn importing_one_repo_leaves_sibling_milestones_alone() {
    let store = Arc::new(MemStore::new());
    let (repo_a, repo_b, project_id) = seed(&store).await;

    let gitlab = Arc::new(MockGitLab::new());
    gitlab.set_list(
        "/projects/7/milestones",
        vec![json!({ "id": 100, "title": "v1", "state": "active" })],
    );
    gitlab.set_list(
        "/projects/8/milestones",
        vec![json!({ "id": 200, "title": "backend-v1", "state": "active" })],
    );
    let queue = test_queue(store.clone(), gitlab);

    import_milestones(&queue, repo_a, project_id).await.unwrap();
    import_milestones(&queue, repo_b, project_id).await.unwrap();

    let stories = store.find_stories_of_kind("widget", "milestone").await.unwrap();
    assert_eq!(stories.len(), 2);
    // Repo 8's milestone list doesn't contain repo 7's milestone, but the
    // second import only reconciles its own repo's stories.
    let for_a = stories
        .iter()
        .find(|s| s.details["repo_id"].as_i64() == Some(repo_a))
        .unwrap();
    assert!(!for_a.deleted);
}

#[tokio::test]
async fn vanished_milestones_are_soft_deleted() {
    let store = Arc::new(MemStore::new());
    let (repo_a, _repo_b, project_id) = seed(&store).await;

    let gitlab = Arc::new(MockGitLab::new());
    gitlab.set_list(
        "/projects/7/milestones",
        vec![
            json!({ "id": 100, "title": "v1", "state": "active" }),
            json!({ "id": 101, "title": "v2", "state": "active" }),
        ],
    );
    let queue = test_queue(store.clone(), gitlab.clone());
    import_milestones(&queue, repo_a, project_id).await.unwrap();

    // v1 is closed out on the server side.
    gitlab.set_list(
        "/projects/7/milestones",
        vec![json!({ "id": 101, "title": "v2", "state": "active" })],
    );
    import_milestones(&queue, repo_a, project_id).await.unwrap();

    let stories = store.find_stories_of_kind("widget", "milestone").await.unwrap();
    let by_external = |id: i64| {
        stories
            .iter()
            .find(|s| s.external == Some(ExternalKey { server_id: 1, id }))
            .unwrap()
    };
    assert!(by_external(100).deleted);
    assert!(!by_external(101).deleted);
}
