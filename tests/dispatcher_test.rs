mod common;

use std::sync::Arc;

use serde_json::{Map, Value, json};

use common::{MockGitLab, test_queue, usable_server};
use gitlab_adapter::db::{ChangeEvent, ChangeOp};
use gitlab_adapter::dispatcher::dispatch;
use gitlab_adapter::model::{ExternalKey, Project, Repo, SystemSettings};
use gitlab_adapter::queue::TaskQueue;
use gitlab_adapter::store::{MemStore, Store};
use gitlab_adapter::tasks::Task;

fn event(
    op: ChangeOp,
    schema: &str,
    table: &str,
    id: i64,
    previous: Value,
    current: Value,
    changed: &[&str],
) -> ChangeEvent {
    let mut diff = Map::new();
    for field in changed {
        diff.insert(field.to_string(), json!(true));
    }
    ChangeEvent {
        op,
        schema: schema.to_string(),
        table: table.to_string(),
        id,
        current,
        previous,
        diff,
    }
}

async fn seed_repos(store: &Arc<MemStore>) -> Vec<i64> {
    store.put_server(usable_server(1));
    store.put_system(SystemSettings {
        address: Some("https://example.net/".to_string()),
    });
    let mut ids = Vec::new();
    for ext in [71, 72, 73] {
        let repo = store
            .save_repo(Repo {
                id: 0,
                deleted: false,
                external: ExternalKey { server_id: 1, id: ext },
                name: format!("repo-{ext}"),
                default_branch: None,
                archived: false,
                issues_enabled: true,
                web_url: None,
                template: None,
                snapshot_commit: None,
            })
            .await
            .unwrap();
        ids.push(repo.id);
    }
    ids
}

#[tokio::test]
async fn repo_membership_change_produces_connect_and_disconnect_tasks() {
    let store = Arc::new(MemStore::new());
    let repo_ids = seed_repos(&store).await;
    let (r1, r2, r3) = (repo_ids[0], repo_ids[1], repo_ids[2]);
    store.put_project(Project {
        id: 500,
        deleted: false,
        archived: false,
        name: "widget".to_string(),
        repo_ids: vec![r2, r3],
        user_ids: vec![],
        template_repo_id: None,
    });
    let queue = test_queue(store.clone(), Arc::new(MockGitLab::new()));

    let ev = event(
        ChangeOp::Update,
        "global",
        "project",
        500,
        json!({ "repo_ids": [r1, r2] }),
        json!({ "repo_ids": [r2, r3] }),
        &["repo_ids"],
    );
    dispatch(&queue, &ev).await.unwrap();

    let pending = queue.pending();
    let host = "https://example.net".to_string();

    // r1 left the project.
    assert!(pending.contains(&Task::RemoveProjectHook {
        host: host.clone(),
        server_id: 1,
        repo_id: r1,
        project_id: 500,
    }));
    assert!(pending.contains(&Task::RemoveWikis { repo_id: r1, project_id: 500 }));

    // r3 joined and gets the full connect treatment.
    assert!(pending.contains(&Task::InstallProjectHook {
        host,
        server_id: 1,
        repo_id: r3,
        project_id: 500,
    }));
    assert!(pending.contains(&Task::ImportRepoEvents { repo_id: r3, project_id: 500 }));
    assert!(pending.contains(&Task::ImportWikis { repo_id: r3, project_id: 500 }));
    assert!(pending.contains(&Task::ImportMilestones { repo_id: r3, project_id: 500 }));

    // r2 was connected before and after; its connectivity did not change,
    // so it produces no tasks at all.
    assert!(!pending.iter().any(|t| matches!(
        t,
        Task::InstallProjectHook { repo_id, .. }
        | Task::RemoveProjectHook { repo_id, .. }
        | Task::ImportRepoEvents { repo_id, .. }
        | Task::ImportWikis { repo_id, .. }
        | Task::ImportMilestones { repo_id, .. }
        | Task::RemoveWikis { repo_id, .. }
            if *repo_id == r2
    )));
    assert_eq!(pending.len(), 6);
}

#[tokio::test]
async fn archiving_a_project_disconnects_its_repos() {
    let store = Arc::new(MemStore::new());
    let repo_ids = seed_repos(&store).await;
    let r1 = repo_ids[0];
    store.put_project(Project {
        id: 500,
        deleted: false,
        archived: true,
        name: "widget".to_string(),
        repo_ids: vec![r1],
        user_ids: vec![],
        template_repo_id: None,
    });
    let queue = test_queue(store.clone(), Arc::new(MockGitLab::new()));

    let ev = event(
        ChangeOp::Update,
        "global",
        "project",
        500,
        json!({ "repo_ids": [r1], "archived": false }),
        json!({ "repo_ids": [r1], "archived": true }),
        &["archived"],
    );
    dispatch(&queue, &ev).await.unwrap();

    let pending = queue.pending();
    assert!(pending.contains(&Task::RemoveWikis { repo_id: r1, project_id: 500 }));
    assert!(!pending.iter().any(|t| matches!(t, Task::ImportWikis { .. })));
}

#[tokio::test]
async fn server_becoming_usable_installs_hooks_and_imports() {
    let store = Arc::new(MemStore::new());
    store.put_server(usable_server(1));
    store.put_system(SystemSettings {
        address: Some("https://example.net".to_string()),
    });
    let queue = test_queue(store.clone(), Arc::new(MockGitLab::new()));

    let api = json!({
        "deleted": false,
        "disabled": false,
        "api_url": "https://gitlab.example.com",
        "api_token": "secret-token",
    });
    let mut before = api.clone();
    before["disabled"] = json!(true);
    let ev = event(ChangeOp::Update, "global", "server", 1, before, api, &["disabled"]);
    dispatch(&queue, &ev).await.unwrap();

    let pending = queue.pending();
    assert!(pending.contains(&Task::InstallServerHooks {
        host: "https://example.net".to_string(),
        server_id: 1,
    }));
    assert!(pending.contains(&Task::ImportRepos { server_id: 1 }));
    assert!(pending.contains(&Task::ImportUsers { server_id: 1 }));
}

#[tokio::test]
async fn disabling_a_server_removes_its_hooks() {
    let store = Arc::new(MemStore::new());
    store.put_system(SystemSettings {
        address: Some("https://example.net".to_string()),
    });
    let queue = test_queue(store.clone(), Arc::new(MockGitLab::new()));

    let api = json!({
        "deleted": false,
        "disabled": false,
        "api_url": "https://gitlab.example.com",
        "api_token": "secret-token",
    });
    let mut after = api.clone();
    after["disabled"] = json!(true);
    let ev = event(ChangeOp::Update, "global", "server", 1, api, after, &["disabled"]);
    dispatch(&queue, &ev).await.unwrap();

    assert_eq!(
        queue.pending(),
        vec![Task::RemoveServerHooks {
            host: "https://example.net".to_string(),
            server_id: 1,
        }]
    );
}

#[tokio::test]
async fn self_caused_story_changes_do_not_reexport() {
    let store = Arc::new(MemStore::new());
    let queue = test_queue(store, Arc::new(MockGitLab::new()));

    let stamp = json!("2026-08-29T10:00:00Z");
    let ev = event(
        ChangeOp::Update,
        "widget",
        "story",
        42,
        json!({}),
        json!({ "type": "issue", "deleted": false, "details": {},
                "mtime": stamp, "itime": stamp, "etime": null }),
        &["details"],
    );
    dispatch(&queue, &ev).await.unwrap();
    assert!(queue.pending().is_empty());
}

#[tokio::test]
async fn user_edit_to_an_issue_story_triggers_reexport() {
    let store = Arc::new(MemStore::new());
    let queue = test_queue(store, Arc::new(MockGitLab::new()));

    let ev = event(
        ChangeOp::Update,
        "widget",
        "story",
        42,
        json!({}),
        json!({ "type": "issue", "deleted": false, "details": {},
                "mtime": "2026-08-29T11:00:00Z", "itime": "2026-08-29T10:00:00Z",
                "etime": null }),
        &["details"],
    );
    dispatch(&queue, &ev).await.unwrap();
    assert_eq!(
        queue.pending(),
        vec![Task::ReexportStory { schema: "widget".to_string(), story_id: 42 }]
    );
}

#[tokio::test]
async fn new_export_task_row_queues_an_export() {
    let store = Arc::new(MemStore::new());
    let queue = test_queue(store, Arc::new(MockGitLab::new()));

    let ev = event(
        ChangeOp::Insert,
        "widget",
        "task",
        77,
        json!({}),
        json!({ "action": "export-issue", "deleted": false, "options": { "story_id": 42 } }),
        &["options"],
    );
    dispatch(&queue, &ev).await.unwrap();
    assert_eq!(
        queue.pending(),
        vec![Task::ExportStory { schema: "widget".to_string(), task_id: 77 }]
    );
}

#[tokio::test]
async fn choosing_a_wiki_page_reimports_the_repo_wikis() {
    let store = Arc::new(MemStore::new());
    let queue = test_queue(store, Arc::new(MockGitLab::new()));

    let ev = event(
        ChangeOp::Update,
        "widget",
        "wiki",
        9,
        json!({ "chosen": false, "repo_id": 4 }),
        json!({ "chosen": true, "repo_id": 4 }),
        &["chosen"],
    );
    dispatch(&queue, &ev).await.unwrap();
    assert_eq!(
        queue.pending(),
        vec![Task::ReimportWiki { schema: "widget".to_string(), repo_id: 4 }]
    );
}

#[tokio::test]
async fn address_change_moves_every_hook() {
    let store = Arc::new(MemStore::new());
    let queue = test_queue(store, Arc::new(MockGitLab::new()));

    let ev = event(
        ChangeOp::Update,
        "global",
        "system",
        1,
        json!({ "address": "https://old.example.net" }),
        json!({ "address": "https://new.example.net" }),
        &["address"],
    );
    dispatch(&queue, &ev).await.unwrap();

    let pending = queue.pending();
    assert!(pending.contains(&Task::RemoveHooks { host: "https://old.example.net".to_string() }));
    assert!(pending.contains(&Task::InstallHooks { host: "https://new.example.net".to_string() }));
}

#[tokio::test]
async fn cosmetic_address_change_is_ignored() {
    let store = Arc::new(MemStore::new());
    let queue = test_queue(store, Arc::new(MockGitLab::new()));

    let ev = event(
        ChangeOp::Update,
        "global",
        "system",
        1,
        json!({ "address": "https://example.net" }),
        json!({ "address": "https://example.net/" }),
        &["address"],
    );
    dispatch(&queue, &ev).await.unwrap();
    assert!(queue.pending().is_empty());
}

#[tokio::test]
async fn resetting_the_template_flag_triggers_detection() {
    let store = Arc::new(MemStore::new());
    let queue: TaskQueue = test_queue(store, Arc::new(MockGitLab::new()));

    let ev = event(
        ChangeOp::Update,
        "global",
        "repo",
        4,
        json!({ "template": true }),
        json!({ "template": null }),
        &["template"],
    );
    dispatch(&queue, &ev).await.unwrap();
    assert_eq!(queue.pending(), vec![Task::DetectTemplate { repo_id: 4 }]);

    let ev = event(
        ChangeOp::Update,
        "global",
        "repo",
        5,
        json!({ "template": null }),
        json!({ "template": true }),
        &["template"],
    );
    dispatch(&queue, &ev).await.unwrap();
    assert!(queue.pending().contains(&Task::ImportSnapshot { repo_id: 5 }));
}
