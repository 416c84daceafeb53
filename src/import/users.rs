//! User import: reconcile local accounts against a server's user list.

use serde_json::json;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{ExternalKey, GLOBAL_SCHEMA, User};
use crate::queue::TaskQueue;
use crate::tasklog::TaskLog;

pub async fn import_users(queue: &TaskQueue, server_id: i64) -> Result<()> {
    let store = queue.store();
    let Some(server) = store.get_server(server_id).await? else {
        return Err(Error::NotFound("server"));
    };
    if !server.is_usable() {
        debug!(server_id, "server not usable, skipping user import");
        return Ok(());
    }
    let log = TaskLog::start_saved(
        queue.logs(),
        store.clone(),
        GLOBAL_SCHEMA,
        "import-users",
        json!({ "server_id": server_id }),
    );
    match reconcile(queue, &server, &log).await {
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
    server: &crate::model::Server,
    log: &TaskLog,
) -> Result<()> {
    let store = queue.store();
    let local = store.find_users_of_server(server.id).await?;
    let live = queue.gitlab().fetch_all(server, "/users").await?;

    for user in &local {
        let external_id = user.external.map(|e| e.id);
        let still_there = live.iter().any(|v| v["id"].as_i64() == external_id);
        if !user.deleted && !still_there {
            let mut gone = user.clone();
            gone.deleted = true;
            store.save_user(gone).await?;
            log.append("deleted", user.username.clone());
        }
    }

    let total = live.len().max(1);
    for (index, entry) in live.iter().enumerate() {
        let Some(external_id) = entry["id"].as_i64() else {
            continue;
        };
        let username = entry["username"].as_str().unwrap_or_default().to_string();
        let name = entry["name"].as_str().map(str::to_string);
        let email = entry["email"].as_str().map(str::to_string);

        let existing = local
            .iter()
            .find(|u| u.external.is_some_and(|e| e.id == external_id));
        match existing {
            Some(existing) => {
                // Role and the disabled flag are assigned locally and
                // survive reimport.
                let mut merged = existing.clone();
                merged.deleted = false;
                merged.username = username;
                merged.name = name;
                merged.email = email;
                if merged != *existing {
                    let username = merged.username.clone();
                    store.save_user(merged).await?;
                    log.append("modified", username);
                }
            }
            None => {
                let user = User {
                    id: 0,
                    deleted: false,
                    disabled: false,
                    username: username.clone(),
                    name,
                    email,
                    role: None,
                    external: Some(ExternalKey {
                        server_id: server.id,
                        id: external_id,
                    }),
                };
                store.save_user(user).await?;
                log.append("added", username);
            }
        }
        log.report(index + 1, total);
    }
    Ok(())
}
