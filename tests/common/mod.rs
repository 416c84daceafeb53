//! Shared test fixtures: a scripted GitLab transport and a queue builder.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use gitlab_adapter::error::{Error, Result};
use gitlab_adapter::gitlab::GitLabApi;
use gitlab_adapter::hooks::HookManager;
use gitlab_adapter::model::Server;
use gitlab_adapter::queue::{Context, TaskQueue};
use gitlab_adapter::store::MemStore;
use gitlab_adapter::tasklog::TaskLogRegistry;

/// GitLab transport with scripted responses and recorded writes.
#[derive(Default)]
pub struct MockGitLab {
    lists: Mutex<HashMap<String, Vec<Value>>>,
    objects: Mutex<HashMap<String, Value>>,
    raw: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, u16>>,
    post_response: Mutex<Value>,
    posts: Mutex<Vec<(String, Value)>>,
    deletes: Mutex<Vec<String>>,
}

impl MockGitLab {
    pub fn new() -> Self {
        Self {
            post_response: Mutex::new(json!({ "id": 1 })),
            ..Self::default()
        }
    }

    pub fn set_list(&self, uri: &str, values: Vec<Value>) {
        self.lists.lock().unwrap().insert(uri.to_string(), values);
    }

    pub fn set_object(&self, uri: &str, value: Value) {
        self.objects.lock().unwrap().insert(uri.to_string(), value);
    }

    pub fn set_raw(&self, uri: &str, bytes: Vec<u8>) {
        self.raw.lock().unwrap().insert(uri.to_string(), bytes);
    }

    pub fn set_post_response(&self, value: Value) {
        *self.post_response.lock().unwrap() = value;
    }

    /// Make any request to `uri` fail with the given status.
    pub fn fail(&self, uri: &str, status: u16) {
        self.failures.lock().unwrap().insert(uri.to_string(), status);
    }

    /// Let `uri` succeed again.
    pub fn clear_failure(&self, uri: &str) {
        self.failures.lock().unwrap().remove(uri);
    }

    pub fn posts(&self) -> Vec<(String, Value)> {
        self.posts.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    fn check_failure(&self, uri: &str) -> Result<()> {
        if let Some(status) = self.failures.lock().unwrap().get(uri) {
            return Err(Error::GitLab {
                status: *status,
                message: "scripted failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl GitLabApi for MockGitLab {
    async fn fetch(&self, _server: &Server, uri: &str) -> Result<Value> {
        self.check_failure(uri)?;
        self.objects
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or(Error::GitLab {
                status: 404,
                message: format!("no scripted object at {uri}"),
            })
    }

    async fn fetch_all(&self, _server: &Server, uri: &str) -> Result<Vec<Value>> {
        self.check_failure(uri)?;
        Ok(self
            .lists
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_raw(&self, _server: &Server, uri: &str) -> Result<Vec<u8>> {
        self.check_failure(uri)?;
        self.raw
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or(Error::GitLab {
                status: 404,
                message: format!("no scripted file at {uri}"),
            })
    }

    async fn post(&self, _server: &Server, uri: &str, payload: Value) -> Result<Value> {
        self.check_failure(uri)?;
        self.posts
            .lock()
            .unwrap()
            .push((uri.to_string(), payload));
        Ok(self.post_response.lock().unwrap().clone())
    }

    async fn delete(&self, _server: &Server, uri: &str) -> Result<()> {
        self.check_failure(uri)?;
        self.deletes.lock().unwrap().push(uri.to_string());
        Ok(())
    }
}

pub fn usable_server(id: i64) -> Server {
    Server {
        id,
        deleted: false,
        disabled: false,
        api_url: Some("https://gitlab.example.com".to_string()),
        api_token: Some("secret-token".to_string()),
    }
}

pub fn test_queue(store: Arc<MemStore>, gitlab: Arc<MockGitLab>) -> TaskQueue {
    TaskQueue::new(Context {
        store,
        gitlab,
        hooks: Arc::new(HookManager::new()),
        logs: Arc::new(TaskLogRegistry::new()),
    })
}
