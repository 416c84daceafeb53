//! Typed finder/save boundary over the relational storage layer.
//!
//! The orchestration core never writes SQL of its own; everything goes
//! through this trait. [`PgStore`] is the production implementation;
//! [`MemStore`] backs tests and local development.

pub mod mem;
pub mod pg;

pub use mem::MemStore;
pub use pg::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::model::*;

/// Finder and save operations the sync pipeline needs.
///
/// Saving a row with `id == 0` inserts it and returns the assigned id;
/// any other id upserts. Deletion is always the soft `deleted` flag.
#[async_trait]
pub trait Store: Send + Sync {
    // servers
    async fn get_server(&self, id: i64) -> Result<Option<Server>>;
    async fn find_servers(&self) -> Result<Vec<Server>>;

    // system settings
    async fn get_system(&self) -> Result<Option<SystemSettings>>;

    // repos
    async fn get_repo(&self, id: i64) -> Result<Option<Repo>>;
    async fn find_repos_of_server(&self, server_id: i64) -> Result<Vec<Repo>>;
    async fn save_repo(&self, repo: Repo) -> Result<Repo>;

    // projects
    async fn get_project(&self, id: i64) -> Result<Option<Project>>;
    async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>>;
    async fn find_projects(&self) -> Result<Vec<Project>>;

    // users
    async fn find_users_of_server(&self, server_id: i64) -> Result<Vec<User>>;
    async fn save_user(&self, user: User) -> Result<User>;

    // wikis
    async fn find_wikis(&self, schema: &str, repo_id: i64) -> Result<Vec<Wiki>>;
    async fn save_wiki(&self, schema: &str, wiki: Wiki) -> Result<Wiki>;

    // stories
    async fn get_story(&self, schema: &str, id: i64) -> Result<Option<Story>>;
    async fn find_story_by_external(&self, schema: &str, key: ExternalKey)
    -> Result<Option<Story>>;
    async fn find_stories_of_kind(&self, schema: &str, kind: &str) -> Result<Vec<Story>>;
    async fn save_story(&self, schema: &str, story: Story) -> Result<Story>;

    // task rows
    async fn get_task(&self, schema: &str, id: i64) -> Result<Option<TaskRow>>;
    async fn find_task_by_token(&self, schema: &str, token: &str) -> Result<Option<TaskRow>>;
    async fn find_task(&self, schema: &str, action: &str, options: &Value)
    -> Result<Option<TaskRow>>;
    /// Failed, non-deleted tasks of the given action created after `cutoff`.
    async fn find_failed_tasks(
        &self,
        schema: &str,
        action: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TaskRow>>;
    async fn save_task(&self, schema: &str, row: TaskRow) -> Result<TaskRow>;

    /// Names of all per-project schemas (live projects).
    async fn schemas(&self) -> Result<Vec<String>>;
}
