//! In-memory Store implementation (for testing and local development).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::model::*;
use crate::store::Store;

#[derive(Default)]
struct Tables {
    servers: HashMap<i64, Server>,
    system: Option<SystemSettings>,
    repos: HashMap<i64, Repo>,
    projects: HashMap<i64, Project>,
    users: HashMap<i64, User>,
    // project-scoped rows keyed by (schema, id)
    wikis: HashMap<(String, i64), Wiki>,
    stories: HashMap<(String, i64), Story>,
    tasks: HashMap<(String, i64), TaskRow>,
    next_id: i64,
}

impl Tables {
    fn assign_id(&mut self, id: i64) -> i64 {
        if id != 0 {
            return id;
        }
        self.next_id += 1;
        self.next_id
    }
}

/// Storage backend holding everything in process memory.
#[derive(Default)]
pub struct MemStore {
    tables: Mutex<Tables>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                next_id: 1000,
                ..Tables::default()
            }),
        }
    }

    // Seeding helpers for rows the core reads but never creates.

    pub fn put_server(&self, server: Server) {
        self.tables.lock().unwrap().servers.insert(server.id, server);
    }

    pub fn put_project(&self, project: Project) {
        self.tables
            .lock()
            .unwrap()
            .projects
            .insert(project.id, project);
    }

    pub fn put_system(&self, system: SystemSettings) {
        self.tables.lock().unwrap().system = Some(system);
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_server(&self, id: i64) -> Result<Option<Server>> {
        Ok(self.tables.lock().unwrap().servers.get(&id).cloned())
    }

    async fn find_servers(&self) -> Result<Vec<Server>> {
        let mut servers: Vec<_> = self
            .tables
            .lock()
            .unwrap()
            .servers
            .values()
            .filter(|s| !s.deleted)
            .cloned()
            .collect();
        servers.sort_by_key(|s| s.id);
        Ok(servers)
    }

    async fn get_system(&self) -> Result<Option<SystemSettings>> {
        Ok(self.tables.lock().unwrap().system.clone())
    }

    async fn get_repo(&self, id: i64) -> Result<Option<Repo>> {
        Ok(self.tables.lock().unwrap().repos.get(&id).cloned())
    }

    async fn find_repos_of_server(&self, server_id: i64) -> Result<Vec<Repo>> {
        let mut repos: Vec<_> = self
            .tables
            .lock()
            .unwrap()
            .repos
            .values()
            .filter(|r| r.external.server_id == server_id)
            .cloned()
            .collect();
        repos.sort_by_key(|r| r.id);
        Ok(repos)
    }

    async fn save_repo(&self, mut repo: Repo) -> Result<Repo> {
        let mut tables = self.tables.lock().unwrap();
        repo.id = tables.assign_id(repo.id);
        tables.repos.insert(repo.id, repo.clone());
        Ok(repo)
    }

    async fn get_project(&self, id: i64) -> Result<Option<Project>> {
        Ok(self.tables.lock().unwrap().projects.get(&id).cloned())
    }

    async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .projects
            .values()
            .find(|p| p.name == name)
            .cloned())
    }

    async fn find_projects(&self) -> Result<Vec<Project>> {
        let mut projects: Vec<_> = self
            .tables
            .lock()
            .unwrap()
            .projects
            .values()
            .filter(|p| !p.deleted)
            .cloned()
            .collect();
        projects.sort_by_key(|p| p.id);
        Ok(projects)
    }

    async fn find_users_of_server(&self, server_id: i64) -> Result<Vec<User>> {
        let mut users: Vec<_> = self
            .tables
            .lock()
            .unwrap()
            .users
            .values()
            .filter(|u| u.external.is_some_and(|e| e.server_id == server_id))
            .cloned()
            .collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    async fn save_user(&self, mut user: User) -> Result<User> {
        let mut tables = self.tables.lock().unwrap();
        user.id = tables.assign_id(user.id);
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_wikis(&self, schema: &str, repo_id: i64) -> Result<Vec<Wiki>> {
        let mut wikis: Vec<_> = self
            .tables
            .lock()
            .unwrap()
            .wikis
            .iter()
            .filter(|((s, _), w)| s == schema && w.repo_id == repo_id)
            .map(|(_, w)| w.clone())
            .collect();
        wikis.sort_by_key(|w| w.id);
        Ok(wikis)
    }

    async fn save_wiki(&self, schema: &str, mut wiki: Wiki) -> Result<Wiki> {
        let mut tables = self.tables.lock().unwrap();
        wiki.id = tables.assign_id(wiki.id);
        tables
            .wikis
            .insert((schema.to_string(), wiki.id), wiki.clone());
        Ok(wiki)
    }

    async fn get_story(&self, schema: &str, id: i64) -> Result<Option<Story>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .stories
            .get(&(schema.to_string(), id))
            .cloned())
    }

    async fn find_story_by_external(
        &self,
        schema: &str,
        key: ExternalKey,
    ) -> Result<Option<Story>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .stories
            .iter()
            .find(|((s, _), story)| s == schema && story.external == Some(key))
            .map(|(_, story)| story.clone()))
    }

    async fn find_stories_of_kind(&self, schema: &str, kind: &str) -> Result<Vec<Story>> {
        let mut stories: Vec<_> = self
            .tables
            .lock()
            .unwrap()
            .stories
            .iter()
            .filter(|((s, _), story)| s == schema && story.kind == kind)
            .map(|(_, story)| story.clone())
            .collect();
        stories.sort_by_key(|s| s.id);
        Ok(stories)
    }

    async fn save_story(&self, schema: &str, mut story: Story) -> Result<Story> {
        let mut tables = self.tables.lock().unwrap();
        story.id = tables.assign_id(story.id);
        tables
            .stories
            .insert((schema.to_string(), story.id), story.clone());
        Ok(story)
    }

    async fn get_task(&self, schema: &str, id: i64) -> Result<Option<TaskRow>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .tasks
            .get(&(schema.to_string(), id))
            .cloned())
    }

    async fn find_task_by_token(&self, schema: &str, token: &str) -> Result<Option<TaskRow>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .tasks
            .iter()
            .find(|((s, _), row)| s == schema && row.token.as_deref() == Some(token))
            .map(|(_, row)| row.clone()))
    }

    async fn find_task(
        &self,
        schema: &str,
        action: &str,
        options: &Value,
    ) -> Result<Option<TaskRow>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .tasks
            .iter()
            .find(|((s, _), row)| s == schema && row.action == action && &row.options == options)
            .map(|(_, row)| row.clone()))
    }

    async fn find_failed_tasks(
        &self,
        schema: &str,
        action: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TaskRow>> {
        let mut rows: Vec<_> = self
            .tables
            .lock()
            .unwrap()
            .tasks
            .iter()
            .filter(|((s, _), row)| {
                s == schema
                    && row.action == action
                    && row.failed
                    && !row.deleted
                    && row.ctime > cutoff
            })
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    async fn save_task(&self, schema: &str, mut row: TaskRow) -> Result<TaskRow> {
        let mut tables = self.tables.lock().unwrap();
        row.id = tables.assign_id(row.id);
        tables
            .tasks
            .insert((schema.to_string(), row.id), row.clone());
        Ok(row)
    }

    async fn schemas(&self) -> Result<Vec<String>> {
        let mut names: Vec<_> = self
            .tables
            .lock()
            .unwrap()
            .projects
            .values()
            .filter(|p| !p.deleted)
            .map(|p| p.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}
