//! Postgres Store implementation.
//!
//! Rows are kept as a handful of indexed key columns plus a `details` jsonb
//! column holding the full serialized struct. Queries are runtime strings;
//! no live database is needed at compile time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::error::{Error, Result};
use crate::model::*;
use crate::store::Store;

/// Storage backend over a shared Postgres pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_details<T: DeserializeOwned>(
        &self,
        query: &str,
        bind: i64,
    ) -> Result<Option<T>> {
        let row = sqlx::query(query).bind(bind).fetch_optional(&self.pool).await?;
        row.map(|r| decode(r.get("details"))).transpose()
    }
}

fn decode<T: DeserializeOwned>(details: Value) -> Result<T> {
    serde_json::from_value(details).map_err(Error::from)
}

fn decode_all<T: DeserializeOwned>(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<T>> {
    rows.into_iter().map(|r| decode(r.get("details"))).collect()
}

#[async_trait]
impl Store for PgStore {
    async fn get_server(&self, id: i64) -> Result<Option<Server>> {
        self.fetch_details("SELECT details FROM server WHERE id = $1", id)
            .await
    }

    async fn find_servers(&self) -> Result<Vec<Server>> {
        let rows = sqlx::query("SELECT details FROM server WHERE NOT deleted ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        decode_all(rows)
    }

    async fn get_system(&self) -> Result<Option<SystemSettings>> {
        let row = sqlx::query("SELECT details FROM system WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode(r.get("details"))).transpose()
    }

    async fn get_repo(&self, id: i64) -> Result<Option<Repo>> {
        self.fetch_details("SELECT details FROM repo WHERE id = $1", id)
            .await
    }

    async fn find_repos_of_server(&self, server_id: i64) -> Result<Vec<Repo>> {
        let rows = sqlx::query("SELECT details FROM repo WHERE server_id = $1 ORDER BY id")
            .bind(server_id)
            .fetch_all(&self.pool)
            .await?;
        decode_all(rows)
    }

    async fn save_repo(&self, mut repo: Repo) -> Result<Repo> {
        if repo.id == 0 {
            let row = sqlx::query(
                "INSERT INTO repo (deleted, server_id, details) VALUES ($1, $2, '{}'::jsonb)
                 RETURNING id",
            )
            .bind(repo.deleted)
            .bind(repo.external.server_id)
            .fetch_one(&self.pool)
            .await?;
            repo.id = row.get("id");
        }
        sqlx::query(
            "INSERT INTO repo (id, deleted, server_id, details) VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE SET deleted = $2, server_id = $3, details = $4",
        )
        .bind(repo.id)
        .bind(repo.deleted)
        .bind(repo.external.server_id)
        .bind(serde_json::to_value(&repo)?)
        .execute(&self.pool)
        .await?;
        Ok(repo)
    }

    async fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.fetch_details("SELECT details FROM project WHERE id = $1", id)
            .await
    }

    async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT details FROM project WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode(r.get("details"))).transpose()
    }

    async fn find_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query("SELECT details FROM project WHERE NOT deleted ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        decode_all(rows)
    }

    async fn find_users_of_server(&self, server_id: i64) -> Result<Vec<User>> {
        let rows = sqlx::query("SELECT details FROM user_account WHERE server_id = $1 ORDER BY id")
            .bind(server_id)
            .fetch_all(&self.pool)
            .await?;
        decode_all(rows)
    }

    async fn save_user(&self, mut user: User) -> Result<User> {
        if user.id == 0 {
            let row = sqlx::query(
                "INSERT INTO user_account (deleted, server_id, details)
                 VALUES ($1, $2, '{}'::jsonb) RETURNING id",
            )
            .bind(user.deleted)
            .bind(user.external.map(|e| e.server_id))
            .fetch_one(&self.pool)
            .await?;
            user.id = row.get("id");
        }
        sqlx::query(
            "INSERT INTO user_account (id, deleted, server_id, details) VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE SET deleted = $2, server_id = $3, details = $4",
        )
        .bind(user.id)
        .bind(user.deleted)
        .bind(user.external.map(|e| e.server_id))
        .bind(serde_json::to_value(&user)?)
        .execute(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_wikis(&self, schema: &str, repo_id: i64) -> Result<Vec<Wiki>> {
        let rows =
            sqlx::query("SELECT details FROM wiki WHERE schema = $1 AND repo_id = $2 ORDER BY id")
                .bind(schema)
                .bind(repo_id)
                .fetch_all(&self.pool)
                .await?;
        decode_all(rows)
    }

    async fn save_wiki(&self, schema: &str, mut wiki: Wiki) -> Result<Wiki> {
        if wiki.id == 0 {
            let row = sqlx::query(
                "INSERT INTO wiki (schema, deleted, repo_id, details)
                 VALUES ($1, $2, $3, '{}'::jsonb) RETURNING id",
            )
            .bind(schema)
            .bind(wiki.deleted)
            .bind(wiki.repo_id)
            .fetch_one(&self.pool)
            .await?;
            wiki.id = row.get("id");
        }
        sqlx::query(
            "INSERT INTO wiki (id, schema, deleted, repo_id, details) VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE SET deleted = $3, repo_id = $4, details = $5",
        )
        .bind(wiki.id)
        .bind(schema)
        .bind(wiki.deleted)
        .bind(wiki.repo_id)
        .bind(serde_json::to_value(&wiki)?)
        .execute(&self.pool)
        .await?;
        Ok(wiki)
    }

    async fn get_story(&self, schema: &str, id: i64) -> Result<Option<Story>> {
        let row = sqlx::query("SELECT details FROM story WHERE schema = $1 AND id = $2")
            .bind(schema)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode(r.get("details"))).transpose()
    }

    async fn find_story_by_external(
        &self,
        schema: &str,
        key: ExternalKey,
    ) -> Result<Option<Story>> {
        let row = sqlx::query(
            "SELECT details FROM story
             WHERE schema = $1 AND server_id = $2 AND external_id = $3",
        )
        .bind(schema)
        .bind(key.server_id)
        .bind(key.id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| decode(r.get("details"))).transpose()
    }

    async fn find_stories_of_kind(&self, schema: &str, kind: &str) -> Result<Vec<Story>> {
        let rows =
            sqlx::query("SELECT details FROM story WHERE schema = $1 AND kind = $2 ORDER BY id")
                .bind(schema)
                .bind(kind)
                .fetch_all(&self.pool)
                .await?;
        decode_all(rows)
    }

    async fn save_story(&self, schema: &str, mut story: Story) -> Result<Story> {
        if story.id == 0 {
            let row = sqlx::query(
                "INSERT INTO story (schema, deleted, kind, server_id, external_id, details)
                 VALUES ($1, $2, $3, $4, $5, '{}'::jsonb) RETURNING id",
            )
            .bind(schema)
            .bind(story.deleted)
            .bind(&story.kind)
            .bind(story.external.map(|e| e.server_id))
            .bind(story.external.map(|e| e.id))
            .fetch_one(&self.pool)
            .await?;
            story.id = row.get("id");
        }
        sqlx::query(
            "INSERT INTO story (id, schema, deleted, kind, server_id, external_id, details)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO UPDATE
             SET deleted = $3, kind = $4, server_id = $5, external_id = $6, details = $7",
        )
        .bind(story.id)
        .bind(schema)
        .bind(story.deleted)
        .bind(&story.kind)
        .bind(story.external.map(|e| e.server_id))
        .bind(story.external.map(|e| e.id))
        .bind(serde_json::to_value(&story)?)
        .execute(&self.pool)
        .await?;
        Ok(story)
    }

    async fn get_task(&self, schema: &str, id: i64) -> Result<Option<TaskRow>> {
        let row = sqlx::query("SELECT details FROM task WHERE schema = $1 AND id = $2")
            .bind(schema)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode(r.get("details"))).transpose()
    }

    async fn find_task_by_token(&self, schema: &str, token: &str) -> Result<Option<TaskRow>> {
        let row = sqlx::query("SELECT details FROM task WHERE schema = $1 AND token = $2")
            .bind(schema)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode(r.get("details"))).transpose()
    }

    async fn find_task(
        &self,
        schema: &str,
        action: &str,
        options: &Value,
    ) -> Result<Option<TaskRow>> {
        let row = sqlx::query(
            "SELECT details FROM task
             WHERE schema = $1 AND action = $2 AND options = $3
             ORDER BY id DESC LIMIT 1",
        )
        .bind(schema)
        .bind(action)
        .bind(options)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| decode(r.get("details"))).transpose()
    }

    async fn find_failed_tasks(
        &self,
        schema: &str,
        action: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TaskRow>> {
        let rows = sqlx::query(
            "SELECT details FROM task
             WHERE schema = $1 AND action = $2 AND failed AND NOT deleted AND ctime > $3
             ORDER BY id",
        )
        .bind(schema)
        .bind(action)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows)
    }

    async fn save_task(&self, schema: &str, mut row: TaskRow) -> Result<TaskRow> {
        if row.id == 0 {
            let inserted = sqlx::query(
                "INSERT INTO task (schema, deleted, action, options, failed, ctime, token, details)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, '{}'::jsonb) RETURNING id",
            )
            .bind(schema)
            .bind(row.deleted)
            .bind(&row.action)
            .bind(&row.options)
            .bind(row.failed)
            .bind(row.ctime)
            .bind(&row.token)
            .fetch_one(&self.pool)
            .await?;
            row.id = inserted.get("id");
        }
        sqlx::query(
            "INSERT INTO task (id, schema, deleted, action, options, failed, ctime, token, details)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (id) DO UPDATE
             SET deleted = $3, action = $4, options = $5, failed = $6, ctime = $7,
                 token = $8, details = $9",
        )
        .bind(row.id)
        .bind(schema)
        .bind(row.deleted)
        .bind(&row.action)
        .bind(&row.options)
        .bind(row.failed)
        .bind(row.ctime)
        .bind(&row.token)
        .bind(serde_json::to_value(&row)?)
        .execute(&self.pool)
        .await?;
        Ok(row)
    }

    async fn schemas(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM project WHERE NOT deleted ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("name")).collect())
    }
}
