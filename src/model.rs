//! Domain rows consumed and produced by the adapter.
//!
//! These mirror what the relational storage layer holds for the tables the
//! sync pipeline touches. Rows link to their GitLab counterparts through an
//! [`ExternalKey`], the `(server_id, external object id)` pair. Fields the
//! importers overwrite are "external" fields; everything else is local-only
//! and must survive reconciliation untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema name for rows that are not project-scoped.
pub const GLOBAL_SCHEMA: &str = "global";

/// The stored `(server_id, external object id)` tuple that ties a local row
/// to its counterpart in GitLab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalKey {
    pub server_id: i64,
    pub id: i64,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A registered GitLab server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub deleted: bool,
    pub disabled: bool,
    /// Base URL of the GitLab instance (e.g. "https://gitlab.example.com").
    pub api_url: Option<String>,
    /// API access token with admin scope.
    pub api_token: Option<String>,
}

impl Server {
    /// A server can only be synced against when it is enabled and has
    /// working API credentials.
    pub fn is_usable(&self) -> bool {
        !self.deleted && !self.disabled && self.api_url.is_some() && self.api_token.is_some()
    }
}

// ---------------------------------------------------------------------------
// Repo
// ---------------------------------------------------------------------------

/// A local repo row linked to exactly one external GitLab project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repo {
    pub id: i64,
    pub deleted: bool,
    pub external: ExternalKey,
    pub name: String,
    pub default_branch: Option<String>,
    pub archived: bool,
    pub issues_enabled: bool,
    pub web_url: Option<String>,
    /// Tri-state: Some(true) = template repo, Some(false) = detected as
    /// not a template, None = not yet examined.
    pub template: Option<bool>,
    /// Head commit of the last imported snapshot (template repos only).
    pub snapshot_commit: Option<String>,
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// An internal project. Its name doubles as the per-project schema name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub deleted: bool,
    pub archived: bool,
    pub name: String,
    pub repo_ids: Vec<i64>,
    pub user_ids: Vec<i64>,
    /// Repo providing the project's website template, if any.
    pub template_repo_id: Option<i64>,
}

impl Project {
    /// A repo is connected to a project when the project is live and lists
    /// the repo as a member.
    pub fn is_connected(&self, repo_id: i64) -> bool {
        !self.archived && !self.deleted && self.repo_ids.contains(&repo_id)
    }
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A user account, possibly imported from a GitLab server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub deleted: bool,
    pub disabled: bool,
    pub username: String,
    pub name: Option<String>,
    pub email: Option<String>,
    /// Role assigned locally; never overwritten by import.
    pub role: Option<String>,
    pub external: Option<ExternalKey>,
}

// ---------------------------------------------------------------------------
// Wiki
// ---------------------------------------------------------------------------

/// A wiki page belonging to one repo, identified by its slug on the
/// GitLab side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wiki {
    pub id: i64,
    pub deleted: bool,
    pub repo_id: i64,
    pub external: ExternalKey,
    pub slug: String,
    pub title: String,
    pub content: Option<String>,
    /// Slugs of other pages referenced from this page's content.
    pub references: Vec<String>,
    /// Explicitly selected for publication. Local-only.
    pub chosen: bool,
    /// Derived visibility: chosen, or reachable from a chosen page.
    pub public: bool,
    /// Suppressed from listings. Local-only.
    pub hidden: bool,
    pub mtime: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Story
// ---------------------------------------------------------------------------

/// An activity-feed story. Issues are the ones the exporter pushes back
/// out to GitLab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: i64,
    pub deleted: bool,
    #[serde(rename = "type")]
    pub kind: String,
    pub details: Value,
    /// Authors; first entry is the lead author.
    pub user_ids: Vec<i64>,
    pub external: Option<ExternalKey>,
    pub mtime: DateTime<Utc>,
    /// Last import time, set when the row was written by an importer.
    pub itime: Option<DateTime<Utc>>,
    /// Last export time, set when the row was pushed to GitLab.
    pub etime: Option<DateTime<Utc>>,
}

impl Story {
    /// True when the most recent modification came from an import or an
    /// export rather than a user edit.
    pub fn is_self_caused(&self) -> bool {
        self.itime == Some(self.mtime) || self.etime == Some(self.mtime)
    }
}

// ---------------------------------------------------------------------------
// Task row
// ---------------------------------------------------------------------------

/// Action name of persisted issue-export tasks.
pub const ACTION_EXPORT_ISSUE: &str = "export-issue";

/// A persisted task record. Doubles as the progress log written by
/// `TaskLog` and as the lifecycle row of an issue export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: i64,
    pub deleted: bool,
    pub action: String,
    /// Identifying parameters of the operation instance.
    pub options: Value,
    /// 0–100, or None while the operation is still busy.
    pub completion: Option<i32>,
    /// Accumulated free-form detail, including `error` on failure.
    pub details: Value,
    pub failed: bool,
    /// User that created the task (the exporting user for exports).
    pub user_id: Option<i64>,
    pub ctime: DateTime<Utc>,
    /// Completion timestamp, set when the task finishes.
    pub etime: Option<DateTime<Utc>>,
    /// Resumption token for tasks driven across multiple HTTP requests.
    pub token: Option<String>,
}

// ---------------------------------------------------------------------------
// System settings
// ---------------------------------------------------------------------------

/// Singleton system settings row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSettings {
    /// Public address of this installation; webhook callbacks point here.
    pub address: Option<String>,
}

impl SystemSettings {
    /// Address with any trailing slashes removed, so cosmetic differences
    /// don't register as a host change.
    pub fn trimmed_address(&self) -> Option<String> {
        trim_address(self.address.as_deref())
    }
}

/// Strip trailing slashes from an address, mapping empty to None.
pub fn trim_address(address: Option<&str>) -> Option<String> {
    let addr = address?.trim_end_matches('/');
    if addr.is_empty() {
        None
    } else {
        Some(addr.to_string())
    }
}
