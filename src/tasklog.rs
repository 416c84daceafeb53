//! Progress and telemetry records for long-running operations.
//!
//! Every import, export, and hook pass owns a [`TaskLog`]. Detail written
//! into it accumulates in memory and is persisted as a task row, debounced
//! so a burst of progress reports costs at most one write per coalesce
//! window while never going stale for long. Logs that recorded nothing are
//! never saved. A registry keeps resumable logs addressable by token across
//! HTTP requests and force-saves unsaved progress at shutdown.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::TaskRow;
use crate::store::Store;

/// Coalesce window: bursts of reports collapse into one write per window.
const SAVE_COALESCE: Duration = Duration::from_millis(1500);
/// Staleness bound: force a write when the last save is older than this.
const SAVE_STALENESS: Duration = Duration::from_millis(5000);

struct LogState {
    row_id: Option<i64>,
    token: Option<String>,
    user_id: Option<i64>,
    completion: Option<i32>,
    details: Map<String, Value>,
    description: Option<String>,
    /// True until any detail is recorded; a log that did nothing is
    /// never persisted.
    noop: bool,
    saved: bool,
    failed: bool,
    aborted: bool,
    finished: bool,
    multiparts: Option<HashMap<String, bool>>,
    last_saved: Option<Instant>,
    timer_armed: bool,
    ctime: DateTime<Utc>,
}

struct Shared {
    action: String,
    options: Value,
    schema: String,
    store: Option<Arc<dyn Store>>,
    registry: Option<Arc<TaskLogRegistry>>,
    state: Mutex<LogState>,
}

/// Structured, resumable progress recorder for one operation.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TaskLog {
    shared: Arc<Shared>,
}

impl TaskLog {
    /// Start a console-only log. Nothing is persisted.
    pub fn start(action: &str, options: Value) -> TaskLog {
        Self::build(action, options, String::new(), None, None, None, None)
    }

    /// Start a log that persists itself as a task row in `schema`.
    pub fn start_saved(
        registry: &Arc<TaskLogRegistry>,
        store: Arc<dyn Store>,
        schema: &str,
        action: &str,
        options: Value,
    ) -> TaskLog {
        let log = Self::build(
            action,
            options,
            schema.to_string(),
            Some(store),
            Some(registry.clone()),
            None,
            None,
        );
        registry.register(&log);
        log
    }

    fn build(
        action: &str,
        options: Value,
        schema: String,
        store: Option<Arc<dyn Store>>,
        registry: Option<Arc<TaskLogRegistry>>,
        row_id: Option<i64>,
        token: Option<String>,
    ) -> TaskLog {
        TaskLog {
            shared: Arc::new(Shared {
                action: action.to_string(),
                options,
                schema,
                store,
                registry,
                state: Mutex::new(LogState {
                    row_id,
                    token,
                    user_id: None,
                    completion: None,
                    details: Map::new(),
                    description: None,
                    noop: true,
                    saved: true,
                    failed: false,
                    aborted: false,
                    finished: false,
                    multiparts: None,
                    last_saved: None,
                    timer_armed: false,
                    ctime: Utc::now(),
                }),
            }),
        }
    }

    pub fn action(&self) -> &str {
        &self.shared.action
    }

    pub fn options(&self) -> &Value {
        &self.shared.options
    }

    pub fn finished(&self) -> bool {
        self.shared.state.lock().unwrap().finished
    }

    pub fn failed(&self) -> bool {
        self.shared.state.lock().unwrap().failed
    }

    pub fn completion(&self) -> Option<i32> {
        self.shared.state.lock().unwrap().completion
    }

    pub fn noop(&self) -> bool {
        self.shared.state.lock().unwrap().noop
    }

    /// Register the named sub-phases of a multipart operation. The log only
    /// finishes once every part has been finished individually.
    pub fn require_parts(&self, parts: &[&str]) {
        let mut state = self.shared.state.lock().unwrap();
        let map = state.multiparts.get_or_insert_with(HashMap::new);
        for part in parts {
            map.entry(part.to_string()).or_insert(false);
        }
    }

    /// Record a detail value.
    pub fn set(&self, key: &str, value: impl Into<Value>) {
        let mut state = self.shared.state.lock().unwrap();
        if state.finished {
            return;
        }
        state.details.insert(key.to_string(), value.into());
        state.noop = false;
        state.saved = false;
    }

    /// Merge an object of detail values.
    pub fn merge(&self, values: Value) {
        let Value::Object(entries) = values else {
            return;
        };
        let mut state = self.shared.state.lock().unwrap();
        if state.finished {
            return;
        }
        for (key, value) in entries {
            state.details.insert(key, value);
        }
        state.noop = false;
        state.saved = false;
    }

    /// Append an item to a detail list (e.g. names of added rows).
    pub fn append(&self, key: &str, item: impl Into<Value>) {
        let mut state = self.shared.state.lock().unwrap();
        if state.finished {
            return;
        }
        let list = state
            .details
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = list {
            items.push(item.into());
        }
        state.noop = false;
        state.saved = false;
    }

    /// Set the current-activity line and render it. A progress preview,
    /// not a persisted fact.
    pub fn describe(&self, text: &str) {
        let mut state = self.shared.state.lock().unwrap();
        if state.finished {
            return;
        }
        state.description = Some(text.to_string());
        info!(action = %self.shared.action, "{text}");
    }

    /// Record progress as a percentage and schedule a debounced save.
    pub fn report(&self, current: usize, total: usize) {
        let stale;
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.finished || total == 0 {
                return;
            }
            let completion = ((current as f64 / total as f64) * 100.0).round() as i32;
            state.completion = Some(completion.clamp(0, 100));
            state.noop = false;
            state.saved = false;
            if self.shared.store.is_none() {
                return;
            }
            stale = state
                .last_saved
                .is_none_or(|at| at.elapsed() >= SAVE_STALENESS);
            if !stale {
                if state.timer_armed {
                    return; // a save is already pending
                }
                state.timer_armed = true;
            }
        }
        let log = self.clone();
        tokio::spawn(async move {
            if !stale {
                tokio::time::sleep(SAVE_COALESCE).await;
            }
            log.save().await;
        });
    }

    /// Mark the operation (or one of its parts) complete and persist.
    pub async fn finish(&self, part: Option<&str>) {
        // The guard must end before the await points below.
        let all_done = {
            let mut state = self.shared.state.lock().unwrap();
            if state.finished {
                return;
            }
            let parts_pending = match (part, state.multiparts.as_mut()) {
                (Some(part), Some(parts)) => {
                    parts.insert(part.to_string(), true);
                    !parts.values().all(|done| *done)
                }
                _ => false,
            };
            if !parts_pending {
                state.finished = true;
                state.completion = Some(100);
            }
            state.saved = false;
            !parts_pending
        };
        self.save().await;
        if all_done {
            self.evict();
        }
    }

    /// Mark the operation aborted, record the error, persist, unregister.
    pub async fn abort(&self, err: &Error) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.finished {
                return;
            }
            state.aborted = true;
            state.failed = true;
            state.saved = false;
            let mut detail = json!({ "message": err.to_string() });
            if let Some(status) = err.gitlab_status() {
                detail["status"] = status.into();
            }
            if cfg!(debug_assertions) {
                detail["debug"] = format!("{err:?}").into();
            }
            state.details.insert("error".to_string(), detail);
        }
        self.save().await;
        self.evict();
    }

    /// Persist the current state as a task row.
    ///
    /// No-op when the log isn't in saving mode, or when nothing was ever
    /// recorded and the log hasn't aborted.
    pub async fn save(&self) {
        let Some(store) = self.shared.store.as_ref() else {
            return;
        };
        let mut row = {
            let mut state = self.shared.state.lock().unwrap();
            state.timer_armed = false;
            if state.saved || (state.noop && !state.aborted) {
                return;
            }
            TaskRow {
                id: state.row_id.unwrap_or(0),
                deleted: false,
                action: self.shared.action.clone(),
                options: self.shared.options.clone(),
                completion: state.completion,
                details: Value::Object(state.details.clone()),
                failed: state.failed,
                user_id: state.user_id,
                ctime: state.ctime,
                etime: if state.finished || state.aborted {
                    Some(Utc::now())
                } else {
                    None
                },
                token: state.token.clone(),
            }
        };
        // Adopt an existing row for the same operation instance, so repeated
        // runs update one record instead of piling up.
        if row.id == 0
            && let Ok(Some(existing)) = store
                .find_task(&self.shared.schema, &row.action, &row.options)
                .await
        {
            row.id = existing.id;
            row.ctime = existing.ctime;
        }
        match store.save_task(&self.shared.schema, row).await {
            Ok(saved) => {
                let mut state = self.shared.state.lock().unwrap();
                state.row_id = Some(saved.id);
                state.saved = true;
                state.last_saved = Some(Instant::now());
            }
            Err(e) => warn!(action = %self.shared.action, "failed to save task log: {e}"),
        }
    }

    fn evict(&self) {
        if let Some(registry) = self.shared.registry.as_ref() {
            registry.remove(self);
        }
    }
}

impl fmt::Debug for TaskLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskLog")
            .field("action", &self.shared.action)
            .field("schema", &self.shared.schema)
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Process-wide table of live saving logs and token-resumable logs.
#[derive(Default)]
pub struct TaskLogRegistry {
    live: Mutex<Vec<TaskLog>>,
    resumable: Mutex<HashMap<(String, String), TaskLog>>,
}

impl TaskLogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, log: &TaskLog) {
        self.live.lock().unwrap().push(log.clone());
    }

    fn remove(&self, log: &TaskLog) {
        self.live
            .lock()
            .unwrap()
            .retain(|l| !Arc::ptr_eq(&l.shared, &log.shared));
        let token = log.shared.state.lock().unwrap().token.clone();
        if let Some(token) = token {
            self.resumable
                .lock()
                .unwrap()
                .remove(&(log.shared.schema.clone(), token));
        }
    }

    /// Find or reconstruct the log for a previously created task row,
    /// looked up by resumption token.
    ///
    /// The caller's action must match the row's; a token for one kind of
    /// operation cannot drive another.
    pub async fn obtain(
        self: &Arc<Self>,
        store: Arc<dyn Store>,
        schema: &str,
        token: &str,
        action: &str,
    ) -> Result<TaskLog> {
        let key = (schema.to_string(), token.to_string());
        if let Some(log) = self.resumable.lock().unwrap().get(&key) {
            if log.shared.action != action {
                return Err(Error::ActionMismatch);
            }
            return Ok(log.clone());
        }
        let row = store
            .find_task_by_token(schema, token)
            .await?
            .ok_or(Error::NotFound("task"))?;
        if row.action != action {
            return Err(Error::ActionMismatch);
        }
        let log = TaskLog::build(
            &row.action,
            row.options.clone(),
            schema.to_string(),
            Some(store),
            Some(self.clone()),
            Some(row.id),
            Some(token.to_string()),
        );
        log.require_parts(&[]);
        {
            let mut state = log.shared.state.lock().unwrap();
            state.ctime = row.ctime;
        }
        self.register(&log);
        self.resumable.lock().unwrap().insert(key, log.clone());
        Ok(log)
    }

    /// Force-save every log with unsaved progress, flagging it as
    /// interrupted. Called once when the process is shutting down.
    pub async fn shutdown(&self) {
        let logs: Vec<TaskLog> = self.live.lock().unwrap().drain(..).collect();
        for log in logs {
            let dirty = {
                let mut state = log.shared.state.lock().unwrap();
                let dirty = !state.saved && (!state.noop || state.aborted) && !state.finished;
                if dirty {
                    state.failed = true;
                    state
                        .details
                        .insert("error".to_string(), json!({ "message": "Interrupted by shutdown" }));
                }
                dirty
            };
            if dirty {
                log.save().await;
            }
        }
        self.resumable.lock().unwrap().clear();
    }
}
