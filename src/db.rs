//! Database connection pool, migrations, and the change-notification source.
//!
//! Storage triggers publish row changes over LISTEN/NOTIFY; this module
//! turns them into a stream of [`ChangeEvent`] values the dispatcher
//! consumes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A row-change notification from the storage layer.
///
/// `diff` carries a key per changed top-level field. The dispatcher decides
/// relevance from key presence alone and never inspects the flag values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub schema: String,
    pub table: String,
    pub id: i64,
    #[serde(default)]
    pub current: Value,
    #[serde(default)]
    pub previous: Value,
    #[serde(default)]
    pub diff: Map<String, Value>,
}

impl ChangeEvent {
    /// Did this top-level field change?
    pub fn changed(&self, field: &str) -> bool {
        self.diff.contains_key(field)
    }
}

/// Subscribe to the change channel and forward parsed events into a channel.
///
/// Listener errors are logged and the loop keeps going; the periodic import
/// sweep covers anything missed while the connection was down.
pub async fn listen_for_changes(
    pool: &PgPool,
    channel: &str,
) -> Result<mpsc::Receiver<ChangeEvent>> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(channel).await?;
    info!(channel, "listening for change notifications");

    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(async move {
        loop {
            match listener.recv().await {
                Ok(notification) => {
                    match serde_json::from_str::<ChangeEvent>(notification.payload()) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                return; // receiver dropped, shutting down
                            }
                        }
                        Err(e) => warn!("unparseable change notification: {e}"),
                    }
                }
                Err(e) => {
                    warn!("change listener error: {e}, reconnecting");
                }
            }
        }
    });
    Ok(rx)
}
