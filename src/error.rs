//! Error types for the adapter.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("hook secret mismatch")]
    Forbidden,

    #[error("task action mismatch")]
    ActionMismatch,

    #[error("{0}")]
    Precondition(String),

    #[error("gitlab returned {status}: {message}")]
    GitLab { status: u16, message: String },

    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// HTTP status to report for this error on the inbound surfaces.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::Forbidden | Error::ActionMismatch => 403,
            Error::GitLab { status, .. } => *status,
            _ => 400,
        }
    }

    /// A permanent failure is one that retrying cannot fix: a 4xx from
    /// GitLab, a missing row, a rejected secret. Transient failures
    /// (network errors, 5xx) stay eligible for the periodic retry sweeps.
    pub fn is_permanent(&self) -> bool {
        match self {
            Error::GitLab { status, .. } => (400..500).contains(status),
            Error::NotFound(_) | Error::Forbidden | Error::ActionMismatch => true,
            Error::Precondition(_) => true,
            _ => false,
        }
    }

    /// GitLab status code, if this error came back from the API.
    pub fn gitlab_status(&self) -> Option<u16> {
        match self {
            Error::GitLab { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
