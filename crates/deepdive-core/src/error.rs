use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::session::Phase;

/// Core error type for DeepDive.
#[derive(Debug, Error)]
pub enum DeepDiveError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("caller is not allowed to access session {0}")]
    Unauthorized(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeepDiveError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }
}

/// Failures raised by a Knowledge Store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("corrupt session record {session_id}: {reason}")]
    Corrupt { session_id: String, reason: String },
    #[error("session {0} already exists")]
    Conflict(String),
    #[cfg(feature = "postgres-store")]
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn corrupt(session_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            session_id: session_id.into(),
            reason: reason.into(),
        }
    }
}

/// A failure while executing one phase of a session.
///
/// The `Display` output is what gets persisted as the session's error message.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("{stage} model call failed: {source:#}")]
    Model {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("search for \"{query}\" failed: {source:#}")]
    Search {
        query: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{phase} step exceeded its deadline of {}ms", .after.as_millis())]
    Timeout { phase: Phase, after: Duration },
    #[error("unusable {stage} output: {reason}")]
    Unparseable { stage: &'static str, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StepError {
    pub fn model(stage: &'static str, source: anyhow::Error) -> Self {
        Self::Model { stage, source }
    }

    pub fn unparseable(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::Unparseable {
            stage,
            reason: reason.into(),
        }
    }
}

/// Errors surfaced to whoever invoked `advance`.
///
/// Step failures are not represented here: they are persisted on the session
/// and reported through `AdvanceOutcome::Failed`.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<DriverError> for DeepDiveError {
    fn from(value: DriverError) -> Self {
        match value {
            DriverError::NotFound(id) => DeepDiveError::SessionNotFound(id),
            DriverError::Store(err) => DeepDiveError::Store(err),
        }
    }
}
