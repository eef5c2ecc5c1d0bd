// src/error.rs
//! Typed failure outcomes exposed by the core.
//!
//! Malformed input (no rule match, unparsable amount) is not an error: those
//! paths return `None` / `Outcome::Ignored`. Everything here is either a
//! transient remote failure or a local storage failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("create store directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store connection lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{endpoint} answered with status {status}")]
    Status { endpoint: &'static str, status: u16 },

    #[error("decode {endpoint} response: {reason}")]
    Decode {
        endpoint: &'static str,
        reason: String,
    },
}

/// Rule refresh failures. Always swallowed by the background loop; the
/// previous cache stays authoritative.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("serialize rule set: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no signed-in session")]
    NotSignedIn,
}

/// Entitlement-changing calls. Unlike rule sync these surface to the caller
/// because they gate a paid feature.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("no signed-in session")]
    NotSignedIn,

    #[error("upgrade rejected by server: {0}")]
    Rejected(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("local store unavailable, event dropped: {0}")]
    Store(#[from] StoreError),
}
