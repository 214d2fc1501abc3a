use std::time::Duration;

use thiserror::Error;

/// Errors returned by rpc-failover operations.
///
/// Probe failures never leave the prober as an `Err`; they are folded into a
/// failed [`ProbeResult`](crate::ProbeResult). The variants below surface from
/// configuration, storage, and selection.
#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("no successful probes for chain {chain_id}")]
    NoSuccessfulProbes { chain_id: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for FailoverError {
    fn from(e: reqwest::Error) -> Self {
        FailoverError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FailoverError>;
