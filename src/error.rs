use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure talking to a broker or market data port.
///
/// Every variant is recoverable: the engine substitutes a safe default for the
/// affected call and lets the next tick try again.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for PortError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return PortError::Decode(err.to_string());
        }
        PortError::Transport(err.to_string())
    }
}

/// Failure reading or writing the trade ledger file.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger json error: {0}")]
    Json(#[from] serde_json::Error),
}
