use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Every latency probing strategy failed for every attempt of a series.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Every concurrent connection of a throughput measurement failed.
    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Timeout error: {phase} did not settle within {limit:?}")]
    Timeout { phase: String, limit: Duration },

    #[error("Test cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// True for the variant produced by a caller-initiated stop.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
