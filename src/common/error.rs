//! Error types for shardkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Persistence errors ===
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    // === Raft errors ===
    #[error("Not leader")]
    NotLeader,

    // === Network errors ===
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    // === Config errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Unreachable(_) | Error::NotLeader
        )
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}
