use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::chain::model::ChainId;

/// Engine errors surfaced to callers and collaborators
#[derive(Error, Debug)]
pub enum ChainError {
    // Registration / lookup errors
    #[error("Chain already registered: {chain_id}")]
    DuplicateRegistration { chain_id: ChainId },

    #[error("Unknown chain: {chain_id}")]
    UnknownChain { chain_id: ChainId },

    // Persistence errors
    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Configuration errors
    #[error("Configuration invalid: {0}")]
    InvalidConfiguration(String),

    // System errors
    #[error("System shutdown in progress")]
    SystemShutdown,

    #[error("Channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChainError {
    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub fn unknown(chain_id: impl Into<ChainId>) -> Self {
        Self::UnknownChain {
            chain_id: chain_id.into(),
        }
    }

    /// Persistence-class errors are logged and retried, never surfaced
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Self::Persistence(_) | Self::Database(_) | Self::Json(_) | Self::Io(_)
        )
    }
}

/// Result type alias for ChainError
pub type Result<T> = std::result::Result<T, ChainError>;

/// Error returned by a chain's execution callable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionError {
    /// Ordinary failure, handled by the retry policy
    Failed(String),
    /// Failure that must not be retried
    Fatal(String),
    /// Cancelled by the monitor after exceeding the execution ceiling
    Timeout(Duration),
    /// The callable panicked
    Panicked(String),
}

impl ExecutionError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Panicked(_))
    }
}

impl From<anyhow::Error> for ExecutionError {
    fn from(err: anyhow::Error) -> Self {
        ExecutionError::Failed(err.to_string())
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionError::Failed(msg) => write!(f, "{}", msg),
            ExecutionError::Fatal(msg) => write!(f, "fatal: {}", msg),
            ExecutionError::Timeout(limit) => write!(f, "timed out after {:?}", limit),
            ExecutionError::Panicked(msg) => write!(f, "panicked: {}", msg),
        }
    }
}

impl std::error::Error for ExecutionError {}

impl From<tokio::sync::oneshot::error::RecvError> for ChainError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        ChainError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_retryable() {
        assert!(ExecutionError::failed("boom").is_retryable());
        assert!(ExecutionError::Panicked("oops".into()).is_retryable());
        assert!(!ExecutionError::fatal("bad input").is_retryable());
        assert!(!ExecutionError::Timeout(Duration::from_secs(60)).is_retryable());
    }

    #[test]
    fn test_persistence_classification() {
        assert!(ChainError::persistence("disk full").is_persistence());
        let io_err = ChainError::Io(io::Error::new(io::ErrorKind::Other, "eio"));
        assert!(io_err.is_persistence());
        assert!(!ChainError::unknown("c1").is_persistence());
    }

    #[test]
    fn test_error_display() {
        let err = ChainError::DuplicateRegistration {
            chain_id: "chain-123".to_string(),
        };
        assert!(err.to_string().contains("chain-123"));

        let exec = ExecutionError::Timeout(Duration::from_secs(30));
        assert!(exec.to_string().contains("30s"));
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: ExecutionError = anyhow::anyhow!("upstream refused").into();
        assert_eq!(err, ExecutionError::Failed("upstream refused".to_string()));
    }
}
