//! Error types for the Cosmos relay

use thiserror::Error;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain error during {operation}: {message}")]
    Chain { operation: String, message: String },

    #[error("unsupported message type {type_url}")]
    MsgUnsupported { type_url: String },

    #[error("Invalid message: {0}")]
    InvalidMsg(String),

    #[error("Keystore error: {0}")]
    Keystore(String),

    #[error("Gas price error: {0}")]
    GasPrice(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("limit must be greater than 0")]
    InvalidLimit,

    #[error("must provide txHash when updating state to broadcasted")]
    MissingTxHash,

    #[error("expected {expected} records updated, got {got}")]
    RowCountMismatch { expected: usize, got: u64 },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Contract cache error: {0}")]
    Cache(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Shorthand for a failed chain client call
    pub fn chain(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        RelayerError::Chain {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::Chain { .. } | RelayerError::Timeout { .. } | RelayerError::Cache(_)
        )
    }
}

/// Result type for relay operations
pub type RelayerResult<T> = Result<T, RelayerError>;
