//! Error types for ctxreport-core

use thiserror::Error;

/// Main error type for the ctxreport-core library
#[derive(Error, Debug)]
pub enum Error {
    /// A context source cannot run on this host (probe failed, permission denied)
    #[error("{source_type} not supported: {reason}")]
    NotSupported { source_type: String, reason: String },

    /// A single sampling attempt failed
    #[error("failed to retrieve {source_type} state: {message}")]
    Retrieval {
        source_type: String,
        message: String,
    },

    /// Sample store operation failed
    #[error("storage error: {0}")]
    Storage(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No usable session or access token
    #[error("session not found")]
    Unauthenticated,

    /// Report cycle failed (transmission, gather or cleanup)
    #[error("context report failed: {message}")]
    Report {
        /// HTTP status returned by the collector, if a response was received
        status: Option<u16>,
        message: String,
    },

    /// Caller supplied an unusable argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn report(message: impl Into<String>) -> Self {
        Error::Report {
            status: None,
            message: message.into(),
        }
    }

    /// True for store-level failures, whichever backend produced them
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Database(_))
    }
}

/// Result type alias for ctxreport-core
pub type Result<T> = std::result::Result<T, Error>;
