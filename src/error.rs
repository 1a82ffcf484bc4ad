//! Error types for charla
//!
//! Uses `thiserror` for ergonomic error definitions. Store-level failures are
//! wrapped unchanged so callers can match on the precise cause.

use std::io;
use thiserror::Error;

use charla_document::document::DocumentStoreError;

/// Main error type for charla operations
#[derive(Error, Debug)]
pub enum CharlaError {
    /// Failure reported by the document store
    #[error(transparent)]
    Store(#[from] DocumentStoreError),

    /// Configuration parsing or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CharlaError {
    /// Whether this is a uniqueness or required-field violation
    pub fn is_validation(&self) -> bool {
        matches!(self, CharlaError::Store(DocumentStoreError::ValidationError(_)))
    }

    /// The wrapped store error, if any
    pub fn store_error(&self) -> Option<&DocumentStoreError> {
        match self {
            CharlaError::Store(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for charla operations
pub type Result<T> = std::result::Result<T, CharlaError>;
