//! Error types for the core item model.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while working with core model values.
#[derive(Error, Debug)]
pub enum Error {
    /// Metadata (de)serialization error.
    #[error("metadata encoding error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// An item was produced without the fields the pipeline requires.
    #[error("invalid item: {0}")]
    InvalidItem(String),
}
