//! Error types for the ingestion engine.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while ingesting into an archive.
#[derive(Error, Debug)]
pub enum Error {
    /// Index database error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error (checkpoints, metadata).
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Core model error.
    #[error(transparent)]
    Core(#[from] chronicle_core::Error),

    /// Misconfiguration: unregistered source, malformed account, missing
    /// filename, and the like. Fatal to the operation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Missing or broken credential blob. Surfaced to the driver so it
    /// can prompt for reauthorization.
    #[error("authorization error: {0}")]
    Authorization(String),

    /// Error reported by a data-source adapter.
    #[error("data source error: {0}")]
    Source(anyhow::Error),

    /// Soft merge matched more than one existing row; the item is
    /// skipped rather than merged into the wrong row.
    #[error("ambiguous soft merge: {matches} existing items match incoming item {original_id}")]
    AmbiguousMerge { matches: i64, original_id: String },

    /// A checkpoint is recorded for the account, so the presence filter
    /// cannot be trusted to be complete.
    #[error("checkpoint exists; refusing to prune for fear of an incomplete item listing")]
    CheckpointExists,

    /// Data file handling failure.
    #[error("data file error: {0}")]
    DataFile(String),

    /// The operation was cancelled before completing.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether retrying the whole operation may help: transient database
    /// contention, I/O, and adapter (network) failures qualify;
    /// configuration and consistency errors do not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Error::Io(_) | Error::Source(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_errors_are_transient() {
        let err = Error::Source(anyhow::anyhow!("connection reset"));
        assert!(err.is_transient());
    }

    #[test]
    fn test_config_errors_are_not_transient() {
        let err = Error::Config("data source not registered: gopher".to_string());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_checkpoint_exists_display() {
        let msg = Error::CheckpointExists.to_string();
        assert!(msg.contains("refusing to prune"));
    }

    #[test]
    fn test_ambiguous_merge_display() {
        let err = Error::AmbiguousMerge {
            matches: 3,
            original_id: "abc".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains('3'));
        assert!(msg.contains("abc"));
    }
}
