//! Chronicle ingestion and storage engine.
//!
//! Chronicle aggregates a user's content from many services (photos,
//! posts, messages, location history) into one local, append-only,
//! content-addressed archive: a SQLite index plus adjacent data files.
//!
//! # Modules
//!
//! - [`store`] - the archive repository and its index database
//! - [`session`] - the per-account operation driver
//! - [`source`] - the data-source adapter surface and registry
//! - `pipeline` - graph-consuming workers and the item storage policy
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ Data-source      │  (APIs, export files; external adapters)
//! │ adapter clients  │
//! └────────┬─────────┘
//!          │ Arc<ItemGraph> over a bounded channel
//!          ▼
//! ┌──────────────────┐
//! │  Worker pool     │  dedup, soft merge, integrity, per-item locks
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │  Archive         │  index.db + data/YYYY/MM/<source>/ files
//! └──────────────────┘
//! ```
//!
//! The archive is the source of truth; every operation is idempotent
//! and restartable through per-account checkpoints.
//!
//! # Example
//!
//! ```no_run
//! use chronicle_ingest::{Archive, ProcessingOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> chronicle_ingest::Result<()> {
//! chronicle_ingest::source::jsonl::register()?;
//!
//! let archive = Archive::open("./chronicle_repo")?;
//! archive.add_account("jsonl_export", "me")?;
//!
//! let session = archive.new_session("jsonl_export", "me")?;
//! session
//!     .import(
//!         CancellationToken::new(),
//!         "export.jsonl".into(),
//!         ProcessingOptions::default(),
//!     )
//!     .await?;
//!
//! archive.close();
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod audit;
pub mod auth;
pub mod error;
pub mod filter;
pub mod options;
pub mod ratelimit;
pub mod session;
pub mod source;
pub mod store;

mod checkpoint;
mod files;
mod identity;
mod lock;
mod pipeline;
mod prune;

#[cfg(test)]
mod testutil;

// Re-export commonly used types at the crate root.
pub use account::Account;
pub use audit::{AuditFinding, AuditReport};
pub use error::{Error, Result};
pub use filter::PresenceFilter;
pub use identity::{Person, PersonIdentity};
pub use options::{MergeOptions, ProcessingOptions, Timeframe};
pub use ratelimit::{RateLimit, RateLimiter};
pub use session::Session;
pub use source::{
    register, AuthenticateFn, CheckpointRecorder, Client, DataSource, ListOptions, NewClientFn,
};
pub use store::Archive;
