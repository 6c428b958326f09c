//! The archive store: the repository directory and its index database.
//!
//! An [`Archive`] owns the single SQLite handle for `index.db`, the
//! repository directory tree (`data/YYYY/MM/<source>/...` for content
//! files), and the per-account rate limiters. A single engine instance
//! owns the archive for the duration of its operation; no cross-process
//! concurrent access is supported.

mod schema;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension as _};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::ratelimit::{RateLimit, RateLimiter};
use crate::source;

/// An opened archive repository.
///
/// Obtain with [`Archive::open`]; call [`Archive::close`] (or drop) for a
/// clean shutdown.
pub struct Archive {
    repo_root: PathBuf,
    conn: Mutex<Connection>,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl Archive {
    /// Open (or create) an archive at the given repository directory,
    /// provision the schema, and record all registered data sources.
    pub fn open<P: AsRef<Path>>(repo: P) -> Result<Arc<Self>> {
        let repo_root = repo.as_ref().to_path_buf();
        std::fs::create_dir_all(&repo_root)?;

        let db_path = repo_root.join("index.db");
        info!("Opening archive index at {}", db_path.display());

        let conn = Connection::open(&db_path)?;
        conn.execute_batch(schema::SCHEMA)?;

        let archive = Archive {
            repo_root,
            conn: Mutex::new(conn),
            limiters: Mutex::new(HashMap::new()),
        };
        archive.save_registered_sources()?;

        Ok(Arc::new(archive))
    }

    /// Stop background rate-limiter refill tasks. The database handle
    /// is released when the archive drops. Safe to call more than once.
    pub fn close(&self) {
        let mut limiters = self.limiters.lock();
        for (key, limiter) in limiters.drain() {
            debug!("Stopping rate limiter for {}", key);
            limiter.stop();
        }
    }

    /// The repository root directory.
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Join a repo-relative slash path with the repository root.
    pub fn full_path(&self, relative: &str) -> PathBuf {
        let mut path = self.repo_root.clone();
        path.extend(relative.split('/'));
        path
    }

    /// Register a data source directly with this archive's index.
    /// Registering an id that is already present fails.
    pub fn register_data_source(&self, id: &str, name: &str) -> Result<()> {
        let conn = self.conn();
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM data_sources WHERE id = ?1 LIMIT 1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(Error::Config(format!(
                "data source already registered: {id}"
            )));
        }
        conn.execute(
            "INSERT INTO data_sources (id, name) VALUES (?1, ?2)",
            [id, name],
        )?;
        Ok(())
    }

    /// Upsert every globally-registered data source into the index.
    fn save_registered_sources(&self) -> Result<()> {
        let sources = source::registered();
        if sources.is_empty() {
            return Ok(());
        }
        let conn = self.conn();
        let mut stmt = conn
            .prepare("INSERT INTO data_sources (id, name) VALUES (?1, ?2) ON CONFLICT DO NOTHING")?;
        for (id, name) in &sources {
            stmt.execute([id.as_str(), name.as_str()])?;
        }
        debug!("Recorded {} registered data sources", sources.len());
        Ok(())
    }

    /// Borrow the index connection. SQLite serializes writers anyway, so
    /// a single guarded handle is all the concurrency the index needs.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// The shared rate limiter for an account key, created on first use
    /// from the source's descriptor.
    pub(crate) fn rate_limiter(&self, key: &str, limit: RateLimit) -> Arc<RateLimiter> {
        let mut limiters = self.limiters.lock();
        limiters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::start(limit)))
            .clone()
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_repo_and_index() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        let archive = Archive::open(&repo).unwrap();

        assert!(repo.join("index.db").exists());
        assert_eq!(archive.repo_root(), repo.as_path());
    }

    #[test]
    fn test_open_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        {
            let _archive = Archive::open(tmp.path()).unwrap();
        }
        // Second open re-applies the schema without error.
        let _archive = Archive::open(tmp.path()).unwrap();
    }

    #[test]
    fn test_full_path_joins_slash_components() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::open(tmp.path()).unwrap();

        let full = archive.full_path("data/2023/11/twitter/IMG.JPG");
        assert!(full.starts_with(tmp.path()));
        assert!(full.ends_with(
            Path::new("data").join("2023").join("11").join("twitter").join("IMG.JPG")
        ));
    }

    #[test]
    fn test_register_data_source_rejects_duplicate() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::open(tmp.path()).unwrap();

        archive.register_data_source("photos", "Photo Service").unwrap();
        let err = archive
            .register_data_source("photos", "Photo Service")
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_foreign_keys_enforced() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::open(tmp.path()).unwrap();

        // An account for a data source that does not exist must be rejected.
        let result = archive.conn().execute(
            "INSERT INTO accounts (data_source_id, user_id) VALUES ('nope', 'user')",
            [],
        );
        assert!(result.is_err());
    }
}
