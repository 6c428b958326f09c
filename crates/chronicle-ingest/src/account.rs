//! Accounts: one user of one data source, with stored credentials and
//! operation progress.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension as _};
use tracing::info;

use crate::auth;
use crate::error::{Error, Result};
use crate::ratelimit::RateLimiter;
use crate::source;
use crate::store::Archive;

/// An account row: the tuple (data source, external user id) under which
/// items are stored.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub data_source_id: String,
    pub user_id: String,
    pub(crate) authorization: Option<Vec<u8>>,
    pub(crate) checkpoint: Option<Vec<u8>>,
    pub(crate) last_item_id: Option<i64>,
}

impl Account {
    /// The stored opaque credential blob, if any.
    pub fn authorization(&self) -> Option<&[u8]> {
        self.authorization.as_deref()
    }

    /// The shared rate limiter for this account, if its data source
    /// declares a rate limit. Adapters should await `acquire` on it
    /// around each network request.
    pub fn rate_limiter(&self, archive: &Archive) -> Option<Arc<RateLimiter>> {
        let ds = source::lookup(&self.data_source_id)?;
        let limit = ds.rate_limit?;
        if limit.requests_per_hour == 0 {
            return None;
        }
        let key = format!("{}_{}", self.data_source_id, self.user_id);
        Some(archive.rate_limiter(&key, limit))
    }
}

impl Archive {
    /// Authenticate `user_id` with the registered data source and store
    /// the account in the index.
    pub fn add_account(&self, data_source_id: &str, user_id: &str) -> Result<()> {
        let ds = source::lookup(data_source_id).ok_or_else(|| {
            Error::Config(format!("data source not registered: {data_source_id}"))
        })?;

        let existing: Option<i64> = self
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM accounts WHERE data_source_id = ?1 AND user_id = ?2",
                params![data_source_id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.unwrap_or(0) > 0 {
            return Err(Error::Config(format!(
                "account already stored: {data_source_id}/{user_id}"
            )));
        }

        // Authenticate with the service, if the source needs it.
        let credentials: Option<Vec<u8>> = if let Some(authenticate) = &ds.authenticate {
            Some(authenticate(user_id).map_err(|e| Error::Authorization(e.to_string()))?)
        } else if let Some(oauth2) = &ds.oauth2 {
            Some(auth::authorize(oauth2)?)
        } else {
            None
        };

        let conn = self.conn();
        conn.execute(
            "INSERT INTO data_sources (id, name) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            params![ds.id, ds.name],
        )?;
        conn.execute(
            "INSERT INTO accounts (data_source_id, user_id, authorization) VALUES (?1, ?2, ?3)",
            params![data_source_id, user_id, credentials],
        )?;

        info!("Added account {}/{}", data_source_id, user_id);
        Ok(())
    }

    /// Load the account for (data source, user).
    pub fn get_account(&self, data_source_id: &str, user_id: &str) -> Result<Account> {
        self.conn()
            .query_row(
                "SELECT id, data_source_id, user_id, authorization, checkpoint, last_item_id
                 FROM accounts WHERE data_source_id = ?1 AND user_id = ?2 LIMIT 1",
                params![data_source_id, user_id],
                |row| {
                    Ok(Account {
                        id: row.get(0)?,
                        data_source_id: row.get(1)?,
                        user_id: row.get(2)?,
                        authorization: row.get(3)?,
                        checkpoint: row.get(4)?,
                        last_item_id: row.get(5)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| {
                Error::Config(format!("account not found: {data_source_id}/{user_id}"))
            })
    }

    /// Persist a refreshed credential blob; adapters call this when a
    /// token source renews.
    pub fn update_authorization(&self, account_id: i64, authorization: &[u8]) -> Result<()> {
        self.conn().execute(
            "UPDATE accounts SET authorization = ?1 WHERE id = ?2",
            params![authorization, account_id],
        )?;
        Ok(())
    }

    pub(crate) fn save_checkpoint(&self, account_id: i64, blob: &[u8]) -> Result<()> {
        self.conn().execute(
            "UPDATE accounts SET checkpoint = ?1 WHERE id = ?2",
            params![blob, account_id],
        )?;
        Ok(())
    }

    pub(crate) fn load_checkpoint(&self, account_id: i64) -> Result<Option<Vec<u8>>> {
        let blob: Option<Vec<u8>> = self
            .conn()
            .query_row(
                "SELECT checkpoint FROM accounts WHERE id = ?1 LIMIT 1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(blob)
    }

    pub(crate) fn clear_checkpoint(&self, account_id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE accounts SET checkpoint = NULL WHERE id = ?1",
            params![account_id],
        )?;
        Ok(())
    }

    /// Advance the account's last-item pointer, widening the window for
    /// future get-latest runs.
    pub(crate) fn advance_last_item(&self, account_id: i64, item_row_id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE accounts SET last_item_id = ?1 WHERE id = ?2",
            params![item_row_id, account_id],
        )?;
        Ok(())
    }
}
