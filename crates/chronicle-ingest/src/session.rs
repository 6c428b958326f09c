//! The operation driver: one session per (data source, account).
//!
//! A [`Session`] wires the adapter client, the processing workers, the
//! checkpoint recorder, and the post-run prune for the three public
//! operations: get-latest, get-all, and import. Sessions for different
//! accounts can run concurrently; a session runs one operation at a
//! time.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension as _};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::account::Account;
use crate::checkpoint::{self, CheckpointWrapper};
use crate::error::{Error, Result};
use crate::filter::PresenceFilter;
use crate::options::{ProcessingOptions, Timeframe};
use crate::source::{self, CheckpointRecorder, Client, DataSource, ListOptions};
use crate::store::Archive;

/// A client bound to an account and an open archive, ready to run
/// operations. Obtain with [`Archive::new_session`].
pub struct Session {
    pub(crate) archive: Arc<Archive>,
    pub(crate) ds: DataSource,
    pub(crate) account: Account,
    client: tokio::sync::Mutex<Box<dyn Client>>,
    pub(crate) last_item: parking_lot::Mutex<LastItem>,
}

/// The highest-timestamped item stored during the current run, used to
/// advance the account's get-latest window on clean success.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct LastItem {
    pub row_id: Option<i64>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Archive {
    /// Build a session for the account identified by (data source,
    /// user), using the source's registered client factory.
    pub fn new_session(self: &Arc<Self>, data_source_id: &str, user_id: &str) -> Result<Arc<Session>> {
        let ds = source::lookup(data_source_id).ok_or_else(|| {
            Error::Config(format!("data source not registered: {data_source_id}"))
        })?;
        let account = self.get_account(data_source_id, user_id)?;
        let client = (ds.new_client)(&account).map_err(Error::Source)?;
        Ok(Session::new(Arc::clone(self), ds, account, client))
    }
}

impl Session {
    pub(crate) fn new(
        archive: Arc<Archive>,
        ds: DataSource,
        account: Account,
        client: Box<dyn Client>,
    ) -> Arc<Self> {
        Arc::new(Session {
            archive,
            ds,
            account,
            client: tokio::sync::Mutex::new(client),
            last_item: parking_lot::Mutex::new(LastItem::default()),
        })
    }

    pub fn data_source_id(&self) -> &str {
        &self.ds.id
    }

    pub fn user_id(&self) -> &str {
        &self.account.user_id
    }

    /// Pull the most recent items only: the window opens at the account's
    /// last stored item and closes at the caller's upper bound, if any.
    /// Incompatible with reprocess, prune, integrity, and explicit start
    /// bounds. If the upper bound is not after the last stored item,
    /// nothing is listed at all.
    pub async fn get_latest(
        self: &Arc<Self>,
        cancel: CancellationToken,
        options: ProcessingOptions,
    ) -> Result<()> {
        // Cancelled on every return path, including the early ones.
        let _cancel_guard = cancel.clone().drop_guard();

        if options.reprocess
            || options.prune
            || options.integrity
            || options.timeframe.since.is_some()
            || options.timeframe.since_item_id.is_some()
        {
            return Err(Error::Config(
                "get-latest does not support reprocess, prune, integrity, or an explicit start"
                    .to_string(),
            ));
        }

        let mut timeframe = Timeframe {
            until: options.timeframe.until,
            until_item_id: options.timeframe.until_item_id.clone(),
            ..Default::default()
        };

        // The inclusive lower bound is the last item of the previous
        // clean run.
        if let Some(last_row_id) = self.account.last_item_id {
            let last: Option<(Option<i64>, String)> = self
                .archive
                .conn()
                .query_row(
                    "SELECT timestamp, original_id FROM items WHERE id = ?1 LIMIT 1",
                    params![last_row_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((last_ts, last_original_id)) = last {
                if let Some(ts) = last_ts.and_then(|t| DateTime::from_timestamp(t, 0)) {
                    if let Some(until) = timeframe.until {
                        if until <= ts {
                            debug!(
                                "[{}/{}] Most recent item is already at or past the requested end; nothing to do",
                                self.ds.id, self.account.user_id
                            );
                            return Ok(());
                        }
                    }
                    timeframe.since = Some(ts);
                }
                if !last_original_id.is_empty() {
                    timeframe.since_item_id = Some(last_original_id);
                }
            }
        }

        let options = ProcessingOptions {
            timeframe,
            ..options
        };
        self.run_listing(cancel, None, options).await
    }

    /// List and process everything the source offers, subject to the
    /// caller's timeframe; optionally reprocess, check integrity, and
    /// prune afterwards.
    pub async fn get_all(
        self: &Arc<Self>,
        cancel: CancellationToken,
        options: ProcessingOptions,
    ) -> Result<()> {
        self.run_listing(cancel, None, options).await
    }

    /// Like get-all, but the adapter reads from a local archive or
    /// export file instead of the network.
    pub async fn import(
        self: &Arc<Self>,
        cancel: CancellationToken,
        filename: PathBuf,
        options: ProcessingOptions,
    ) -> Result<()> {
        self.run_listing(cancel, Some(filename), options).await
    }

    async fn run_listing(
        self: &Arc<Self>,
        cancel: CancellationToken,
        filename: Option<PathBuf>,
        options: ProcessingOptions,
    ) -> Result<()> {
        // However this operation ends, leave the token cancelled so
        // nothing the adapter spawned keeps running.
        let _cancel_guard = cancel.clone().drop_guard();

        let fingerprint = checkpoint::fingerprint(&options.timeframe, filename.as_deref());
        let stored_checkpoint = self.archive.load_checkpoint(self.account.id)?;
        let offered_checkpoint =
            checkpoint::restorable(stored_checkpoint.as_deref(), &fingerprint);
        let checkpoint_at_start = stored_checkpoint.is_some();
        if checkpoint_at_start && offered_checkpoint.is_none() {
            info!(
                "[{}/{}] Stored checkpoint was made with different parameters; starting fresh",
                self.ds.id, self.account.user_id
            );
        }

        let filter = options.prune.then(PresenceFilter::shared);

        let (graphs, workers) = self.begin_processing(cancel.clone(), filter.clone(), &options);
        let recorder = self.checkpoint_recorder(fingerprint);

        info!(
            "[{}/{}] Beginning listing{}",
            self.ds.id,
            self.account.user_id,
            if offered_checkpoint.is_some() { " (resuming from checkpoint)" } else { "" }
        );

        let list_result = {
            let mut client = self.client.lock().await;
            client
                .list_items(
                    cancel.clone(),
                    graphs,
                    ListOptions {
                        filename,
                        timeframe: options.timeframe.clone(),
                        checkpoint: offered_checkpoint,
                        recorder: Some(recorder),
                        verbose: options.verbose,
                    },
                )
                .await
        };

        // The sender is gone once the adapter returns; wait for the
        // workers to drain whatever made it into the channel.
        for worker in workers {
            let _ = worker.await;
        }

        // On failure or cancellation the checkpoint stays recorded and
        // the last-item pointer stays put, so the next run resumes.
        list_result.map_err(Error::Source)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.success_cleanup()?;

        if let Some(filter) = filter {
            if checkpoint_at_start {
                // This listing ran on top of an earlier, interrupted
                // one, so the filter cannot vouch for the full item set.
                warn!(
                    "[{}/{}] Refusing to prune: a checkpoint was recorded for this account",
                    self.ds.id, self.account.user_id
                );
                return Err(Error::CheckpointExists);
            }
            self.prune(&filter)?;
        }

        Ok(())
    }

    /// Clear the checkpoint and advance the last-item pointer. Only
    /// called after a clean, uncancelled run.
    fn success_cleanup(&self) -> Result<()> {
        self.archive.clear_checkpoint(self.account.id)?;
        let last = *self.last_item.lock();
        if let Some(row_id) = last.row_id {
            self.archive.advance_last_item(self.account.id, row_id)?;
        }
        Ok(())
    }

    /// The recorder handed to the adapter: wraps the blob with this
    /// operation's parameter fingerprint and writes it onto the account
    /// row. Purely a side effect; failures are logged.
    fn checkpoint_recorder(&self, fingerprint: String) -> CheckpointRecorder {
        let archive = Arc::clone(&self.archive);
        let account_id = self.account.id;
        let label = format!("{}/{}", self.ds.id, self.account.user_id);
        Arc::new(move |data: &[u8]| {
            let wrapper = CheckpointWrapper {
                params: fingerprint.clone(),
                data: data.to_vec(),
            };
            match wrapper.encode() {
                Ok(blob) => {
                    if let Err(err) = archive.save_checkpoint(account_id, &blob) {
                        error!("[{}] Recording checkpoint: {}", label, err);
                    }
                }
                Err(err) => error!("[{}] Encoding checkpoint: {}", label, err),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{count, harness, reopen_session, text_item, ts, StubClient};
    use chronicle_core::ItemGraph;

    fn until(t: i64) -> ProcessingOptions {
        ProcessingOptions {
            timeframe: Timeframe {
                until: Some(ts(t)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_latest_rejects_incompatible_options() {
        let h = harness("sess_latest_opts");
        let (client, _) = StubClient::new(vec![]);
        let session = reopen_session(&h, "sess_latest_opts", client);

        for bad in [
            ProcessingOptions {
                reprocess: true,
                ..Default::default()
            },
            ProcessingOptions {
                prune: true,
                ..Default::default()
            },
            ProcessingOptions {
                integrity: true,
                ..Default::default()
            },
            ProcessingOptions {
                timeframe: Timeframe {
                    since: Some(ts(1)),
                    ..Default::default()
                },
                ..Default::default()
            },
        ] {
            let err = session
                .get_latest(CancellationToken::new(), bad)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Config(_)));
        }
    }

    #[tokio::test]
    async fn test_get_latest_window() {
        let h = harness("sess_latest");

        // One archived item at timestamp 100, recorded as the account's
        // most recent.
        h.session
            .store_item(&text_item("A", 100, "first"), ts(1), &ProcessingOptions::default())
            .await
            .unwrap();
        let row_id = h.session.item_row_id("A").unwrap().unwrap();
        h.archive.advance_last_item(h.session.account.id, row_id).unwrap();

        // An upper bound at or before the last item: nothing to list.
        let (client, captured) = StubClient::new(vec![]);
        let session = reopen_session(&h, "sess_latest", client);
        session
            .get_latest(CancellationToken::new(), until(50))
            .await
            .unwrap();
        assert!(captured.lock().is_empty());
        assert_eq!(count(&h.archive, "items", ""), 1);

        // A later upper bound: the window opens at the last item.
        let (client, captured) = StubClient::new(vec![]);
        let session = reopen_session(&h, "sess_latest", client);
        session
            .get_latest(CancellationToken::new(), until(200))
            .await
            .unwrap();

        let listings = captured.lock();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].timeframe.since, Some(ts(100)));
        assert_eq!(listings[0].timeframe.since_item_id.as_deref(), Some("A"));
        assert_eq!(listings[0].timeframe.until, Some(ts(200)));
        assert!(listings[0].checkpoint.is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_offered_only_on_matching_params() {
        let h = harness("sess_ckpt");

        // A run with until=T records a checkpoint, then dies.
        let (mut client, _) = StubClient::new(vec![]);
        client.record_checkpoint = Some(b"page-cursor".to_vec());
        client.fail_after_listing = true;
        let session = reopen_session(&h, "sess_ckpt", client);
        let err = session
            .get_all(CancellationToken::new(), until(1000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Source(_)));

        // Same parameters: the blob is offered back.
        let (client, captured) = StubClient::new(vec![]);
        let session = reopen_session(&h, "sess_ckpt", client);
        session
            .get_all(CancellationToken::new(), until(1000))
            .await
            .unwrap();
        assert_eq!(
            captured.lock()[0].checkpoint.as_deref(),
            Some(&b"page-cursor"[..])
        );

        // Record again, then run with different parameters: started fresh.
        let (mut client, _) = StubClient::new(vec![]);
        client.record_checkpoint = Some(b"page-cursor".to_vec());
        client.fail_after_listing = true;
        let session = reopen_session(&h, "sess_ckpt", client);
        let _ = session.get_all(CancellationToken::new(), until(1000)).await;

        let (client, captured) = StubClient::new(vec![]);
        let session = reopen_session(&h, "sess_ckpt", client);
        session
            .get_all(CancellationToken::new(), until(2000))
            .await
            .unwrap();
        assert!(captured.lock()[0].checkpoint.is_none());
    }

    #[tokio::test]
    async fn test_success_clears_checkpoint_and_advances_last_item() {
        let h = harness("sess_success");

        let graph = ItemGraph::new(text_item("fresh", 500, "new content"));
        let (client, _) = StubClient::new(vec![graph]);
        let session = reopen_session(&h, "sess_success", client);
        session
            .get_all(CancellationToken::new(), ProcessingOptions::default())
            .await
            .unwrap();

        let account = h.archive.get_account("sess_success", "tester").unwrap();
        let row_id = session.item_row_id("fresh").unwrap().unwrap();
        assert_eq!(account.last_item_id, Some(row_id));
        assert!(account.checkpoint.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_operation_preserves_state() {
        let h = harness("sess_cancel");

        let graph = ItemGraph::new(text_item("never-lands", 500, "body"));
        let (client, _) = StubClient::new(vec![graph]);
        let session = reopen_session(&h, "sess_cancel", client);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = session
            .get_all(cancel, ProcessingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        // Nothing was stored and the last-item pointer did not move.
        assert_eq!(count(&h.archive, "items", ""), 0);
        let account = h.archive.get_account("sess_cancel", "tester").unwrap();
        assert!(account.last_item_id.is_none());
    }

    #[tokio::test]
    async fn test_prune_refused_when_checkpoint_preexists() {
        let h = harness("sess_prune_refuse");

        h.session
            .store_item(&text_item("keep-me", 10, "body"), ts(1), &ProcessingOptions::default())
            .await
            .unwrap();
        h.archive
            .save_checkpoint(h.session.account.id, b"stale progress")
            .unwrap();

        // The listing is empty, so a prune would delete everything; the
        // pre-existing checkpoint must stop it.
        let (client, _) = StubClient::new(vec![]);
        let session = reopen_session(&h, "sess_prune_refuse", client);
        let err = session
            .get_all(
                CancellationToken::new(),
                ProcessingOptions {
                    prune: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CheckpointExists));
        assert_eq!(count(&h.archive, "items", "original_id = 'keep-me'"), 1);
    }

    #[tokio::test]
    async fn test_prune_deletes_items_absent_from_listing() {
        let h = harness("sess_prune");
        let opts = ProcessingOptions::default();

        h.session
            .store_item(&text_item("stale", 10, "gone from source"), ts(1), &opts)
            .await
            .unwrap();
        h.session
            .store_item(&text_item("fresh", 20, "still listed"), ts(1), &opts)
            .await
            .unwrap();

        let graph = ItemGraph::new(text_item("fresh", 20, "still listed"));
        let (client, _) = StubClient::new(vec![graph]);
        let session = reopen_session(&h, "sess_prune", client);
        session
            .get_all(
                CancellationToken::new(),
                ProcessingOptions {
                    prune: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(count(&h.archive, "items", "original_id = 'stale'"), 0);
        assert_eq!(count(&h.archive, "items", "original_id = 'fresh'"), 1);
    }

    #[tokio::test]
    async fn test_import_binds_filename_and_fingerprint() {
        let h = harness("sess_import");

        let (client, captured) = StubClient::new(vec![]);
        let session = reopen_session(&h, "sess_import", client);
        session
            .import(
                CancellationToken::new(),
                PathBuf::from("takeout.tgz"),
                ProcessingOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(
            captured.lock()[0].filename.as_deref(),
            Some(std::path::Path::new("takeout.tgz"))
        );
    }

    #[tokio::test]
    async fn test_listing_failure_keeps_data_and_reports() {
        let h = harness("sess_fail");

        let graph = ItemGraph::new(text_item("made-it", 30, "arrived before the error"));
        let (mut client, _) = StubClient::new(vec![graph]);
        client.fail_after_listing = true;
        let session = reopen_session(&h, "sess_fail", client);

        let err = session
            .get_all(CancellationToken::new(), ProcessingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Source(_)));

        // Items that arrived before the failure are kept; the last-item
        // pointer is not advanced.
        assert_eq!(count(&h.archive, "items", "original_id = 'made-it'"), 1);
        let account = h.archive.get_account("sess_fail", "tester").unwrap();
        assert!(account.last_item_id.is_none());
    }
}
