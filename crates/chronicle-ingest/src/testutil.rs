//! Shared helpers for engine tests: temp archives, stub clients, and
//! item builders.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chronicle_core::{Class, DataReader, Item, ItemGraph};

use crate::options::Timeframe;
use crate::session::Session;
use crate::source::{self, Client, ListOptions};
use crate::store::Archive;

pub(crate) fn bytes_reader(bytes: &[u8]) -> DataReader {
    Box::new(std::io::Cursor::new(bytes.to_vec()))
}

pub(crate) fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// A post-class item with text content.
pub(crate) fn text_item(original_id: &str, timestamp: i64, text: &str) -> Item {
    Item::new(original_id, Class::Post)
        .with_timestamp(ts(timestamp))
        .with_text(text)
}

/// An image-class item carrying bytes to download.
pub(crate) fn file_item(original_id: &str, timestamp: i64, name: &str, bytes: &[u8]) -> Item {
    Item::new(original_id, Class::Image)
        .with_timestamp(ts(timestamp))
        .with_data_file(Some(name), bytes_reader(bytes), Some("application/octet-stream"))
}

/// A client that lists nothing; for tests that drive `store_item` and
/// `process_graph` directly.
pub(crate) struct NoopClient;

#[async_trait]
impl Client for NoopClient {
    async fn list_items(
        &mut self,
        _cancel: CancellationToken,
        _output: mpsc::Sender<Arc<ItemGraph>>,
        _options: ListOptions,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What a stub listing observed, for asserting on driver behavior.
#[derive(Debug, Clone)]
pub(crate) struct CapturedListing {
    pub filename: Option<PathBuf>,
    pub timeframe: Timeframe,
    pub checkpoint: Option<Vec<u8>>,
}

/// A scripted adapter: sends prepared graphs, optionally records a
/// checkpoint, optionally fails after sending.
pub(crate) struct StubClient {
    graphs: Mutex<Vec<Arc<ItemGraph>>>,
    pub captured: Arc<Mutex<Vec<CapturedListing>>>,
    pub record_checkpoint: Option<Vec<u8>>,
    pub fail_after_listing: bool,
}

impl StubClient {
    pub(crate) fn new(graphs: Vec<Arc<ItemGraph>>) -> (Box<Self>, Arc<Mutex<Vec<CapturedListing>>>) {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let client = Box::new(StubClient {
            graphs: Mutex::new(graphs),
            captured: Arc::clone(&captured),
            record_checkpoint: None,
            fail_after_listing: false,
        });
        (client, captured)
    }
}

#[async_trait]
impl Client for StubClient {
    async fn list_items(
        &mut self,
        _cancel: CancellationToken,
        output: mpsc::Sender<Arc<ItemGraph>>,
        options: ListOptions,
    ) -> anyhow::Result<()> {
        self.captured.lock().push(CapturedListing {
            filename: options.filename.clone(),
            timeframe: options.timeframe.clone(),
            checkpoint: options.checkpoint.clone(),
        });

        if let (Some(data), Some(recorder)) = (&self.record_checkpoint, &options.recorder) {
            recorder(data);
        }

        let graphs: Vec<_> = self.graphs.lock().drain(..).collect();
        for graph in graphs {
            if output.send(graph).await.is_err() {
                break;
            }
        }

        if self.fail_after_listing {
            anyhow::bail!("listing failed partway");
        }
        Ok(())
    }
}

/// A temp-dir archive with one account and a session over `client`.
pub(crate) struct Harness {
    pub archive: Arc<Archive>,
    pub session: Arc<Session>,
    _tmp: TempDir,
}

pub(crate) fn harness(source_id: &str) -> Harness {
    harness_with_client(source_id, Box::new(NoopClient))
}

pub(crate) fn harness_with_client(source_id: &str, client: Box<dyn Client>) -> Harness {
    let tmp = TempDir::new().unwrap();
    let ds = source::testutil::register_stub(source_id);
    let archive = Archive::open(tmp.path()).unwrap();
    archive.add_account(source_id, "tester").unwrap();
    let account = archive.get_account(source_id, "tester").unwrap();
    let session = Session::new(Arc::clone(&archive), ds, account, client);
    Harness {
        archive,
        session,
        _tmp: tmp,
    }
}

/// Re-create the session over the same archive, picking up account
/// changes (checkpoints, last-item pointer) and a fresh client.
pub(crate) fn reopen_session(harness: &Harness, source_id: &str, client: Box<dyn Client>) -> Arc<Session> {
    let ds = source::lookup(source_id).unwrap();
    let account = harness.archive.get_account(source_id, "tester").unwrap();
    Session::new(Arc::clone(&harness.archive), ds, account, client)
}

/// Count rows in a table, optionally filtered.
pub(crate) fn count(archive: &Archive, table: &str, where_clause: &str) -> i64 {
    let sql = if where_clause.is_empty() {
        format!("SELECT COUNT(*) FROM {table}")
    } else {
        format!("SELECT COUNT(*) FROM {table} WHERE {where_clause}")
    };
    archive.conn().query_row(&sql, [], |row| row.get(0)).unwrap()
}
