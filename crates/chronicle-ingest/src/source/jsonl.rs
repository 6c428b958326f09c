//! JSONL import adapter: a reference data source that lists items from
//! a local export file, one JSON record per line.
//!
//! This is the built-in way to bring generic exports into an archive
//! without a service-specific adapter, and it doubles as a working
//! example of the adapter contract: timeframe bounds, resumable
//! checkpoints, cancellation, and graph relations all flow through it.
//!
//! # Record format
//!
//! ```json
//! {"id":"post-1","timestamp":1700000000,"class":"post","text":"hello",
//!  "owner":{"id":"u1","name":"A. User"},
//!  "file":{"name":"IMG.JPG","data":"<base64 bytes>","mime_type":"image/jpeg"},
//!  "latitude":40.7,"longitude":-74.0,
//!  "relations":[{"from":"post-1","to":"post-0","label":"reply_to"}]}
//! ```
//!
//! Only `id` and `class` are required. Blank lines are skipped; a bad
//! line is logged and skipped rather than aborting the import.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chronicle_core::{Class, Item, ItemGraph, Metadata, RawRelation, Relation};

use crate::error::Result;
use crate::source::{self, Client, DataSource, ListOptions};

/// The registry id of the built-in JSONL source.
pub const SOURCE_ID: &str = "jsonl_export";

/// How many lines between checkpoint recordings.
const CHECKPOINT_INTERVAL: usize = 500;

/// Register the JSONL export data source. Call once at program start.
pub fn register() -> Result<()> {
    source::register(DataSource {
        id: SOURCE_ID.to_string(),
        name: "JSONL export".to_string(),
        oauth2: None,
        authenticate: None,
        rate_limit: None,
        new_client: Arc::new(|_account| Ok(Box::new(JsonlClient))),
    })
}

/// One line of a JSONL export.
#[derive(Debug, Deserialize)]
struct JsonlRecord {
    id: String,
    #[serde(default)]
    timestamp: Option<i64>,
    class: String,
    #[serde(default)]
    owner: Option<JsonlOwner>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    file: Option<JsonlFile>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    metadata: Option<Metadata>,
    #[serde(default)]
    relations: Vec<JsonlRelation>,
}

#[derive(Debug, Deserialize)]
struct JsonlOwner {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonlFile {
    #[serde(default)]
    name: Option<String>,
    /// Base64-encoded content bytes.
    data: String,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonlRelation {
    from: String,
    to: String,
    label: String,
    #[serde(default)]
    bidirectional: bool,
}

/// Import progress: the number of lines already handed to the pipeline.
#[derive(Debug, Default, Serialize, Deserialize)]
struct JsonlCheckpoint {
    line: usize,
}

/// Client for the JSONL export source.
pub struct JsonlClient;

impl JsonlClient {
    fn item_from_record(record: JsonlRecord) -> anyhow::Result<(Item, Vec<RawRelation>)> {
        let class = Class::from_str(&record.class)?;
        let mut item = Item::new(record.id, class);

        if let Some(secs) = record.timestamp {
            let ts = DateTime::from_timestamp(secs, 0)
                .ok_or_else(|| anyhow::anyhow!("timestamp out of range: {secs}"))?;
            item = item.with_timestamp(ts);
        }
        if let Some(owner) = record.owner {
            item = item.with_owner(owner.id, owner.name);
        }
        if let Some(text) = record.text {
            item = item.with_text(text);
        }
        if let Some(file) = record.file {
            let bytes = BASE64.decode(file.data.as_bytes())?;
            item = item.with_data_file(
                file.name,
                Box::new(std::io::Cursor::new(bytes)),
                file.mime_type,
            );
        }
        if let (Some(lat), Some(lon)) = (record.latitude, record.longitude) {
            item = item.with_coordinates(lat, lon);
        }
        if let Some(metadata) = record.metadata {
            item = item.with_metadata(metadata);
        }

        let relations = record
            .relations
            .into_iter()
            .map(|r| {
                RawRelation::between_items(r.from, r.to, Relation::new(r.label, r.bidirectional))
            })
            .collect();

        Ok((item, relations))
    }
}

#[async_trait]
impl Client for JsonlClient {
    async fn list_items(
        &mut self,
        cancel: CancellationToken,
        output: mpsc::Sender<Arc<ItemGraph>>,
        options: ListOptions,
    ) -> anyhow::Result<()> {
        let Some(filename) = &options.filename else {
            anyhow::bail!("the JSONL source only supports import from a file");
        };

        // Resume from the recorded line offset, if one was saved.
        let start_line = options
            .checkpoint
            .as_deref()
            .and_then(|blob| serde_json::from_slice::<JsonlCheckpoint>(blob).ok())
            .map(|cp| cp.line)
            .unwrap_or(0);
        if start_line > 0 {
            info!("Resuming JSONL import at line {}", start_line + 1);
        }

        let file = tokio::fs::File::open(filename).await?;
        let mut lines = BufReader::new(file).lines();

        let mut line_number = 0usize;
        let mut listed = 0usize;
        let mut skipped = 0usize;

        while let Some(line) = lines.next_line().await? {
            line_number += 1;
            if cancel.is_cancelled() {
                info!("JSONL import cancelled at line {}", line_number);
                return Ok(());
            }
            if line_number <= start_line || line.trim().is_empty() {
                continue;
            }

            let record: JsonlRecord = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(err) => {
                    warn!("Line {}: skipping bad record: {}", line_number, err);
                    skipped += 1;
                    continue;
                }
            };

            // Honor the timeframe: records outside the window are not
            // listed at all.
            if let Some(secs) = record.timestamp {
                let outside_since = options
                    .timeframe
                    .since
                    .is_some_and(|since| secs < since.timestamp());
                let outside_until = options
                    .timeframe
                    .until
                    .is_some_and(|until| secs > until.timestamp());
                if outside_since || outside_until {
                    continue;
                }
            }

            let (item, relations) = match Self::item_from_record(record) {
                Ok(converted) => converted,
                Err(err) => {
                    warn!("Line {}: skipping bad record: {}", line_number, err);
                    skipped += 1;
                    continue;
                }
            };

            let graph = ItemGraph::new(item);
            for relation in relations {
                graph.relate(relation);
            }

            if output.send(graph).await.is_err() {
                // The pipeline went away; nothing more to list.
                return Ok(());
            }
            listed += 1;

            if listed % CHECKPOINT_INTERVAL == 0 {
                if let Some(recorder) = &options.recorder {
                    let progress = JsonlCheckpoint { line: line_number };
                    recorder(&serde_json::to_vec(&progress)?);
                }
            }
        }

        if options.verbose {
            info!(
                "JSONL import finished: {} listed, {} skipped, {} lines",
                listed, skipped, line_number
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Timeframe;
    use crate::testutil::ts;

    fn collect_graphs(
        lines: &str,
        options_timeframe: Timeframe,
        checkpoint: Option<Vec<u8>>,
    ) -> Vec<Arc<ItemGraph>> {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("export.jsonl");
        std::fs::write(&path, lines).unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let (tx, mut rx) = mpsc::channel(64);
            let mut client = JsonlClient;
            client
                .list_items(
                    CancellationToken::new(),
                    tx,
                    ListOptions {
                        filename: Some(path),
                        timeframe: options_timeframe,
                        checkpoint,
                        recorder: None,
                        verbose: false,
                    },
                )
                .await
                .unwrap();

            let mut graphs = Vec::new();
            while let Some(graph) = rx.recv().await {
                graphs.push(graph);
            }
            graphs
        })
    }

    #[test]
    fn test_lists_records_as_graphs() {
        let graphs = collect_graphs(
            concat!(
                r#"{"id":"a","timestamp":100,"class":"post","text":"first"}"#,
                "\n",
                r#"{"id":"b","timestamp":200,"class":"image","file":{"name":"x.bin","data":"aGVsbG8="}}"#,
                "\n",
            ),
            Timeframe::default(),
            None,
        );

        assert_eq!(graphs.len(), 2);
        let first = graphs[0].node.as_ref().unwrap();
        assert_eq!(first.original_id, "a");
        assert_eq!(first.data_text.as_deref(), Some("first"));
        let second = graphs[1].node.as_ref().unwrap();
        assert_eq!(second.class, Class::Image);
        assert!(second.has_reader());
    }

    #[test]
    fn test_bad_lines_are_skipped() {
        let graphs = collect_graphs(
            concat!(
                "not json at all\n",
                r#"{"id":"ok","timestamp":1,"class":"post"}"#,
                "\n",
                r#"{"id":"bad-class","timestamp":2,"class":"tweetstorm"}"#,
                "\n",
            ),
            Timeframe::default(),
            None,
        );

        assert_eq!(graphs.len(), 1);
        assert_eq!(graphs[0].node.as_ref().unwrap().original_id, "ok");
    }

    #[test]
    fn test_timeframe_bounds_listing() {
        let lines = concat!(
            r#"{"id":"early","timestamp":50,"class":"post"}"#,
            "\n",
            r#"{"id":"inside","timestamp":150,"class":"post"}"#,
            "\n",
            r#"{"id":"late","timestamp":500,"class":"post"}"#,
            "\n",
        );
        let graphs = collect_graphs(
            lines,
            Timeframe {
                since: Some(ts(100)),
                until: Some(ts(200)),
                ..Default::default()
            },
            None,
        );

        assert_eq!(graphs.len(), 1);
        assert_eq!(graphs[0].node.as_ref().unwrap().original_id, "inside");
    }

    #[test]
    fn test_checkpoint_resumes_past_handled_lines() {
        let lines = concat!(
            r#"{"id":"one","timestamp":1,"class":"post"}"#,
            "\n",
            r#"{"id":"two","timestamp":2,"class":"post"}"#,
            "\n",
        );
        let checkpoint = serde_json::to_vec(&JsonlCheckpoint { line: 1 }).unwrap();
        let graphs = collect_graphs(lines, Timeframe::default(), Some(checkpoint));

        assert_eq!(graphs.len(), 1);
        assert_eq!(graphs[0].node.as_ref().unwrap().original_id, "two");
    }

    #[test]
    fn test_relations_attach_to_graph() {
        let lines = concat!(
            r#"{"id":"reply","timestamp":5,"class":"post","relations":[{"from":"reply","to":"root","label":"reply_to"}]}"#,
            "\n",
        );
        let graphs = collect_graphs(lines, Timeframe::default(), None);

        assert_eq!(graphs.len(), 1);
        let relations = graphs[0].take_relations();
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].to_item_id.as_deref(), Some("root"));
        assert_eq!(relations[0].relation.label, "reply_to");
    }

    #[test]
    fn test_requires_filename() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (tx, _rx) = mpsc::channel(1);
            let mut client = JsonlClient;
            let err = client
                .list_items(
                    CancellationToken::new(),
                    tx,
                    ListOptions {
                        filename: None,
                        timeframe: Timeframe::default(),
                        checkpoint: None,
                        recorder: None,
                        verbose: false,
                    },
                )
                .await
                .unwrap_err();
            assert!(err.to_string().contains("import"));
        });
    }
}
