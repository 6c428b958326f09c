//! Item processing: worker pool, graph traversal, and the
//! merge/reprocess storage policy.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use metrics::counter;
use rusqlite::{params, OptionalExtension as _};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chronicle_core::{DataReader, Item, ItemGraph, Metadata, RawRelation, Relation};

use crate::error::{Error, Result};
use crate::files;
use crate::filter::PresenceFilter;
use crate::lock;
use crate::options::ProcessingOptions;
use crate::session::Session;

/// Size of the worker pool consuming item graphs.
const WORKERS: usize = 2;

/// Capacity of the graph channel; backpressure throttles the adapter.
const CHANNEL_CAPACITY: usize = 8;

/// State carried through one graph's traversal.
pub(crate) struct RecursiveState {
    /// Written as `stored` on every row this graph touches.
    pub(crate) stored: DateTime<Utc>,

    pub(crate) options: ProcessingOptions,

    /// Visited graphs by pointer identity → their row id (None for
    /// nodeless graphs). Re-entering a cycle returns the cached id.
    seen: HashMap<usize, Option<i64>>,

    /// Service item ID → row id, to bind collection members without
    /// another query.
    pub(crate) id_map: HashMap<String, i64>,

    /// Present only during prune-enabled runs; every listed item's
    /// service ID is inserted.
    pub(crate) filter: Option<Arc<PresenceFilter>>,
}

/// An item row as loaded from the index.
#[derive(Debug, Clone)]
pub(crate) struct ItemRow {
    pub id: i64,
    pub data_file: Option<String>,
    pub data_hash: Option<String>,
    pub modified: Option<i64>,
    pub metadata: Option<Metadata>,
}

impl Session {
    /// Start the worker pool for one operation. Returns the channel the
    /// adapter feeds and the worker handles to join after the listing
    /// returns.
    pub(crate) fn begin_processing(
        self: &Arc<Self>,
        cancel: CancellationToken,
        filter: Option<Arc<PresenceFilter>>,
        options: &ProcessingOptions,
    ) -> (mpsc::Sender<Arc<ItemGraph>>, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel::<Arc<ItemGraph>>(CHANNEL_CAPACITY);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = Vec::with_capacity(WORKERS);
        for _ in 0..WORKERS {
            let session = Arc::clone(self);
            let rx = Arc::clone(&rx);
            let cancel = cancel.clone();
            let filter = filter.clone();
            let options = options.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    // Hold the receiver lock only for the receive itself.
                    let graph = { rx.lock().await.recv().await };
                    let Some(graph) = graph else { break };

                    // Cancellation is checked at graph boundaries only;
                    // keep draining so the producer can unblock and exit.
                    if cancel.is_cancelled() {
                        continue;
                    }

                    let mut state = RecursiveState {
                        stored: Utc::now(),
                        options: options.clone(),
                        seen: HashMap::new(),
                        id_map: HashMap::new(),
                        filter: filter.clone(),
                    };

                    // A bad item skips its graph, never the operation.
                    if let Err(err) = session.process_graph(&graph, &mut state).await {
                        error!(
                            "[{}/{}] Processing item graph: {}",
                            session.ds.id, session.account.user_id, err
                        );
                        counter!("chronicle_graphs_failed_total").increment(1);
                    }
                }
            }));
        }

        (tx, workers)
    }

    /// Walk one graph: store its node, recurse into its edges, then
    /// handle attached collections and deferred relations. Returns the
    /// node's row id (None for a nodeless graph).
    pub(crate) fn process_graph<'a>(
        self: &'a Arc<Self>,
        graph: &'a Arc<ItemGraph>,
        state: &'a mut RecursiveState,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>>> + Send + 'a>> {
        Box::pin(async move {
            // Never visit a node twice; this is what makes cycles land.
            let graph_key = Arc::as_ptr(graph) as usize;
            if let Some(&row_id) = state.seen.get(&graph_key) {
                return Ok(row_id);
            }

            let mut graph_row: Option<i64> = None;

            if let Some(item) = &graph.node {
                let row_id = self.process_node(item, state).await?;
                graph_row = Some(row_id);
                state.seen.insert(graph_key, graph_row);
                state.id_map.insert(item.original_id.clone(), row_id);

                for edge in graph.edges() {
                    let target_key = Arc::as_ptr(&edge.target) as usize;
                    let target_row = match state.seen.get(&target_key) {
                        Some(&row) => row,
                        None => self.process_graph(&edge.target, state).await?,
                    };

                    if let Some(target_row) = target_row {
                        if let Some(target_item) = &edge.target.node {
                            state
                                .id_map
                                .insert(target_item.original_id.clone(), target_row);
                        }
                        for relation in &edge.relations {
                            self.insert_item_relationship(row_id, target_row, relation)?;
                        }
                    }
                }
            } else {
                state.seen.insert(graph_key, None);
            }

            // Collections and raw relations are processed regardless of
            // whether the graph has a node.
            for collection in graph.take_collections() {
                self.process_collection(collection, state).await?;
            }
            for relation in graph.take_relations() {
                self.process_raw_relation(&relation)?;
            }

            Ok(graph_row)
        })
    }

    async fn process_node(&self, item: &Item, state: &mut RecursiveState) -> Result<i64> {
        // Record presence before storing: prune must never delete an
        // item the source listed, even if storing it fails this run.
        if let Some(filter) = &state.filter {
            if !item.original_id.is_empty() {
                filter.insert(&item.original_id);
            }
        }

        let row_id = self.store_item(item, state.stored, &state.options).await?;

        self.track_latest(row_id, item.timestamp);
        counter!("chronicle_items_processed_total").increment(1);
        Ok(row_id)
    }

    /// Store one item, one writer at a time per
    /// (source, account, original id).
    pub(crate) async fn store_item(
        &self,
        item: &Item,
        stored: DateTime<Utc>,
        options: &ProcessingOptions,
    ) -> Result<i64> {
        let mut original_id = item.original_id.clone();
        let mut soft_merging = false;
        if options.merge.soft {
            (original_id, soft_merging) = self.soft_merge(item, options)?;
        }

        let lock_key = format!("{}_{}_{}", self.ds.id, self.account.id, original_id);
        let _guard = lock::item_locks().lock(lock_key).await;

        // Take the content stream now, but do not start downloading
        // until the row exists: if a later encounter finds the filename
        // recorded without a hash, it knows the download was
        // interrupted and retries it.
        let reader = item.take_reader();
        let mut process_data_file = reader.is_some();

        let existing = if original_id.is_empty() {
            None
        } else {
            self.load_item_row(&original_id)?
        };

        let mut backup = None;
        if let Some(row) = &existing {
            if !self
                .should_process_existing(item, row, soft_merging, options)
                .await
            {
                return Ok(row.id);
            }

            // Keep the new data file only if the old row has none, we
            // are replacing rather than merging, or the merge prefers
            // new data files.
            process_data_file = process_data_file
                && (row.data_file.is_none() || !soft_merging || options.merge.prefer_new_data_file);

            // Move the old file out of the way; restored if anything
            // below fails, deleted once the replacement sticks.
            if process_data_file {
                if let Some(rel) = &row.data_file {
                    backup = files::stage_backup(&self.archive, rel).await?;
                }
            }
        }

        let result = self
            .store_item_locked(
                item,
                &original_id,
                stored,
                options,
                soft_merging,
                process_data_file,
                reader,
                existing.as_ref(),
            )
            .await;

        if let Some(backup) = backup {
            backup.finish(result.is_ok()).await;
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn store_item_locked(
        &self,
        item: &Item,
        original_id: &str,
        stored: DateTime<Utc>,
        options: &ProcessingOptions,
        soft_merging: bool,
        process_data_file: bool,
        reader: Option<DataReader>,
        existing: Option<&ItemRow>,
    ) -> Result<i64> {
        // Reserve the data file's unique name before the row is written.
        let mut new_data_file: Option<String> = None;
        let mut new_file = None;
        if process_data_file {
            let (file, rel) = files::open_unique_data_file(&self.archive, item, &self.ds.id).await?;
            new_file = Some(file);
            new_data_file = Some(rel);
        }

        // Resolve the owner to a person; absent owners mean the account
        // holder themselves.
        let owner_id = item
            .owner_id
            .clone()
            .unwrap_or_else(|| self.account.user_id.clone());
        let owner_name = item.owner_name.clone().unwrap_or_default();
        let person = self
            .archive
            .get_person(&self.ds.id, &owner_id, &owner_name)?;

        // Fold the service-reported hash into the metadata blob so later
        // listings can detect remote changes.
        let mut metadata = item.metadata.clone().unwrap_or_default();
        if let Some(service_hash) = &item.service_hash {
            metadata.service_hash = Some(service_hash.clone());
        }
        let metadata_blob = metadata.encode()?;

        // A fresh download invalidates any recorded hash until it
        // completes; otherwise carry the existing file reference along.
        let (data_file, data_hash) = if process_data_file {
            (new_data_file.clone(), None)
        } else {
            (
                existing.and_then(|row| row.data_file.clone()),
                existing.and_then(|row| row.data_hash.clone()),
            )
        };

        self.insert_or_update_item(
            &ItemValues {
                account_id: self.account.id,
                original_id,
                person_id: person.id,
                timestamp: item.timestamp.map(|t| t.timestamp()),
                stored: stored.timestamp(),
                class: item.class.code(),
                mime_type: item.mime_type.as_deref(),
                data_text: item.data_text.as_deref(),
                data_file: data_file.as_deref(),
                data_hash: data_hash.as_deref(),
                metadata: metadata_blob.as_deref(),
                latitude: item.coordinates.map(|c| c.latitude),
                longitude: item.coordinates.map(|c| c.longitude),
            },
            soft_merging,
            options,
        )?;

        // Works whether the statement above inserted or updated.
        let row_id = self.item_row_id(original_id)?.ok_or_else(|| {
            Error::Database(rusqlite::Error::QueryReturnedNoRows)
        })?;

        // Download, hash, dedup, and only then record the hash.
        if let (Some(file), Some(rel), Some(reader)) =
            (new_file, new_data_file.as_deref(), reader)
        {
            let hash = files::download(&self.archive, rel, file, reader).await?;

            let final_rel = match files::replace_with_existing(&self.archive, rel, &hash, row_id)
                .await?
            {
                Some(shared) => shared,
                None => rel.to_string(),
            };

            if let Err(err) = self.record_download(row_id, &final_rel, &hash) {
                error!(
                    "[{}/{}] Recording data file hash: {}; removing data file {} (item_id={})",
                    self.ds.id, self.account.user_id, err, final_rel, row_id
                );
                let _ = std::fs::remove_file(self.archive.full_path(&final_rel));
            }
        }

        Ok(row_id)
    }

    /// Decide whether an already-archived item gets processed again.
    async fn should_process_existing(
        &self,
        item: &Item,
        row: &ItemRow,
        soft_merging: bool,
        options: &ProcessingOptions,
    ) -> bool {
        // Integrity check: a data file whose bytes no longer match the
        // recorded hash is always reprocessed.
        if options.integrity {
            if let (Some(rel), Some(recorded)) = (&row.data_file, &row.data_hash) {
                match files::hash_file(&self.archive.full_path(rel)).await {
                    Ok(hash) if &hash == recorded => {}
                    Ok(hash) => {
                        warn!(
                            "[{}/{}] Integrity check: checksum mismatch: expected {}, got {}; reprocessing (item_id={})",
                            self.ds.id, self.account.user_id, recorded, hash, row.id
                        );
                        return true;
                    }
                    Err(err) => {
                        warn!(
                            "[{}/{}] Integrity check: reading existing data file: {}; reprocessing (item_id={})",
                            self.ds.id, self.account.user_id, err, row.id
                        );
                        return true;
                    }
                }
            }
        }

        // Locally-modified rows are never overwritten.
        if row.modified.is_some() {
            return false;
        }

        // A recorded filename without a hash means a download never
        // finished; reprocess so it can complete this time.
        if row.data_file.is_some() && row.data_hash.is_none() {
            return true;
        }

        // The service reports a hash/etag differing from the stored one.
        if let (Some(service_hash), Some(stored_meta)) = (&item.service_hash, &row.metadata) {
            if let Some(stored_hash) = &stored_meta.service_hash {
                if stored_hash != service_hash {
                    return true;
                }
            }
        }

        // Finally, reprocess on request; a soft merge always proceeds so
        // the merge actually happens.
        options.reprocess || soft_merging
    }

    /// Find an existing row that is likely the same item under a
    /// different service ID: same account, equal timestamp, and matching
    /// text, filename, or service-reported hash. Exactly one candidate
    /// is merged; more than one is too risky and skips the item.
    ///
    /// Returns the ID to process the item under and whether a soft merge
    /// is in progress.
    fn soft_merge(&self, item: &Item, options: &ProcessingOptions) -> Result<(String, bool)> {
        let incoming_id = item.original_id.clone();

        // Soft merging keys on equal timestamps; an undated item has
        // nothing safe to match on.
        let Some(ts) = item.timestamp else {
            return Ok((incoming_id, false));
        };

        let filename_pattern = item.data_file_name.as_ref().map(|f| format!("%/{f}"));
        let service_hash = item.service_hash.as_ref().map(|h| BASE64.encode(h));

        let found: Option<(i64, Option<i64>, Option<String>)> = self
            .archive
            .conn()
            .query_row(
                "SELECT COUNT(1), id, original_id FROM items
                 WHERE account_id = ?1 AND timestamp = ?2
                   AND (data_text = ?3 OR data_file LIKE ?4 OR data_hash = ?5)
                   AND original_id != ?6
                 LIMIT 1",
                params![
                    self.account.id,
                    ts.timestamp(),
                    item.data_text,
                    filename_pattern,
                    service_hash,
                    incoming_id
                ],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (matches, row_id, existing_id) = match found {
            None => return Ok((incoming_id, false)),
            Some(row) => row,
        };
        if matches == 0 {
            return Ok((incoming_id, false));
        }
        if matches > 1 {
            return Err(Error::AmbiguousMerge {
                matches,
                original_id: incoming_id,
            });
        }
        let (Some(row_id), Some(existing_id)) = (row_id, existing_id) else {
            return Ok((incoming_id, false));
        };

        if !options.merge.prefer_new_id {
            info!(
                "[{}/{}] Soft merging item {} into row {} under its existing ID {}",
                self.ds.id, self.account.user_id, incoming_id, row_id, existing_id
            );
            return Ok((existing_id, true));
        }

        // Rewrite the candidate row's ID to the incoming one, so the
        // upsert below finds a conflict and merges instead of inserting.
        self.archive.conn().execute(
            "UPDATE items SET original_id = ?1 WHERE id = ?2",
            params![incoming_id, row_id],
        )?;
        info!(
            "[{}/{}] Soft merging item {} into row {} (row adopts the incoming ID; was {})",
            self.ds.id, self.account.user_id, incoming_id, row_id, existing_id
        );
        Ok((incoming_id, true))
    }

    fn load_item_row(&self, original_id: &str) -> Result<Option<ItemRow>> {
        let loaded: Option<(i64, Option<String>, Option<String>, Option<i64>, Option<Vec<u8>>)> =
            self.archive
                .conn()
                .query_row(
                    "SELECT id, data_file, data_hash, modified, metadata
                     FROM items WHERE account_id = ?1 AND original_id = ?2 LIMIT 1",
                    params![self.account.id, original_id],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                        ))
                    },
                )
                .optional()?;

        let Some((id, data_file, data_hash, modified, metadata)) = loaded else {
            return Ok(None);
        };
        Ok(Some(ItemRow {
            id,
            data_file,
            data_hash,
            modified,
            metadata: Metadata::decode(metadata.as_deref())?,
        }))
    }

    /// Insert the row, or on (account, original id) conflict update the
    /// existing one. Replacing overwrites each field with the incoming
    /// value; merging keeps the existing value wherever the incoming one
    /// is null, flipped per field by the prefer-new options. `stored` is
    /// always this run's timestamp.
    fn insert_or_update_item(
        &self,
        values: &ItemValues<'_>,
        soft_merging: bool,
        options: &ProcessingOptions,
    ) -> Result<()> {
        let take_new = |field: &str| format!("excluded.{field}");
        let keep_existing = |field: &str| format!("COALESCE({field}, excluded.{field})");
        let prefer_new = |field: &str| format!("COALESCE(excluded.{field}, {field})");

        let field = |name: &str, prefer_new_flag: bool| -> String {
            if !soft_merging {
                take_new(name)
            } else if prefer_new_flag {
                prefer_new(name)
            } else {
                keep_existing(name)
            }
        };

        let sql = format!(
            "INSERT INTO items
                (account_id, original_id, person_id, timestamp, stored,
                 class, mime_type, data_text, data_file, data_hash, metadata,
                 latitude, longitude)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT (account_id, original_id) DO UPDATE SET
                person_id = {person_id},
                timestamp = {timestamp},
                stored = excluded.stored,
                class = {class},
                mime_type = {mime_type},
                data_text = {data_text},
                data_file = {data_file},
                data_hash = {data_hash},
                metadata = {metadata},
                latitude = {latitude},
                longitude = {longitude}",
            person_id = field("person_id", false),
            timestamp = field("timestamp", false),
            class = field("class", false),
            mime_type = field("mime_type", false),
            data_text = field("data_text", options.merge.prefer_new_data_text),
            data_file = field("data_file", options.merge.prefer_new_data_file),
            data_hash = field("data_hash", false),
            metadata = field("metadata", options.merge.prefer_new_metadata),
            latitude = field("latitude", false),
            longitude = field("longitude", false),
        );

        self.archive.conn().execute(
            &sql,
            params![
                values.account_id,
                values.original_id,
                values.person_id,
                values.timestamp,
                values.stored,
                values.class,
                values.mime_type,
                values.data_text,
                values.data_file,
                values.data_hash,
                values.metadata,
                values.latitude,
                values.longitude,
            ],
        )?;
        Ok(())
    }

    pub(crate) fn item_row_id(&self, original_id: &str) -> Result<Option<i64>> {
        let row_id = self
            .archive
            .conn()
            .query_row(
                "SELECT id FROM items WHERE account_id = ?1 AND original_id = ?2 LIMIT 1",
                params![self.account.id, original_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row_id)
    }

    fn record_download(&self, row_id: i64, data_file: &str, data_hash: &str) -> Result<()> {
        self.archive.conn().execute(
            "UPDATE items SET data_file = ?1, data_hash = ?2 WHERE id = ?3",
            params![data_file, data_hash, row_id],
        )?;
        Ok(())
    }

    fn insert_item_relationship(
        &self,
        from_item: i64,
        to_item: i64,
        relation: &Relation,
    ) -> Result<()> {
        self.archive.conn().execute(
            "INSERT OR IGNORE INTO relationships (from_item_id, to_item_id, directed, label)
             VALUES (?1, ?2, ?3, ?4)",
            params![from_item, to_item, !relation.bidirectional, relation.label],
        )?;
        Ok(())
    }

    /// Store a deferred relation, resolving each side's row through the
    /// IDs this data source assigned. Any side not yet in the archive
    /// silently drops the relation; it is re-established when both sides
    /// exist on a later run.
    fn process_raw_relation(&self, relation: &RawRelation) -> Result<()> {
        let mut from_item: Option<i64> = None;
        let mut to_item: Option<i64> = None;
        let mut from_person: Option<i64> = None;
        let mut to_person: Option<i64> = None;

        if let Some(id) = &relation.from_item_id {
            match self.item_row_id_from_original(id)? {
                Some(row) => from_item = Some(row),
                None => return Ok(()),
            }
        }
        if let Some(id) = &relation.to_item_id {
            match self.item_row_id_from_original(id)? {
                Some(row) => to_item = Some(row),
                None => return Ok(()),
            }
        }
        if let Some(user_id) = &relation.from_person_user_id {
            match self.person_row_id_from_user_id(user_id)? {
                Some(row) => from_person = Some(row),
                None => return Ok(()),
            }
        }
        if let Some(user_id) = &relation.to_person_user_id {
            match self.person_row_id_from_user_id(user_id)? {
                Some(row) => to_person = Some(row),
                None => return Ok(()),
            }
        }

        if (from_item.is_none() && from_person.is_none())
            || (to_item.is_none() && to_person.is_none())
        {
            debug!(
                "[{}/{}] Raw relation has an empty side; skipping (label={})",
                self.ds.id, self.account.user_id, relation.relation.label
            );
            return Ok(());
        }

        self.archive.conn().execute(
            "INSERT OR IGNORE INTO relationships
                (from_person_id, from_item_id, to_person_id, to_item_id, directed, label)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                from_person,
                from_item,
                to_person,
                to_item,
                !relation.relation.bidirectional,
                relation.relation.label
            ],
        )?;
        Ok(())
    }

    /// An item's row ID from the ID its data source assigned, scoped to
    /// this session's source across its accounts.
    fn item_row_id_from_original(&self, original_id: &str) -> Result<Option<i64>> {
        let row_id = self
            .archive
            .conn()
            .query_row(
                "SELECT items.id FROM items, accounts
                 WHERE items.original_id = ?1
                   AND accounts.data_source_id = ?2
                   AND items.account_id = accounts.id
                 LIMIT 1",
                params![original_id, self.ds.id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row_id)
    }

    /// A person's row ID from the user ID they hold on this session's
    /// data source.
    fn person_row_id_from_user_id(&self, user_id: &str) -> Result<Option<i64>> {
        let row_id = self
            .archive
            .conn()
            .query_row(
                "SELECT person_id FROM person_identities
                 WHERE data_source_id = ?1 AND user_id = ?2 LIMIT 1",
                params![self.ds.id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row_id)
    }

    /// Keep the row id with the greatest timestamp seen this run, so a
    /// clean finish can advance the account's get-latest window.
    fn track_latest(&self, row_id: i64, timestamp: Option<DateTime<Utc>>) {
        let Some(ts) = timestamp else { return };
        let mut last = self.last_item.lock();
        if last.timestamp.map_or(true, |prev| prev < ts) {
            last.row_id = Some(row_id);
            last.timestamp = Some(ts);
        }
    }
}

/// The column values for one item upsert.
struct ItemValues<'a> {
    account_id: i64,
    original_id: &'a str,
    person_id: i64,
    timestamp: Option<i64>,
    stored: i64,
    class: i64,
    mime_type: Option<&'a str>,
    data_text: Option<&'a str>,
    data_file: Option<&'a str>,
    data_hash: Option<&'a str>,
    metadata: Option<&'a [u8]>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}
