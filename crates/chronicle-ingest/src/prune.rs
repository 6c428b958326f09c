//! The prune engine: after a complete listing, delete what the source
//! no longer lists.

use metrics::counter;
use rusqlite::{params, OptionalExtension as _};
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::filter::PresenceFilter;
use crate::session::Session;

impl Session {
    /// Delete every item of this account whose service ID is absent from
    /// the presence filter, removing each item's data file when no other
    /// row shares it.
    ///
    /// Refuses outright while a checkpoint is recorded on the account: a
    /// checkpoint means an incomplete listing, so the filter cannot be
    /// trusted and pruning on it would lose data.
    pub fn prune(&self, filter: &PresenceFilter) -> Result<()> {
        if self.archive.load_checkpoint(self.account.id)?.is_some() {
            return Err(Error::CheckpointExists);
        }

        // Deleting while iterating would contend on the table; collect
        // the doomed rows first.
        let doomed = self.items_to_delete(filter)?;
        if doomed.is_empty() {
            return Ok(());
        }
        info!(
            "[{}/{}] Pruning {} items absent from the listing",
            self.ds.id,
            self.account.user_id,
            doomed.len()
        );

        let mut deleted: u64 = 0;
        for row_id in doomed {
            match self.delete_item(row_id) {
                Ok(()) => deleted += 1,
                Err(err) => error!(
                    "[{}/{}] Deleting item: {} (item_id={})",
                    self.ds.id, self.account.user_id, err, row_id
                ),
            }
        }
        counter!("chronicle_items_pruned_total").increment(deleted);
        Ok(())
    }

    fn items_to_delete(&self, filter: &PresenceFilter) -> Result<Vec<i64>> {
        let conn = self.archive.conn();
        let mut stmt = conn.prepare("SELECT id, original_id FROM items WHERE account_id = ?1")?;
        let rows = stmt.query_map(params![self.account.id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut doomed = Vec::new();
        for row in rows {
            let (row_id, original_id) = row?;
            if original_id.is_empty() {
                continue;
            }
            if !filter.contains(&original_id) {
                doomed.push(row_id);
            }
        }
        Ok(doomed)
    }

    fn delete_item(&self, row_id: i64) -> Result<()> {
        // Before dropping the row, learn whether it is the only one
        // referencing its data file; shared files stay on disk.
        let conn = self.archive.conn();
        let file_refs: Option<(i64, Option<String>)> = conn
            .query_row(
                "SELECT COUNT(*), data_file FROM items
                 WHERE data_file = (SELECT data_file FROM items
                                    WHERE id = ?1 AND data_file IS NOT NULL
                                      AND data_file != '' LIMIT 1)",
                params![row_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        conn.execute("DELETE FROM items WHERE id = ?1", params![row_id])?;
        drop(conn);

        if let Some((1, Some(data_file))) = file_refs {
            match std::fs::remove_file(self.archive.full_path(&data_file)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }
}
