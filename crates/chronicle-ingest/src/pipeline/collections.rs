//! Collection processing: upserting the collection row and binding its
//! members.

use rusqlite::params;

use chronicle_core::Collection;

use crate::error::Result;
use crate::pipeline::RecursiveState;
use crate::session::Session;

impl Session {
    /// Upsert the collection by (account, service ID) and bind each
    /// member at its position. Members already stored during this
    /// graph's walk are resolved through the id map; anything else is
    /// stored first. Reprocess and integrity are forced off here because
    /// the main pipeline already applied them.
    pub(crate) async fn process_collection(
        &self,
        collection: Collection,
        state: &mut RecursiveState,
    ) -> Result<()> {
        let mut options = state.options.clone();
        options.reprocess = false;
        options.integrity = false;

        self.archive.conn().execute(
            "INSERT INTO collections (account_id, original_id, name, description)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (account_id, original_id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description",
            params![
                self.account.id,
                collection.original_id,
                collection.name,
                collection.description
            ],
        )?;

        // Works whether the statement above inserted or updated.
        let collection_id: i64 = self.archive.conn().query_row(
            "SELECT id FROM collections WHERE account_id = ?1 AND original_id = ?2 LIMIT 1",
            params![self.account.id, collection.original_id],
            |row| row.get(0),
        )?;

        for member in collection.items {
            let row_id = match state.id_map.get(&member.item.original_id) {
                Some(&row_id) => row_id,
                None => {
                    if let Some(filter) = &state.filter {
                        if !member.item.original_id.is_empty() {
                            filter.insert(&member.item.original_id);
                        }
                    }
                    let row_id = self.store_item(&member.item, state.stored, &options).await?;
                    state.id_map.insert(member.item.original_id.clone(), row_id);
                    row_id
                }
            };

            self.archive.conn().execute(
                "INSERT OR IGNORE INTO collection_items (item_id, collection_id, position)
                 VALUES (?1, ?2, ?3)",
                params![row_id, collection_id, member.position],
            )?;
        }

        Ok(())
    }
}
