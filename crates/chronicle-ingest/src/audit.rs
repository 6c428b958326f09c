//! Archive auditing: verify every data file against its recorded hash
//! and find files no row references.
//!
//! An audit never mutates the index. Rows whose files fail verification
//! are exactly the ones an integrity-enabled run will reprocess;
//! orphaned files can be removed by the caller once inspected.

use std::collections::HashSet;
use std::path::Path;

use tracing::info;

use crate::error::Result;
use crate::files;
use crate::store::Archive;

/// One problem row found by an audit.
#[derive(Debug, Clone)]
pub struct AuditFinding {
    pub item_id: i64,
    pub data_file: String,
}

/// The outcome of an archive audit.
#[derive(Debug, Default)]
pub struct AuditReport {
    /// Rows with a data file that were checked.
    pub items_checked: u64,

    /// Rows whose file is gone from disk.
    pub missing_files: Vec<AuditFinding>,

    /// Rows whose file no longer hashes to the recorded value.
    pub hash_mismatches: Vec<AuditFinding>,

    /// Rows with a file but no recorded hash: an interrupted download.
    pub incomplete_downloads: Vec<AuditFinding>,

    /// Repo-relative paths under `data/` that no row references.
    pub orphaned_files: Vec<String>,
}

impl AuditReport {
    /// True when nothing needs attention.
    pub fn is_clean(&self) -> bool {
        self.missing_files.is_empty()
            && self.hash_mismatches.is_empty()
            && self.incomplete_downloads.is_empty()
            && self.orphaned_files.is_empty()
    }
}

impl Archive {
    /// Rehash every referenced data file and sweep the data tree for
    /// unreferenced files.
    pub async fn audit_data_files(&self) -> Result<AuditReport> {
        let rows: Vec<(i64, String, Option<String>)> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT id, data_file, data_hash FROM items
                 WHERE data_file IS NOT NULL AND data_file != ''",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut report = AuditReport::default();
        let mut referenced = HashSet::new();

        for (item_id, data_file, data_hash) in rows {
            report.items_checked += 1;
            referenced.insert(data_file.clone());

            let finding = AuditFinding {
                item_id,
                data_file: data_file.clone(),
            };

            let Some(recorded) = data_hash else {
                report.incomplete_downloads.push(finding);
                continue;
            };

            match files::hash_file(&self.full_path(&data_file)).await {
                Ok(hash) if hash == recorded => {}
                Ok(_) => report.hash_mismatches.push(finding),
                Err(crate::error::Error::Io(e))
                    if e.kind() == std::io::ErrorKind::NotFound =>
                {
                    report.missing_files.push(finding)
                }
                Err(e) => return Err(e),
            }
        }

        // Sweep the data tree for files nothing points at. Backups are
        // transient replace-in-progress state and are reported too.
        let data_root = self.full_path("data");
        if data_root.exists() {
            sweep_orphans(&data_root, &data_root, &referenced, &mut report.orphaned_files)?;
        }
        report.orphaned_files.sort();

        info!(
            "Audit complete: {} items checked, {} missing, {} mismatched, {} incomplete, {} orphaned",
            report.items_checked,
            report.missing_files.len(),
            report.hash_mismatches.len(),
            report.incomplete_downloads.len(),
            report.orphaned_files.len()
        );
        Ok(report)
    }
}

fn sweep_orphans(
    data_root: &Path,
    dir: &Path,
    referenced: &HashSet<String>,
    orphans: &mut Vec<String>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            sweep_orphans(data_root, &path, referenced, orphans)?;
            continue;
        }

        // Rebuild the repo-relative slash path the index stores.
        let Ok(relative) = path.strip_prefix(data_root.parent().unwrap_or(data_root)) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if !referenced.contains(&relative) {
            orphans.push(relative);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ProcessingOptions;
    use crate::testutil::{file_item, harness, ts};

    #[tokio::test]
    async fn test_clean_archive_audits_clean() {
        let h = harness("audit_clean");
        h.session
            .store_item(
                &file_item("a1", 1700000000, "a.bin", b"content"),
                ts(1),
                &ProcessingOptions::default(),
            )
            .await
            .unwrap();

        let report = h.archive.audit_data_files().await.unwrap();
        assert!(report.is_clean(), "unexpected findings: {report:?}");
        assert_eq!(report.items_checked, 1);
    }

    #[tokio::test]
    async fn test_detects_tampered_and_missing_files() {
        let h = harness("audit_dirty");
        let opts = ProcessingOptions::default();
        h.session
            .store_item(&file_item("t1", 1700000000, "t.bin", b"aaa"), ts(1), &opts)
            .await
            .unwrap();
        h.session
            .store_item(&file_item("t2", 1700000000, "u.bin", b"bbb"), ts(1), &opts)
            .await
            .unwrap();

        let file_of = |id: &str| -> String {
            h.archive
                .conn()
                .query_row(
                    "SELECT data_file FROM items WHERE original_id = ?1",
                    [id],
                    |row| row.get(0),
                )
                .unwrap()
        };
        std::fs::write(h.archive.full_path(&file_of("t1")), b"tampered").unwrap();
        std::fs::remove_file(h.archive.full_path(&file_of("t2"))).unwrap();

        let report = h.archive.audit_data_files().await.unwrap();
        assert_eq!(report.hash_mismatches.len(), 1);
        assert_eq!(report.missing_files.len(), 1);
    }

    #[tokio::test]
    async fn test_detects_incomplete_downloads_and_orphans() {
        let h = harness("audit_orphan");
        h.session
            .store_item(
                &file_item("i1", 1700000000, "i.bin", b"zzz"),
                ts(1),
                &ProcessingOptions::default(),
            )
            .await
            .unwrap();
        h.archive
            .conn()
            .execute("UPDATE items SET data_hash = NULL WHERE original_id = 'i1'", [])
            .unwrap();

        // A stray file nothing references.
        std::fs::write(h.archive.full_path("data/stray.bin"), b"junk").unwrap();

        let report = h.archive.audit_data_files().await.unwrap();
        assert_eq!(report.incomplete_downloads.len(), 1);
        assert_eq!(report.orphaned_files, vec!["data/stray.bin".to_string()]);
    }
}
