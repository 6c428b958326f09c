//! Content file management: canonical paths, crash-safe streaming
//! downloads, and byte-identical deduplication.
//!
//! Data files live under `data/<year>/<month>/<source>/` next to the
//! index. Downloads stream through a SHA-256 tee into a
//! create-exclusive file and are fsynced before the hash is recorded, so
//! a row with a `data_file` but no `data_hash` always means an
//! interrupted download.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Datelike, Timelike, Utc};
use rand::Rng;
use rusqlite::{params, OptionalExtension as _};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use chronicle_core::{DataReader, Item};

use crate::error::{Error, Result};
use crate::store::Archive;

/// How many `_<n>` suffixes to try before giving up on a filename.
const MAX_NAME_ATTEMPTS: usize = 100;

/// Filesystem-safe cap on a data file name.
const MAX_FILENAME_LEN: usize = 250;

/// Strip a path component down to `[A-Za-z0-9_.-]`, with `..` sequences
/// removed and a bare `.` rejected.
pub(crate) fn safe_path_component(s: &str) -> String {
    let mut out: String = s
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    out = out.replace("..", "");
    if out == "." {
        out.clear();
    }
    out
}

/// The canonical directory for an item's data file, relative to the
/// repository root, using `/` separators. The year and month come from
/// the item's timestamp, or from now if it has none.
pub(crate) fn canonical_dir(timestamp: Option<DateTime<Utc>>, data_source_id: &str) -> String {
    let ts = timestamp.unwrap_or_else(Utc::now);
    let source = if data_source_id.is_empty() {
        "unknown_service".to_string()
    } else {
        safe_path_component(data_source_id)
    };
    format!("data/{:04}/{:02}/{}", ts.year(), ts.month(), source)
}

/// The canonical (pre-uniqueness) filename for an item's data file.
/// Preference order: the adapter-provided name, a name derived from the
/// item's ID, a name derived from its timestamp, and finally a random
/// string.
pub(crate) fn canonical_filename(item: &Item) -> String {
    let mut filename = item
        .data_file_name
        .as_deref()
        .map(safe_path_component)
        .unwrap_or_default();

    if filename.is_empty() && !item.original_id.is_empty() {
        filename = safe_path_component(&format!("item_{}", item.original_id));
    }

    if filename.is_empty() {
        if let Some(ts) = item.timestamp {
            filename = format!(
                "{:04}_{:02}_{:02}_{:02}{:02}{:02}",
                ts.year(),
                ts.month(),
                ts.day(),
                ts.hour(),
                ts.minute(),
                ts.second()
            );
        }
    }

    if filename.is_empty() {
        filename = random_string(24);
    }

    ensure_short_enough(filename)
}

/// Cap a filename at [`MAX_FILENAME_LEN`], preserving (up to 20 chars
/// of) the extension.
fn ensure_short_enough(filename: String) -> String {
    if filename.len() <= MAX_FILENAME_LEN {
        return filename;
    }
    let mut ext = extension_of(&filename);
    if ext.len() > 20 {
        ext.truncate(20);
    }
    let mut shortened = filename;
    shortened.truncate(MAX_FILENAME_LEN - ext.len());
    shortened.push_str(&ext);
    shortened
}

/// The extension of a slash path's final component, dot included;
/// empty when there is none.
fn extension_of(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(i) if i > 0 => name[i..].to_string(),
        _ => String::new(),
    }
}

/// Open a new data file for the item at its canonical path, appending
/// `_<n>` before the extension until an unused name is found. Returns
/// the open (create-exclusive) file and its repo-relative path.
pub(crate) async fn open_unique_data_file(
    archive: &Archive,
    item: &Item,
    data_source_id: &str,
) -> Result<(fs::File, String)> {
    if data_source_id.is_empty() {
        return Err(Error::Config("missing data source ID".to_string()));
    }

    let dir = canonical_dir(item.timestamp, data_source_id);
    fs::create_dir_all(archive.full_path(&dir)).await?;

    let mut try_path = format!("{}/{}", dir, canonical_filename(item));
    let mut last_append = extension_of(&try_path);

    for i in 0..MAX_NAME_ATTEMPTS {
        let full = archive.full_path(&try_path);
        match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&full)
            .await
        {
            Ok(file) => return Ok((file, try_path)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let ext = extension_of(&try_path);
                try_path.truncate(try_path.len() - last_append.len());
                last_append = format!("_{}{}", i + 1, ext);
                try_path.push_str(&last_append);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(Error::DataFile(format!(
        "unable to find an available filename for item: {try_path}"
    )))
}

/// Stream `reader` into `file`, hashing as it goes, then sync to disk.
/// Returns the base64 SHA-256 of the content. On any failure the
/// partial file is removed.
pub(crate) async fn download(
    archive: &Archive,
    relative: &str,
    mut file: fs::File,
    mut reader: DataReader,
) -> Result<String> {
    let result = copy_and_hash(&mut file, &mut reader).await;
    match result {
        Ok(hash) => Ok(hash),
        Err(e) => {
            drop(file);
            if let Err(rm) = fs::remove_file(archive.full_path(relative)).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    warn!("Removing partial data file {}: {}", relative, rm);
                }
            }
            Err(e)
        }
    }
}

async fn copy_and_hash(file: &mut fs::File, reader: &mut DataReader) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(BASE64.encode(hasher.finalize()))
}

/// SHA-256 of an existing file, base64-encoded.
pub(crate) async fn hash_file(path: &std::path::Path) -> Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(BASE64.encode(hasher.finalize()))
}

/// If another item already stores a byte-identical file, collapse the
/// two: verify the existing file still hashes correctly, delete the
/// fresh copy (or, if the existing file was tampered with, restore it by
/// renaming the fresh copy over it), and return the surviving path for
/// the caller to record on the row. Returns `None` when the content is
/// unique.
pub(crate) async fn replace_with_existing(
    archive: &Archive,
    relative: &str,
    checksum_base64: &str,
    item_row_id: i64,
) -> Result<Option<String>> {
    if relative.is_empty() || checksum_base64.is_empty() {
        return Err(Error::DataFile(
            "missing data file name and/or hash of contents".to_string(),
        ));
    }

    let existing: Option<Option<String>> = archive
        .conn()
        .query_row(
            "SELECT data_file FROM items WHERE data_hash = ?1 AND id != ?2 LIMIT 1",
            params![checksum_base64, item_row_id],
            |row| row.get(0),
        )
        .optional()?;

    let existing = match existing {
        None => return Ok(None), // content is unique; carry on
        Some(None) => {
            return Err(Error::DataFile(format!(
                "item with matching hash is missing its data file name (hash: {checksum_base64})"
            )))
        }
        Some(Some(path)) => path,
    };

    // Make sure the existing file still holds the bytes it claims to.
    let existing_full = archive.full_path(&existing);
    let existing_hash = match hash_file(&existing_full).await {
        Ok(h) => Some(h),
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };

    if existing_hash.as_deref() == Some(checksum_base64) {
        // Duplicate confirmed: drop the fresh copy, share the old file.
        fs::remove_file(archive.full_path(relative)).await?;
    } else {
        // The recorded file was tampered with or lost; restore it with
        // the bytes just downloaded.
        info!(
            "Restoring modified data file {} from fresh download of {}",
            existing, relative
        );
        fs::rename(archive.full_path(relative), &existing_full).await?;
    }

    Ok(Some(existing))
}

/// A data file moved aside while it is being replaced. Call
/// [`Backup::finish`] with the outcome: on success the backup is
/// deleted, on failure it is restored over any partial replacement.
pub(crate) struct Backup {
    original: PathBuf,
    backup: PathBuf,
    relative: String,
}

/// Move the existing data file at `relative` to a sibling `.bak`.
/// Returns `None` when there is nothing on disk to move.
pub(crate) async fn stage_backup(archive: &Archive, relative: &str) -> Result<Option<Backup>> {
    let original = archive.full_path(relative);
    let backup = archive.full_path(&format!("{relative}.bak"));
    match fs::rename(&original, &backup).await {
        Ok(()) => Ok(Some(Backup {
            original,
            backup,
            relative: relative.to_string(),
        })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl Backup {
    pub(crate) async fn finish(self, success: bool) {
        if success {
            if let Err(e) = fs::remove_file(&self.backup).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Deleting data file backup {}.bak: {}", self.relative, e);
                }
            }
        } else if let Err(e) = fs::rename(&self.backup, &self.original).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Restoring data file {} from backup: {}", self.relative, e);
            }
        }
    }
}

/// A string of `n` random characters, excluding easily-confused ones.
/// Not a proper distribution, but fine for fallback filenames.
pub(crate) fn random_string(n: usize) -> String {
    const DICT: &[u8] = b"abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRTUVWXY23456789";
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| DICT[rng.gen_range(0..DICT.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chronicle_core::Class;
    use tempfile::TempDir;

    fn reader(bytes: &[u8]) -> DataReader {
        Box::new(std::io::Cursor::new(bytes.to_vec()))
    }

    #[test]
    fn test_safe_path_component() {
        assert_eq!(safe_path_component("IMG_1234.JPG"), "IMG_1234.JPG");
        assert_eq!(safe_path_component("a/b\\c:d"), "abcd");
        assert_eq!(safe_path_component("../../etc/passwd"), "etcpasswd");
        assert_eq!(safe_path_component("."), "");
        assert_eq!(safe_path_component("háčky"), "hky");
    }

    #[test]
    fn test_canonical_dir_uses_timestamp() {
        let ts = Utc.timestamp_opt(1700000000, 0).unwrap(); // 2023-11-14
        assert_eq!(canonical_dir(Some(ts), "twitter"), "data/2023/11/twitter");
        assert_eq!(
            canonical_dir(Some(ts), "we/ird"),
            "data/2023/11/weird"
        );
        assert_eq!(canonical_dir(Some(ts), ""), "data/2023/11/unknown_service");
    }

    #[test]
    fn test_canonical_filename_preference_order() {
        let ts = Utc.timestamp_opt(1700000000, 0).unwrap();

        let named = Item::new("id1", Class::Image)
            .with_data_file(Some("IMG.JPG"), reader(b"x"), None::<String>)
            .with_timestamp(ts);
        assert_eq!(canonical_filename(&named), "IMG.JPG");

        let by_id = Item::new("id1", Class::Image).with_timestamp(ts);
        assert_eq!(canonical_filename(&by_id), "item_id1");

        let by_ts = Item::new("", Class::Image).with_timestamp(ts);
        assert_eq!(canonical_filename(&by_ts), "2023_11_14_221320");

        let random = Item::new("", Class::Image);
        assert_eq!(canonical_filename(&random).len(), 24);
    }

    #[test]
    fn test_filename_cap_preserves_extension() {
        let long = format!("{}.jpeg", "a".repeat(300));
        let capped = ensure_short_enough(long);
        assert_eq!(capped.len(), MAX_FILENAME_LEN);
        assert!(capped.ends_with(".jpeg"));
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("a/b/photo.jpg"), ".jpg");
        assert_eq!(extension_of("noext"), "");
        assert_eq!(extension_of(".hidden"), "");
    }

    #[test]
    fn test_random_string_charset() {
        let s = random_string(64);
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(!s.contains('l') && !s.contains('0') && !s.contains('O'));
    }

    #[tokio::test]
    async fn test_open_unique_appends_suffix() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::open(tmp.path()).unwrap();
        let ts = Utc.timestamp_opt(1700000000, 0).unwrap();

        let item = || {
            Item::new("dup", Class::Image)
                .with_data_file(Some("IMG.JPG"), reader(b"x"), None::<String>)
                .with_timestamp(ts)
        };

        let (_f1, p1) = open_unique_data_file(&archive, &item(), "svc").await.unwrap();
        let (_f2, p2) = open_unique_data_file(&archive, &item(), "svc").await.unwrap();
        let (_f3, p3) = open_unique_data_file(&archive, &item(), "svc").await.unwrap();

        assert_eq!(p1, "data/2023/11/svc/IMG.JPG");
        assert_eq!(p2, "data/2023/11/svc/IMG_1.JPG");
        assert_eq!(p3, "data/2023/11/svc/IMG_2.JPG");
    }

    #[tokio::test]
    async fn test_download_hashes_and_syncs() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::open(tmp.path()).unwrap();
        let item = Item::new("h", Class::Image).with_data_file(
            Some("h.bin"),
            reader(b"hello"),
            None::<String>,
        );

        let r = item.take_reader().unwrap();
        let (file, rel) = open_unique_data_file(&archive, &item, "svc").await.unwrap();
        let hash = download(&archive, &rel, file, r).await.unwrap();

        let expected = BASE64.encode(Sha256::digest(b"hello"));
        assert_eq!(hash, expected);
        assert_eq!(std::fs::read(archive.full_path(&rel)).unwrap(), b"hello");
        assert_eq!(hash_file(&archive.full_path(&rel)).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_backup_restore_on_failure() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::open(tmp.path()).unwrap();
        std::fs::create_dir_all(archive.full_path("data")).unwrap();
        std::fs::write(archive.full_path("data/f.bin"), b"original").unwrap();

        let backup = stage_backup(&archive, "data/f.bin").await.unwrap().unwrap();
        assert!(!archive.full_path("data/f.bin").exists());

        backup.finish(false).await;
        assert_eq!(
            std::fs::read(archive.full_path("data/f.bin")).unwrap(),
            b"original"
        );
    }

    #[tokio::test]
    async fn test_backup_removed_on_success() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::open(tmp.path()).unwrap();
        std::fs::create_dir_all(archive.full_path("data")).unwrap();
        std::fs::write(archive.full_path("data/f.bin"), b"original").unwrap();

        let backup = stage_backup(&archive, "data/f.bin").await.unwrap().unwrap();
        backup.finish(true).await;

        assert!(!archive.full_path("data/f.bin.bak").exists());
        assert!(!archive.full_path("data/f.bin").exists());
    }

    #[tokio::test]
    async fn test_stage_backup_missing_file_is_none() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::open(tmp.path()).unwrap();
        assert!(stage_backup(&archive, "data/absent.bin").await.unwrap().is_none());
    }
}
