//! Checkpoints: adapter-opaque progress blobs tagged with the invoking
//! operation's parameters.
//!
//! A stored checkpoint is only offered back to an adapter when the new
//! operation's parameter fingerprint matches the one recorded with it;
//! resuming a listing under different parameters (another timeframe,
//! another import file) confuses providers and is refused. Checkpoints
//! survive errors and cancellation, and are cleared only by a clean
//! success.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::options::Timeframe;

/// The stored pairing of operation parameters and adapter progress.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub(crate) struct CheckpointWrapper {
    pub params: String,
    pub data: Vec<u8>,
}

impl CheckpointWrapper {
    pub(crate) fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub(crate) fn decode(blob: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(blob)
    }
}

/// The parameter fingerprint for an operation: the timeframe rendering
/// plus the import filename, when one is bound.
pub(crate) fn fingerprint(timeframe: &Timeframe, filename: Option<&Path>) -> String {
    match filename {
        Some(f) => format!("{timeframe} file:{}", f.display()),
        None => timeframe.to_string(),
    }
}

/// The blob to offer the adapter: the stored checkpoint's data, only if
/// its recorded parameters match this run's fingerprint.
pub(crate) fn restorable(stored: Option<&[u8]>, current_fingerprint: &str) -> Option<Vec<u8>> {
    let wrapper = CheckpointWrapper::decode(stored?).ok()?;
    if wrapper.params != current_fingerprint {
        return None;
    }
    Some(wrapper.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;

    fn timeframe_until(t: i64) -> Timeframe {
        Timeframe {
            until: Some(Utc.timestamp_opt(t, 0).unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn test_wrapper_round_trip() {
        let w = CheckpointWrapper {
            params: "{since:0 until:9 since_item: until_item:}".to_string(),
            data: b"page-token-17".to_vec(),
        };
        let decoded = CheckpointWrapper::decode(&w.encode().unwrap()).unwrap();
        assert_eq!(decoded, w);
    }

    #[test]
    fn test_restorable_on_matching_params() {
        let fp = fingerprint(&timeframe_until(100), None);
        let blob = CheckpointWrapper {
            params: fp.clone(),
            data: b"cursor".to_vec(),
        }
        .encode()
        .unwrap();

        assert_eq!(restorable(Some(&blob), &fp).as_deref(), Some(&b"cursor"[..]));
    }

    #[test]
    fn test_not_restorable_on_different_params() {
        let fp_old = fingerprint(&timeframe_until(100), None);
        let fp_new = fingerprint(&timeframe_until(200), None);
        let blob = CheckpointWrapper {
            params: fp_old,
            data: b"cursor".to_vec(),
        }
        .encode()
        .unwrap();

        assert_eq!(restorable(Some(&blob), &fp_new), None);
    }

    #[test]
    fn test_filename_is_part_of_fingerprint() {
        let tf = timeframe_until(100);
        let a = fingerprint(&tf, Some(&PathBuf::from("takeout.tgz")));
        let b = fingerprint(&tf, Some(&PathBuf::from("other.tgz")));
        let c = fingerprint(&tf, None);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_garbage_blob_is_not_restorable() {
        assert_eq!(restorable(Some(b"not json"), "fp"), None);
        assert_eq!(restorable(None, "fp"), None);
    }
}
