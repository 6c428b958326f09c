//! The item model: a single piece of content listed by a data source.
//!
//! An [`Item`] is the central value of the pipeline. Text-encoded content
//! rides in the row itself (`data_text`); binary or oversized content is
//! delivered as a one-shot [`DataReader`] that the engine streams into a
//! content-addressed file next to the index. An item may carry both.

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A boxed async byte stream delivering an item's binary content.
///
/// The engine reads it exactly once and closes it whether or not the
/// download succeeds.
pub type DataReader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Classification of an item's kind.
///
/// This is a closed enumeration; the integer codes are part of the
/// on-disk index format and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Class {
    #[default]
    Unknown,
    Image,
    Video,
    Audio,
    Post,
    Location,
    Email,
    PrivateMessage,
    Message,
    Conversation,
}

impl Class {
    /// The stable integer code stored in the index.
    pub fn code(self) -> i64 {
        match self {
            Class::Unknown => 0,
            Class::Image => 1,
            Class::Video => 2,
            Class::Audio => 3,
            Class::Post => 4,
            Class::Location => 5,
            Class::Email => 6,
            Class::PrivateMessage => 7,
            Class::Message => 8,
            Class::Conversation => 9,
        }
    }

    /// Decode a stored integer code; unrecognized codes map to `Unknown`.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Class::Image,
            2 => Class::Video,
            3 => Class::Audio,
            4 => Class::Post,
            5 => Class::Location,
            6 => Class::Email,
            7 => Class::PrivateMessage,
            8 => Class::Message,
            9 => Class::Conversation,
            _ => Class::Unknown,
        }
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Class::Unknown => "unknown",
            Class::Image => "image",
            Class::Video => "video",
            Class::Audio => "audio",
            Class::Post => "post",
            Class::Location => "location",
            Class::Email => "email",
            Class::PrivateMessage => "private-message",
            Class::Message => "message",
            Class::Conversation => "conversation",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Class {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unknown" => Ok(Class::Unknown),
            "image" => Ok(Class::Image),
            "video" => Ok(Class::Video),
            "audio" => Ok(Class::Audio),
            "post" => Ok(Class::Post),
            "location" => Ok(Class::Location),
            "email" => Ok(Class::Email),
            "private-message" => Ok(Class::PrivateMessage),
            "message" => Ok(Class::Message),
            "conversation" => Ok(Class::Conversation),
            other => Err(crate::error::Error::InvalidItem(format!(
                "unrecognized item class: {other}"
            ))),
        }
    }
}

/// An Earth coordinate attached to an item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Optional structured metadata attached to an item.
///
/// Every field is optional; the fewer fields set, the smaller the stored
/// blob. The value is JSON-encoded with empty fields skipped, and an
/// entirely empty value is stored as NULL, so the encoding stays
/// schema-stable without a constant prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// A hash or etag reported by the service, kept so a later listing
    /// can cheaply detect that the content changed remotely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_hash: Option<Vec<u8>>,

    // Location readings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_accuracy: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude_accuracy: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velocity: Option<i64>,

    // Photos and videos.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_make: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focal_length: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aperture_f_number: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iso_equivalent: Option<i64>,
    /// Exposure time in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposure_seconds: Option<f64>,
    /// Frames per second, for video.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,

    // Posts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl Metadata {
    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Metadata::default()
    }

    /// Encode to the stored blob form; empty metadata encodes to `None`.
    pub fn encode(&self) -> Result<Option<Vec<u8>>> {
        if self.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::to_vec(self)?))
    }

    /// Decode a stored blob; NULL or empty blobs decode to `None`.
    pub fn decode(blob: Option<&[u8]>) -> Result<Option<Metadata>> {
        match blob {
            None => Ok(None),
            Some(b) if b.is_empty() => Ok(None),
            Some(b) => Ok(Some(serde_json::from_slice(b)?)),
        }
    }
}

/// A single piece of content from a data source.
///
/// Adapters construct items with [`Item::new`] and the `with_*` builders.
/// The `original_id` must be stable and unique within the item's account:
/// processing is idempotent because of it. The timestamp is when the
/// content originated, never when it was listed or ingested.
pub struct Item {
    /// The service-assigned ID, unique within the account.
    pub original_id: String,

    /// When the original content was captured or created.
    pub timestamp: Option<DateTime<Utc>>,

    /// Classification of the item's kind.
    pub class: Class,

    /// The service-side user ID of the content's owner. When absent, the
    /// engine attributes the item to the account's own user.
    pub owner_id: Option<String>,

    /// The owner's display name, if known.
    pub owner_name: Option<String>,

    /// Text content, stored (and indexed) in the row itself.
    pub data_text: Option<String>,

    /// Preferred on-disk filename for the binary content, if any.
    pub data_file_name: Option<String>,

    /// Content checksum as reported by the service, if it reports one.
    pub service_hash: Option<Vec<u8>>,

    /// MIME type of the binary content, if known.
    pub mime_type: Option<String>,

    /// Optional structured metadata.
    pub metadata: Option<Metadata>,

    /// Optional coordinate.
    pub coordinates: Option<Coordinates>,

    // One-shot content stream; the processor takes it under its per-item
    // lock, so plain interior mutability is enough.
    reader: Mutex<Option<DataReader>>,
}

impl Item {
    /// Create an item with the required fields set.
    pub fn new(original_id: impl Into<String>, class: Class) -> Self {
        Item {
            original_id: original_id.into(),
            timestamp: None,
            class,
            owner_id: None,
            owner_name: None,
            data_text: None,
            data_file_name: None,
            service_hash: None,
            mime_type: None,
            metadata: None,
            coordinates: None,
            reader: Mutex::new(None),
        }
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn with_owner(
        mut self,
        id: Option<impl Into<String>>,
        name: Option<impl Into<String>>,
    ) -> Self {
        self.owner_id = id.map(Into::into);
        self.owner_name = name.map(Into::into);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.data_text = Some(text.into());
        self
    }

    /// Attach binary content: a preferred filename, the byte stream, and
    /// (optionally) a MIME type.
    pub fn with_data_file(
        mut self,
        name: Option<impl Into<String>>,
        reader: DataReader,
        mime_type: Option<impl Into<String>>,
    ) -> Self {
        self.data_file_name = name.map(Into::into);
        self.mime_type = mime_type.map(Into::into);
        self.reader = Mutex::new(Some(reader));
        self
    }

    pub fn with_service_hash(mut self, hash: Vec<u8>) -> Self {
        self.service_hash = Some(hash);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_coordinates(mut self, latitude: f64, longitude: f64) -> Self {
        self.coordinates = Some(Coordinates {
            latitude,
            longitude,
        });
        self
    }

    /// Take the one-shot content stream, if one was attached and has not
    /// been taken yet.
    pub fn take_reader(&self) -> Option<DataReader> {
        self.reader.lock().take()
    }

    /// Whether a content stream is currently attached.
    pub fn has_reader(&self) -> bool {
        self.reader.lock().is_some()
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("original_id", &self.original_id)
            .field("timestamp", &self.timestamp)
            .field("class", &self.class)
            .field("data_text", &self.data_text)
            .field("data_file_name", &self.data_file_name)
            .field("has_reader", &self.has_reader())
            .finish_non_exhaustive()
    }
}
