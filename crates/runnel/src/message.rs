//! A message is the atomic record of the store: a typed event appended to a
//! stream, stamped with its position in that stream and its global position
//! in the owning namespace.
//!
//! Messages are immutable once written. Positions are 0-based and gapless
//! per stream; global positions are 0-based and gapless per namespace, and
//! strictly increase in commit order. The global position is the namespace's
//! authoritative clock.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::stream_name::StreamName;

/// The metadata key recognised by the category reader for correlation
/// filtering.
pub const CORRELATION_KEY: &str = "correlationStreamName";

/// A message stored in a stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message<'a> {
    /// Unique identifier of the message within its namespace.
    pub id: Uuid,
    /// Stream name.
    pub stream_name: StreamName<'a>,
    /// Message type.
    #[serde(rename = "type")]
    pub msg_type: Cow<'a, str>,
    /// 0-based position within the stream. Gapless.
    pub position: u64,
    /// 0-based position within the namespace. Gapless, strictly increasing
    /// in commit order.
    pub global_position: u64,
    /// Message data.
    pub data: Cow<'a, Value>,
    /// Message metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Cow<'a, Value>>,
    /// Time the message was written, assigned by the server at append.
    pub time: DateTime<Utc>,
}

impl<'a> Message<'a> {
    /// The `correlationStreamName` metadata value, when present and a string.
    pub fn correlation_stream_name(&self) -> Option<&str> {
        self.metadata
            .as_deref()
            .and_then(|metadata| metadata.get(CORRELATION_KEY))
            .and_then(Value::as_str)
    }

    pub fn into_owned(self) -> Message<'static> {
        Message {
            id: self.id,
            stream_name: self.stream_name.into_owned(),
            msg_type: Cow::Owned(self.msg_type.into_owned()),
            position: self.position,
            global_position: self.global_position,
            data: Cow::Owned(self.data.into_owned()),
            metadata: self.metadata.map(|metadata| Cow::Owned(metadata.into_owned())),
            time: self.time,
        }
    }
}

/// A message to be appended to a stream.
///
/// `id` defaults to a fresh v4 uuid when absent. `time` is an override used
/// by the NDJSON importer to preserve original write times; regular appends
/// leave it unset and the server assigns the time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteMessage<'a> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(rename = "type")]
    pub msg_type: Cow<'a, str>,
    #[serde(default)]
    pub data: Cow<'a, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Cow<'a, Value>>,
    #[serde(skip)]
    pub time: Option<DateTime<Utc>>,
}
