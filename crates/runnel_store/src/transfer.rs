//! NDJSON import and export.
//!
//! One JSON object per line: `{id, stream, type, pos, gpos, data, meta,
//! time}` with RFC 3339 times. Export is a whole-namespace scan through the
//! category reader (the empty category reads everything). Import re-appends
//! each record preserving id, type, data, metadata and original write time;
//! positions are reassigned by the store. Records whose id already exists
//! are skipped, making import idempotent on id.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::{AppendOptions, GetCategoryOptions, MessageStore, DEFAULT_BATCH_SIZE};

use runnel::{Message, WriteMessage};

/// The line format of NDJSON transfers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: Uuid,
    pub stream: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub pos: u64,
    pub gpos: u64,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub time: DateTime<Utc>,
}

impl TransferRecord {
    fn of(message: &Message<'_>) -> Self {
        TransferRecord {
            id: message.id,
            stream: message.stream_name.to_string(),
            msg_type: message.msg_type.to_string(),
            pos: message.position,
            gpos: message.global_position,
            data: message.data.clone().into_owned(),
            meta: message.metadata.clone().map(Cow::into_owned),
            time: message.time,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: u64,
    pub skipped: u64,
}

/// Streams every message of the namespace to `out`, in global-position
/// order. Returns the number of records written.
pub async fn export<W>(store: &dyn MessageStore, ns: &str, out: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut position = 0;
    let mut exported = 0;

    loop {
        let batch = store
            .category_messages(
                ns,
                "",
                GetCategoryOptions {
                    position,
                    batch_size: DEFAULT_BATCH_SIZE,
                    ..Default::default()
                },
            )
            .await?;

        for message in &batch {
            let line = serde_json::to_vec(&TransferRecord::of(message))?;
            out.write_all(&line).await?;
            out.write_all(b"\n").await?;
            exported += 1;
        }

        match batch.last() {
            Some(last) if batch.len() == DEFAULT_BATCH_SIZE as usize => {
                position = last.global_position + 1;
            }
            _ => break,
        }
    }

    out.flush().await?;
    Ok(exported)
}

/// Appends every record read from `input`. Duplicate ids are skipped, not
/// failed.
pub async fn import<R>(store: &dyn MessageStore, ns: &str, input: R) -> Result<ImportSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut summary = ImportSummary::default();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let record: TransferRecord = serde_json::from_str(&line)?;

        let write = WriteMessage {
            id: Some(record.id),
            msg_type: Cow::Owned(record.msg_type),
            data: Cow::Owned(record.data),
            metadata: record.meta.map(Cow::Owned),
            time: Some(record.time),
        };

        match store
            .append_to_stream(ns, &record.stream, write, AppendOptions::default())
            .await
        {
            Ok(_) => summary.imported += 1,
            Err(Error::DuplicateId { .. }) => summary.skipped += 1,
            Err(err) => return Err(err),
        }
    }

    Ok(summary)
}
