//! Key layout of the KV backend.
//!
//! Every durable fact of a namespace is a key in one tree, with a short
//! ASCII family prefix followed by components packed so that lexicographic
//! order equals scan order. Integers are big-endian fixed width. Stream and
//! category components are terminated by a NUL byte so that one stream's
//! range is never a prefix of another's.
//!
//! | family | key                                  | value                 |
//! |--------|--------------------------------------|-----------------------|
//! | `g/`   | global position                      | CBOR message blob     |
//! | `s/`   | stream name, NUL, position           | global position       |
//! | `c/`   | category, NUL, global position       | global position       |
//! | `i/`   | message id (16 bytes)                | global position       |
//! | `v/`   | stream name                          | latest position       |
//! | `meta/gpos` | (literal key)                   | next global position  |

use uuid::Uuid;

use crate::error::{Error, Result};

pub const GLOBAL_PREFIX: &[u8] = b"g/";
pub const STREAM_PREFIX: &[u8] = b"s/";
pub const CATEGORY_PREFIX: &[u8] = b"c/";
pub const ID_PREFIX: &[u8] = b"i/";
pub const VERSION_PREFIX: &[u8] = b"v/";
pub const GLOBAL_POSITION_KEY: &[u8] = b"meta/gpos";

const SEPARATOR: u8 = 0;

pub fn global(global_position: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(GLOBAL_PREFIX.len() + 8);
    key.extend_from_slice(GLOBAL_PREFIX);
    key.extend_from_slice(&global_position.to_be_bytes());
    key
}

pub fn stream_index(stream_name: &str, position: u64) -> Vec<u8> {
    let mut key = stream_index_prefix(stream_name);
    key.extend_from_slice(&position.to_be_bytes());
    key
}

pub fn stream_index_prefix(stream_name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(STREAM_PREFIX.len() + stream_name.len() + 9);
    key.extend_from_slice(STREAM_PREFIX);
    key.extend_from_slice(stream_name.as_bytes());
    key.push(SEPARATOR);
    key
}

pub fn category_index(category: &str, global_position: u64) -> Vec<u8> {
    let mut key = category_index_prefix(category);
    key.extend_from_slice(&global_position.to_be_bytes());
    key
}

pub fn category_index_prefix(category: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(CATEGORY_PREFIX.len() + category.len() + 9);
    key.extend_from_slice(CATEGORY_PREFIX);
    key.extend_from_slice(category.as_bytes());
    key.push(SEPARATOR);
    key
}

pub fn id_index(id: &Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(ID_PREFIX.len() + 16);
    key.extend_from_slice(ID_PREFIX);
    key.extend_from_slice(id.as_bytes());
    key
}

pub fn version(stream_name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(VERSION_PREFIX.len() + stream_name.len());
    key.extend_from_slice(VERSION_PREFIX);
    key.extend_from_slice(stream_name.as_bytes());
    key
}

/// Decodes an 8-byte big-endian value (a position or a pointer into `g/`).
pub fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::CorruptIndex(format!("expected 8-byte value, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(bytes))
}
