//! Consumer groups partition a category among `size` members by hashing the
//! cardinal id of each stream modulo `size`. All messages of one stream land
//! on the same member, and every message lands on exactly one member.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use xxhash_rust::xxh64::xxh64;

/// Partitioning hash seed. Fixed so that assignments are stable across
/// processes and restarts.
const PARTITION_SEED: u64 = 0;

/// A consumer group membership: this consumer is `member` of `size`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerGroup {
    pub member: u64,
    pub size: u64,
}

impl ConsumerGroup {
    pub fn new(member: u64, size: u64) -> Result<Self, InvalidConsumerGroup> {
        if size == 0 || member >= size {
            return Err(InvalidConsumerGroup { member, size });
        }

        Ok(ConsumerGroup { member, size })
    }

    /// Whether a stream with the given cardinal id belongs to this member.
    pub fn includes(&self, cardinal_id: &str) -> bool {
        xxh64(cardinal_id.as_bytes(), PARTITION_SEED) % self.size == self.member
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("consumer group member {member} out of range for size {size}")]
pub struct InvalidConsumerGroup {
    pub member: u64,
    pub size: u64,
}
