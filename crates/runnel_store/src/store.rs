use async_trait::async_trait;
use runnel::stream_name::Category;
use runnel::{ConsumerGroup, Message, WriteMessage};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::namespace::{Namespace, NamespaceStats, NewNamespace};

/// Default page size for stream and category reads.
pub const DEFAULT_BATCH_SIZE: i64 = 1000;

/// Hard ceiling on a single read, applied even to "unbounded" requests.
pub const MAX_BATCH_SIZE: usize = 10_000;

#[derive(Clone, Copy, Debug, Default)]
pub struct AppendOptions {
    /// Optimistic concurrency check: `-1` requires the stream to be empty,
    /// `n >= 0` requires the current version to equal `n`, absent means
    /// unchecked.
    pub expected_version: Option<i64>,
}

#[derive(Clone, Copy, Debug)]
pub struct GetStreamOptions {
    /// Inclusive lower bound, a 0-based stream position.
    pub position: u64,
    /// `-1` means unbounded (up to the hard ceiling).
    pub batch_size: i64,
}

impl Default for GetStreamOptions {
    fn default() -> Self {
        GetStreamOptions {
            position: 0,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GetCategoryOptions {
    /// Inclusive lower bound, a 0-based *global* position.
    pub position: u64,
    /// `-1` means unbounded (up to the hard ceiling). Counts messages that
    /// survive the correlation and consumer-group filters.
    pub batch_size: i64,
    /// Keep only messages whose `correlationStreamName` metadata has this
    /// category.
    pub correlation: Option<String>,
    /// Keep only messages whose stream's cardinal id hashes to this member.
    pub consumer_group: Option<ConsumerGroup>,
}

impl Default for GetCategoryOptions {
    fn default() -> Self {
        GetCategoryOptions {
            position: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            correlation: None,
            consumer_group: None,
        }
    }
}

/// Positions assigned to a successfully appended message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Written {
    pub position: u64,
    pub global_position: u64,
}

/// The contract every storage backend satisfies.
///
/// Message operations are namespace-scoped: the caller resolves the
/// namespace once (from the request token) and threads its id through.
/// Registry operations manage the namespaces themselves.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Appends a message, enforcing id uniqueness and the expected-version
    /// check, then publishes a poke to the subscription bus before
    /// returning.
    async fn append_to_stream(
        &self,
        ns: &str,
        stream_name: &str,
        message: WriteMessage<'_>,
        opts: AppendOptions,
    ) -> Result<Written>;

    /// Messages of one stream, ascending by position.
    async fn stream_messages(
        &self,
        ns: &str,
        stream_name: &str,
        opts: GetStreamOptions,
    ) -> Result<Vec<Message<'static>>>;

    /// Messages of one category (or the whole namespace when `category` is
    /// empty), ascending by global position.
    async fn category_messages(
        &self,
        ns: &str,
        category: &str,
        opts: GetCategoryOptions,
    ) -> Result<Vec<Message<'static>>>;

    /// The message with the greatest position in the stream; with a type
    /// filter, the greatest whose type matches.
    async fn last_stream_message(
        &self,
        ns: &str,
        stream_name: &str,
        msg_type: Option<&str>,
    ) -> Result<Option<Message<'static>>>;

    /// The stream's current version: its greatest position, or `None` when
    /// the stream has no messages.
    async fn stream_version(&self, ns: &str, stream_name: &str) -> Result<Option<u64>>;

    /// Creates the metadata record and provisions the namespace's storage
    /// unit. Rejects a duplicate id or token hash.
    async fn create_namespace(&self, new: NewNamespace) -> Result<Namespace>;

    /// Tears down the storage unit, then removes the metadata record.
    /// Returns the number of messages deleted. Permanent.
    async fn delete_namespace(&self, id: &str) -> Result<u64>;

    async fn namespaces(&self) -> Result<Vec<Namespace>>;

    async fn namespace(&self, id: &str) -> Result<Namespace>;

    async fn namespace_by_token_hash(&self, token_hash: &str) -> Result<Namespace>;

    async fn namespace_stats(&self, id: &str) -> Result<NamespaceStats>;

    /// Flushes buffered state to disk; used by graceful shutdown.
    async fn flush(&self) -> Result<()>;
}

/// Resolves a requested batch size to a row limit.
pub(crate) fn effective_batch_size(batch_size: i64) -> usize {
    if batch_size < 0 {
        MAX_BATCH_SIZE
    } else {
        (batch_size as usize).min(MAX_BATCH_SIZE)
    }
}

/// The expected-version check of the append path.
///
/// `-1` asserts the stream is empty; `n >= 0` asserts the current version
/// is exactly `n`. Anything that cannot match the current version is a
/// version conflict.
pub(crate) fn validate_expected_version(
    expected_version: Option<i64>,
    stream_name: &str,
    current_version: Option<u64>,
) -> Result<()> {
    let Some(expected) = expected_version else {
        return Ok(());
    };

    let matches = match current_version {
        None => expected == -1,
        Some(version) => expected >= 0 && expected as u64 == version,
    };

    if !matches {
        return Err(Error::WrongExpectedVersion {
            expected_version: expected,
            stream_name: stream_name.to_string(),
            stream_version: current_version,
        });
    }

    Ok(())
}

/// The in-memory part of category filtering, shared by both backends:
/// correlation and consumer-group checks. Category membership itself is
/// resolved by each backend's index.
pub(crate) fn matches_category_filters(
    message: &Message<'_>,
    correlation: Option<&str>,
    consumer_group: Option<&ConsumerGroup>,
) -> bool {
    if let Some(correlation) = correlation {
        let matches = message
            .correlation_stream_name()
            .map(|name| Category::of(name) == correlation)
            .unwrap_or(false);
        if !matches {
            return false;
        }
    }

    if let Some(group) = consumer_group {
        if !group.includes(message.stream_name.cardinal_id().as_ref()) {
            return false;
        }
    }

    true
}
