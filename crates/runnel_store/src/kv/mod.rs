//! Log-structured KV backend.
//!
//! Each namespace is a dedicated sled database under
//! `<root>/namespaces/<id>/`; the registry lives in a separate metadata
//! database under `<root>/meta/`. All durable facts of a namespace live in
//! the database's default tree so that a single `apply_batch` commits an
//! append atomically. Key families and ordering are defined in [`keys`].
//!
//! Appends within a namespace are serialised by a per-namespace mutex,
//! which is what makes the global-position increment, the id-uniqueness
//! probe, and the version check linearisable without a full transaction.
//! Different namespaces append in parallel.
//!
//! Batches are not individually fsynced: sled's write-ahead log is flushed
//! on a fixed interval, trading at most a few seconds of writes on a hard
//! crash for sustained write throughput.

pub mod keys;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use runnel::stream_name::StreamName;
use runnel::{Message, Poke, WriteMessage};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::bus::SubscriptionBus;
use crate::error::{Error, Result};
use crate::namespace::{validate_namespace_id, Namespace, NamespaceStats, NewNamespace};
use crate::store::{
    effective_batch_size, matches_category_filters, validate_expected_version, AppendOptions,
    GetCategoryOptions, GetStreamOptions, MessageStore, Written,
};

const NAMESPACE_RECORD_PREFIX: &[u8] = b"ns/";
const TOKEN_HASH_PREFIX: &[u8] = b"tok/";

#[derive(Clone, Debug)]
pub struct KvConfig {
    /// sled page cache size in bytes.
    pub cache_capacity: u64,
    /// WAL flush interval. `None` leaves flushing to sled's default.
    pub flush_every_ms: Option<u64>,
}

impl Default for KvConfig {
    fn default() -> Self {
        KvConfig {
            cache_capacity: 64 * 1024 * 1024,
            flush_every_ms: Some(1000),
        }
    }
}

#[derive(Clone)]
pub struct KvStore {
    inner: Arc<KvInner>,
}

struct KvInner {
    root: PathBuf,
    meta: sled::Db,
    namespaces: DashMap<String, NamespaceHandle>,
    registry_lock: Mutex<()>,
    bus: SubscriptionBus,
    config: KvConfig,
}

#[derive(Clone)]
struct NamespaceHandle {
    db: sled::Db,
    append_lock: Arc<Mutex<()>>,
}

impl KvStore {
    pub fn open(
        root: impl AsRef<Path>,
        bus: SubscriptionBus,
        config: KvConfig,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("namespaces"))?;

        let meta = sled_config(&root.join("meta"), &config).open()?;

        Ok(KvStore {
            inner: Arc::new(KvInner {
                root,
                meta,
                namespaces: DashMap::new(),
                registry_lock: Mutex::new(()),
                bus,
                config,
            }),
        })
    }

    fn namespace_path(&self, ns: &str) -> PathBuf {
        self.inner.root.join("namespaces").join(ns)
    }

    /// The cached handle for a registered namespace, opening its database
    /// on first use.
    fn handle(&self, ns: &str) -> Result<NamespaceHandle> {
        if let Some(handle) = self.inner.namespaces.get(ns) {
            return Ok(handle.clone());
        }

        if self.inner.meta.get(namespace_key(ns))?.is_none() {
            return Err(Error::NamespaceNotFound { id: ns.to_string() });
        }

        self.open_handle(ns)
    }

    fn open_handle(&self, ns: &str) -> Result<NamespaceHandle> {
        match self.inner.namespaces.entry(ns.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let db = sled_config(&self.namespace_path(ns), &self.inner.config).open()?;
                let handle = NamespaceHandle {
                    db,
                    append_lock: Arc::new(Mutex::new(())),
                };
                entry.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    fn read_message(db: &sled::Db, global_position: u64) -> Result<Message<'static>> {
        let blob = db.get(keys::global(global_position))?.ok_or_else(|| {
            Error::CorruptIndex(format!("missing message at global position {global_position}"))
        })?;
        decode_message(&blob)
    }
}

fn sled_config(path: &Path, config: &KvConfig) -> sled::Config {
    sled::Config::new()
        .path(path)
        .mode(sled::Mode::HighThroughput)
        .cache_capacity(config.cache_capacity)
        .flush_every_ms(config.flush_every_ms)
}

fn namespace_key(ns: &str) -> Vec<u8> {
    let mut key = NAMESPACE_RECORD_PREFIX.to_vec();
    key.extend_from_slice(ns.as_bytes());
    key
}

fn token_hash_key(hash: &str) -> Vec<u8> {
    let mut key = TOKEN_HASH_PREFIX.to_vec();
    key.extend_from_slice(hash.as_bytes());
    key
}

fn decode_message(blob: &[u8]) -> Result<Message<'static>> {
    let message: Message<'_> =
        serde_cbor::from_slice(blob).map_err(Error::DeserializeRecord)?;
    Ok(message.into_owned())
}

fn decode_namespace(blob: &[u8]) -> Result<Namespace> {
    serde_cbor::from_slice(blob).map_err(Error::DeserializeRecord)
}

#[async_trait::async_trait]
impl MessageStore for KvStore {
    async fn append_to_stream(
        &self,
        ns: &str,
        stream_name: &str,
        message: WriteMessage<'_>,
        opts: AppendOptions,
    ) -> Result<Written> {
        let stream = StreamName::new(stream_name)?;
        let handle = self.handle(ns)?;
        let _guard = handle.append_lock.lock().await;
        let db = &handle.db;

        let id = message.id.unwrap_or_else(Uuid::new_v4);
        if db.get(keys::id_index(&id))?.is_some() {
            return Err(Error::DuplicateId { id });
        }

        let current_version = db
            .get(keys::version(stream_name))?
            .map(|value| keys::decode_u64(&value))
            .transpose()?;
        validate_expected_version(opts.expected_version, stream_name, current_version)?;

        let global_position = db
            .get(keys::GLOBAL_POSITION_KEY)?
            .map(|value| keys::decode_u64(&value))
            .transpose()?
            .unwrap_or(0);
        let position = current_version.map(|version| version + 1).unwrap_or(0);

        let record = Message {
            id,
            stream_name: stream,
            msg_type: message.msg_type,
            position,
            global_position,
            data: message.data,
            metadata: message.metadata,
            time: message.time.unwrap_or_else(Utc::now),
        };
        let blob = serde_cbor::to_vec(&record).map_err(Error::SerializeRecord)?;
        let poke = Poke::of(&record);

        let pointer = global_position.to_be_bytes().to_vec();
        let mut batch = sled::Batch::default();
        batch.insert(keys::global(global_position), blob);
        batch.insert(keys::stream_index(stream_name, position), pointer.clone());
        batch.insert(
            keys::category_index(&poke.category, global_position),
            pointer.clone(),
        );
        batch.insert(keys::id_index(&id), pointer);
        batch.insert(keys::version(stream_name), position.to_be_bytes().to_vec());
        batch.insert(
            keys::GLOBAL_POSITION_KEY,
            (global_position + 1).to_be_bytes().to_vec(),
        );
        db.apply_batch(batch)?;

        info!(
            id = %record.id,
            stream_name = %record.stream_name,
            msg_type = %record.msg_type,
            position,
            global_position,
            "message written"
        );

        self.inner.bus.publish(ns, &poke);

        Ok(Written {
            position,
            global_position,
        })
    }

    async fn stream_messages(
        &self,
        ns: &str,
        stream_name: &str,
        opts: GetStreamOptions,
    ) -> Result<Vec<Message<'static>>> {
        let handle = self.handle(ns)?;
        let limit = effective_batch_size(opts.batch_size);
        let prefix = keys::stream_index_prefix(stream_name);

        let mut messages = Vec::new();
        for entry in handle.db.range(keys::stream_index(stream_name, opts.position)..) {
            let (key, value) = entry?;
            if messages.len() >= limit || !key.starts_with(&prefix) {
                break;
            }
            let global_position = keys::decode_u64(&value)?;
            messages.push(Self::read_message(&handle.db, global_position)?);
        }

        Ok(messages)
    }

    async fn category_messages(
        &self,
        ns: &str,
        category: &str,
        opts: GetCategoryOptions,
    ) -> Result<Vec<Message<'static>>> {
        let handle = self.handle(ns)?;
        let limit = effective_batch_size(opts.batch_size);
        let correlation = opts.correlation.as_deref();
        let consumer_group = opts.consumer_group.as_ref();

        let mut messages = Vec::new();
        if category.is_empty() {
            // An empty category reads the whole namespace: scan the message
            // log itself instead of an index.
            for entry in handle.db.range(keys::global(opts.position)..) {
                let (key, value) = entry?;
                if messages.len() >= limit || !key.starts_with(keys::GLOBAL_PREFIX) {
                    break;
                }
                let message = decode_message(&value)?;
                if matches_category_filters(&message, correlation, consumer_group) {
                    messages.push(message);
                }
            }
        } else {
            let prefix = keys::category_index_prefix(category);
            for entry in handle.db.range(keys::category_index(category, opts.position)..) {
                let (key, value) = entry?;
                if messages.len() >= limit || !key.starts_with(&prefix) {
                    break;
                }
                let global_position = keys::decode_u64(&value)?;
                let message = Self::read_message(&handle.db, global_position)?;
                if matches_category_filters(&message, correlation, consumer_group) {
                    messages.push(message);
                }
            }
        }

        Ok(messages)
    }

    async fn last_stream_message(
        &self,
        ns: &str,
        stream_name: &str,
        msg_type: Option<&str>,
    ) -> Result<Option<Message<'static>>> {
        let handle = self.handle(ns)?;
        let prefix = keys::stream_index_prefix(stream_name);

        for entry in handle.db.scan_prefix(&prefix).rev() {
            let (_key, value) = entry?;
            let global_position = keys::decode_u64(&value)?;
            let message = Self::read_message(&handle.db, global_position)?;
            match msg_type {
                Some(msg_type) if message.msg_type != msg_type => continue,
                _ => return Ok(Some(message)),
            }
        }

        Ok(None)
    }

    async fn stream_version(&self, ns: &str, stream_name: &str) -> Result<Option<u64>> {
        let handle = self.handle(ns)?;
        handle
            .db
            .get(keys::version(stream_name))?
            .map(|value| keys::decode_u64(&value))
            .transpose()
    }

    async fn create_namespace(&self, new: NewNamespace) -> Result<Namespace> {
        validate_namespace_id(&new.id)?;
        let _guard = self.inner.registry_lock.lock().await;

        if self.inner.meta.get(namespace_key(&new.id))?.is_some()
            || self.inner.meta.get(token_hash_key(&new.token_hash))?.is_some()
        {
            return Err(Error::NamespaceExists { id: new.id });
        }

        // Provision the storage unit before the record becomes visible.
        let path = self.namespace_path(&new.id);
        self.open_handle(&new.id)?;

        let record = Namespace {
            id: new.id,
            token_hash: new.token_hash,
            storage_unit: path.display().to_string(),
            description: new.description,
            created_at: Utc::now(),
            metadata: new.metadata,
        };
        let blob = serde_cbor::to_vec(&record).map_err(Error::SerializeRecord)?;

        let mut batch = sled::Batch::default();
        batch.insert(namespace_key(&record.id), blob);
        batch.insert(token_hash_key(&record.token_hash), record.id.as_bytes().to_vec());
        self.inner.meta.apply_batch(batch)?;

        info!(namespace = %record.id, "namespace created");

        Ok(record)
    }

    async fn delete_namespace(&self, id: &str) -> Result<u64> {
        let _guard = self.inner.registry_lock.lock().await;

        let record = match self.inner.meta.get(namespace_key(id))? {
            Some(blob) => decode_namespace(&blob)?,
            None => return Err(Error::NamespaceNotFound { id: id.to_string() }),
        };

        // Positions are gapless, so the next-position counter is the count.
        let messages_deleted = {
            let handle = self.open_handle(id)?;
            handle
                .db
                .get(keys::GLOBAL_POSITION_KEY)?
                .map(|value| keys::decode_u64(&value))
                .transpose()?
                .unwrap_or(0)
        };

        // Tear the storage unit down first: a crash here leaves an orphan
        // directory, which is recoverable, rather than a registry entry
        // pointing at nothing.
        self.inner.namespaces.remove(id);
        match tokio::fs::remove_dir_all(self.namespace_path(id)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let mut batch = sled::Batch::default();
        batch.remove(namespace_key(id));
        batch.remove(token_hash_key(&record.token_hash));
        self.inner.meta.apply_batch(batch)?;

        info!(namespace = id, messages_deleted, "namespace deleted");

        Ok(messages_deleted)
    }

    async fn namespaces(&self) -> Result<Vec<Namespace>> {
        let mut namespaces = Vec::new();
        for entry in self.inner.meta.scan_prefix(NAMESPACE_RECORD_PREFIX) {
            let (_key, blob) = entry?;
            namespaces.push(decode_namespace(&blob)?);
        }

        Ok(namespaces)
    }

    async fn namespace(&self, id: &str) -> Result<Namespace> {
        match self.inner.meta.get(namespace_key(id))? {
            Some(blob) => decode_namespace(&blob),
            None => Err(Error::NamespaceNotFound { id: id.to_string() }),
        }
    }

    async fn namespace_by_token_hash(&self, token_hash: &str) -> Result<Namespace> {
        let id = match self.inner.meta.get(token_hash_key(token_hash))? {
            Some(id) => String::from_utf8_lossy(&id).into_owned(),
            None => return Err(Error::UnknownToken),
        };

        match self.inner.meta.get(namespace_key(&id))? {
            Some(blob) => decode_namespace(&blob),
            None => Err(Error::UnknownToken),
        }
    }

    async fn namespace_stats(&self, id: &str) -> Result<NamespaceStats> {
        let handle = self.handle(id)?;

        let message_count = handle
            .db
            .get(keys::GLOBAL_POSITION_KEY)?
            .map(|value| keys::decode_u64(&value))
            .transpose()?
            .unwrap_or(0);

        let mut stream_count = 0;
        for entry in handle.db.scan_prefix(keys::VERSION_PREFIX) {
            entry?;
            stream_count += 1;
        }

        let last_activity = match handle.db.scan_prefix(keys::GLOBAL_PREFIX).next_back() {
            Some(entry) => {
                let (_key, blob) = entry?;
                Some(decode_message(&blob)?.time)
            }
            None => None,
        };

        Ok(NamespaceStats {
            message_count,
            stream_count,
            last_activity,
        })
    }

    async fn flush(&self) -> Result<()> {
        self.inner.meta.flush_async().await?;

        let dbs: Vec<sled::Db> = self
            .inner
            .namespaces
            .iter()
            .map(|entry| entry.value().db.clone())
            .collect();
        for db in dbs {
            db.flush_async().await?;
        }

        Ok(())
    }
}
