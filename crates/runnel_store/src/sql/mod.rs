//! Relational backend over SQLite.
//!
//! Each namespace gets its own database file, the SQLite rendition of one
//! schema per tenant; the registry lives in `metadata.db` alongside them.
//! A namespace's `messages` table keys rows by `global_position`, which is
//! assigned `max + 1` inside the append transaction so that failed appends
//! never consume a position and numbering stays 0-based and gapless.
//! Category and correlation-category values are computed in host code and
//! written as plain columns at insert time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use futures::TryStreamExt;
use runnel::stream_name::StreamName;
use runnel::{Message, Poke, WriteMessage};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
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

/// Applied when the registry database is opened.
const META_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS namespaces (
        id TEXT PRIMARY KEY,
        token_hash TEXT NOT NULL UNIQUE,
        storage_unit TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        metadata TEXT
    )",
];

/// Applied when a namespace's database is provisioned or reopened.
const MESSAGES_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS messages (
        global_position INTEGER PRIMARY KEY,
        id TEXT NOT NULL UNIQUE,
        stream_name TEXT NOT NULL,
        category TEXT NOT NULL,
        type TEXT NOT NULL,
        position INTEGER NOT NULL,
        data TEXT NOT NULL,
        metadata TEXT,
        correlation_category TEXT,
        time TEXT NOT NULL,
        UNIQUE (stream_name, position)
    )",
    "CREATE INDEX IF NOT EXISTS messages_category_global
        ON messages (category, global_position)",
];

const MESSAGE_COLUMNS: &str =
    "id, stream_name, type, position, global_position, data, metadata, time";

#[derive(Clone)]
pub struct SqlStore {
    inner: Arc<SqlInner>,
}

struct SqlInner {
    root: PathBuf,
    meta: SqlitePool,
    pools: DashMap<String, SqlitePool>,
    append_locks: DashMap<String, Arc<Mutex<()>>>,
    registry_lock: Mutex<()>,
    bus: SubscriptionBus,
}

impl SqlStore {
    pub async fn open(root: impl AsRef<Path>, bus: SubscriptionBus) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;

        let meta = connect(&root.join("metadata.db")).await?;
        for statement in META_SCHEMA {
            sqlx::query(statement).execute(&meta).await?;
        }

        Ok(SqlStore {
            inner: Arc::new(SqlInner {
                root,
                meta,
                pools: DashMap::new(),
                append_locks: DashMap::new(),
                registry_lock: Mutex::new(()),
                bus,
            }),
        })
    }

    fn namespace_path(&self, ns: &str) -> PathBuf {
        self.inner.root.join(format!("{ns}.db"))
    }

    /// The cached connection pool for a registered namespace, opening it on
    /// first use.
    async fn pool(&self, ns: &str) -> Result<SqlitePool> {
        if let Some(pool) = self.inner.pools.get(ns) {
            return Ok(pool.clone());
        }

        let registered: Option<i64> = sqlx::query_scalar("SELECT 1 FROM namespaces WHERE id = ?")
            .bind(ns)
            .fetch_optional(&self.inner.meta)
            .await?;
        if registered.is_none() {
            return Err(Error::NamespaceNotFound { id: ns.to_string() });
        }

        let pool = provision(&self.namespace_path(ns)).await?;
        let pool = self
            .inner
            .pools
            .entry(ns.to_string())
            .or_insert(pool)
            .clone();
        Ok(pool)
    }

    fn append_lock(&self, ns: &str) -> Arc<Mutex<()>> {
        self.inner
            .append_locks
            .entry(ns.to_string())
            .or_default()
            .clone()
    }
}

async fn connect(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    Ok(SqlitePool::connect_with(options).await?)
}

async fn provision(path: &Path) -> Result<SqlitePool> {
    let pool = connect(path).await?;
    for statement in MESSAGES_SCHEMA {
        sqlx::query(statement).execute(&pool).await?;
    }
    Ok(pool)
}

fn format_time(time: DateTime<Utc>) -> String {
    // Fixed-width so the stored text sorts chronologically.
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|err| Error::CorruptIndex(format!("bad timestamp {value:?}: {err}")))
}

fn message_from_row(row: &SqliteRow) -> Result<Message<'static>> {
    let id: String = row.try_get("id")?;
    let stream_name: String = row.try_get("stream_name")?;
    let msg_type: String = row.try_get("type")?;
    let position: i64 = row.try_get("position")?;
    let global_position: i64 = row.try_get("global_position")?;
    let data: String = row.try_get("data")?;
    let metadata: Option<String> = row.try_get("metadata")?;
    let time: String = row.try_get("time")?;

    Ok(Message {
        id: Uuid::parse_str(&id)
            .map_err(|err| Error::CorruptIndex(format!("bad message id {id:?}: {err}")))?,
        stream_name: StreamName::new(stream_name)?,
        msg_type: msg_type.into(),
        position: position as u64,
        global_position: global_position as u64,
        data: std::borrow::Cow::Owned(serde_json::from_str(&data)?),
        metadata: metadata
            .map(|metadata| serde_json::from_str(&metadata).map(std::borrow::Cow::Owned))
            .transpose()?,
        time: parse_time(&time)?,
    })
}

fn namespace_from_row(row: &SqliteRow) -> Result<Namespace> {
    let created_at: String = row.try_get("created_at")?;
    let metadata: Option<String> = row.try_get("metadata")?;

    Ok(Namespace {
        id: row.try_get("id")?,
        token_hash: row.try_get("token_hash")?,
        storage_unit: row.try_get("storage_unit")?,
        description: row.try_get("description")?,
        created_at: parse_time(&created_at)?,
        metadata: metadata
            .map(|metadata| serde_json::from_str(&metadata))
            .transpose()?,
    })
}

#[async_trait::async_trait]
impl MessageStore for SqlStore {
    async fn append_to_stream(
        &self,
        ns: &str,
        stream_name: &str,
        message: WriteMessage<'_>,
        opts: AppendOptions,
    ) -> Result<Written> {
        let stream = StreamName::new(stream_name)?;
        let pool = self.pool(ns).await?;
        let lock = self.append_lock(ns);
        let _guard = lock.lock().await;

        let id = message.id.unwrap_or_else(Uuid::new_v4);

        let mut tx = pool.begin().await?;

        let duplicate: Option<i64> = sqlx::query_scalar("SELECT 1 FROM messages WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if duplicate.is_some() {
            return Err(Error::DuplicateId { id });
        }

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(position) FROM messages WHERE stream_name = ?")
                .bind(stream_name)
                .fetch_one(&mut *tx)
                .await?;
        let current_version = current_version.map(|version| version as u64);
        validate_expected_version(opts.expected_version, stream_name, current_version)?;

        let global_position: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(global_position) + 1, 0) FROM messages")
                .fetch_one(&mut *tx)
                .await?;
        let position = current_version.map(|version| version + 1).unwrap_or(0);

        let record = Message {
            id,
            stream_name: stream,
            msg_type: message.msg_type,
            position,
            global_position: global_position as u64,
            data: message.data,
            metadata: message.metadata,
            time: message.time.unwrap_or_else(Utc::now),
        };
        let poke = Poke::of(&record);

        sqlx::query(
            "INSERT INTO messages
                (global_position, id, stream_name, category, type, position,
                 data, metadata, correlation_category, time)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(global_position)
        .bind(record.id.to_string())
        .bind(stream_name)
        .bind(&poke.category)
        .bind(record.msg_type.as_ref())
        .bind(record.position as i64)
        .bind(serde_json::to_string(&record.data)?)
        .bind(
            record
                .metadata
                .as_deref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&poke.correlation_category)
        .bind(format_time(record.time))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            id = %record.id,
            stream_name = %record.stream_name,
            msg_type = %record.msg_type,
            position = record.position,
            global_position = record.global_position,
            "message written"
        );

        self.inner.bus.publish(ns, &poke);

        Ok(Written {
            position: record.position,
            global_position: record.global_position,
        })
    }

    async fn stream_messages(
        &self,
        ns: &str,
        stream_name: &str,
        opts: GetStreamOptions,
    ) -> Result<Vec<Message<'static>>> {
        let pool = self.pool(ns).await?;
        let limit = effective_batch_size(opts.batch_size);

        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE stream_name = ? AND position >= ?
             ORDER BY position LIMIT ?"
        ))
        .bind(stream_name)
        .bind(opts.position as i64)
        .bind(limit as i64)
        .fetch_all(&pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    async fn category_messages(
        &self,
        ns: &str,
        category: &str,
        opts: GetCategoryOptions,
    ) -> Result<Vec<Message<'static>>> {
        let pool = self.pool(ns).await?;
        let limit = effective_batch_size(opts.batch_size);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE global_position >= "
        ));
        builder.push_bind(opts.position as i64);
        if !category.is_empty() {
            builder.push(" AND category = ");
            builder.push_bind(category);
        }
        if let Some(correlation) = opts.correlation.as_deref() {
            builder.push(" AND correlation_category = ");
            builder.push_bind(correlation);
        }
        builder.push(" ORDER BY global_position");
        if opts.consumer_group.is_none() {
            builder.push(" LIMIT ");
            builder.push_bind(limit as i64);
        }

        let consumer_group = opts.consumer_group.as_ref();
        let mut messages = Vec::new();
        let query = builder.build();
        let mut rows = query.fetch(&pool);
        while let Some(row) = rows.try_next().await? {
            let message = message_from_row(&row)?;
            // Category and correlation were filtered in SQL; the
            // consumer-group hash runs in host code.
            if matches_category_filters(&message, None, consumer_group) {
                messages.push(message);
                if messages.len() >= limit {
                    break;
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
        let pool = self.pool(ns).await?;

        let row = match msg_type {
            Some(msg_type) => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE stream_name = ? AND type = ?
                     ORDER BY position DESC LIMIT 1"
                ))
                .bind(stream_name)
                .bind(msg_type)
                .fetch_optional(&pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE stream_name = ?
                     ORDER BY position DESC LIMIT 1"
                ))
                .bind(stream_name)
                .fetch_optional(&pool)
                .await?
            }
        };

        row.as_ref().map(message_from_row).transpose()
    }

    async fn stream_version(&self, ns: &str, stream_name: &str) -> Result<Option<u64>> {
        let pool = self.pool(ns).await?;

        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(position) FROM messages WHERE stream_name = ?")
                .bind(stream_name)
                .fetch_one(&pool)
                .await?;

        Ok(version.map(|version| version as u64))
    }

    async fn create_namespace(&self, new: NewNamespace) -> Result<Namespace> {
        validate_namespace_id(&new.id)?;
        let _guard = self.inner.registry_lock.lock().await;

        let taken: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM namespaces WHERE id = ? OR token_hash = ?")
                .bind(&new.id)
                .bind(&new.token_hash)
                .fetch_optional(&self.inner.meta)
                .await?;
        if taken.is_some() {
            return Err(Error::NamespaceExists { id: new.id });
        }

        // Provision the storage unit before the record becomes visible.
        let path = self.namespace_path(&new.id);
        let pool = provision(&path).await?;
        self.inner.pools.insert(new.id.clone(), pool);

        let record = Namespace {
            id: new.id,
            token_hash: new.token_hash,
            storage_unit: path.display().to_string(),
            description: new.description,
            created_at: Utc::now(),
            metadata: new.metadata,
        };

        sqlx::query(
            "INSERT INTO namespaces (id, token_hash, storage_unit, description, created_at, metadata)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.token_hash)
        .bind(&record.storage_unit)
        .bind(&record.description)
        .bind(format_time(record.created_at))
        .bind(
            record
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .execute(&self.inner.meta)
        .await?;

        info!(namespace = %record.id, "namespace created");

        Ok(record)
    }

    async fn delete_namespace(&self, id: &str) -> Result<u64> {
        let _guard = self.inner.registry_lock.lock().await;

        let row = sqlx::query("SELECT * FROM namespaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.inner.meta)
            .await?;
        if row.is_none() {
            return Err(Error::NamespaceNotFound { id: id.to_string() });
        }

        let pool = self.pool(id).await?;
        let messages_deleted: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&pool)
            .await?;

        self.inner.pools.remove(id);
        pool.close().await;

        // Tear the storage unit down first: a crash here leaves an orphan
        // file, which is recoverable, rather than a registry entry pointing
        // at nothing.
        let path = self.namespace_path(id);
        for suffix in ["", "-wal", "-shm"] {
            let file = PathBuf::from(format!("{}{suffix}", path.display()));
            match tokio::fs::remove_file(&file).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        sqlx::query("DELETE FROM namespaces WHERE id = ?")
            .bind(id)
            .execute(&self.inner.meta)
            .await?;

        info!(namespace = id, messages_deleted, "namespace deleted");

        Ok(messages_deleted as u64)
    }

    async fn namespaces(&self) -> Result<Vec<Namespace>> {
        let rows = sqlx::query("SELECT * FROM namespaces ORDER BY id")
            .fetch_all(&self.inner.meta)
            .await?;

        rows.iter().map(namespace_from_row).collect()
    }

    async fn namespace(&self, id: &str) -> Result<Namespace> {
        let row = sqlx::query("SELECT * FROM namespaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.inner.meta)
            .await?;

        match row {
            Some(row) => namespace_from_row(&row),
            None => Err(Error::NamespaceNotFound { id: id.to_string() }),
        }
    }

    async fn namespace_by_token_hash(&self, token_hash: &str) -> Result<Namespace> {
        let row = sqlx::query("SELECT * FROM namespaces WHERE token_hash = ?")
            .bind(token_hash)
            .fetch_optional(&self.inner.meta)
            .await?;

        match row {
            Some(row) => namespace_from_row(&row),
            None => Err(Error::UnknownToken),
        }
    }

    async fn namespace_stats(&self, id: &str) -> Result<NamespaceStats> {
        let pool = self.pool(id).await?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS message_count,
                    COUNT(DISTINCT stream_name) AS stream_count,
                    MAX(time) AS last_activity
             FROM messages",
        )
        .fetch_one(&pool)
        .await?;

        let message_count: i64 = row.try_get("message_count")?;
        let stream_count: i64 = row.try_get("stream_count")?;
        let last_activity: Option<String> = row.try_get("last_activity")?;

        Ok(NamespaceStats {
            message_count: message_count as u64,
            stream_count: stream_count as u64,
            last_activity: last_activity.as_deref().map(parse_time).transpose()?,
        })
    }

    async fn flush(&self) -> Result<()> {
        let pools: Vec<SqlitePool> = self
            .inner
            .pools
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for pool in pools {
            sqlx::query("PRAGMA wal_checkpoint(FULL)")
                .execute(&pool)
                .await?;
        }
        sqlx::query("PRAGMA wal_checkpoint(FULL)")
            .execute(&self.inner.meta)
            .await?;

        Ok(())
    }
}
