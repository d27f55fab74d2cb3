use runnel::consumer::InvalidConsumerGroup;
use runnel::stream_name::InvalidStreamName;
use thiserror::Error;
use uuid::Uuid;

/// Type alias for `Result<T, runnel_store::Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Represents all the ways a storage operation can fail.
#[derive(Debug, Error)]
pub enum Error {
    /// KV database error.
    #[error(transparent)]
    Database(#[from] sled::Error),

    /// SQL database error.
    #[error(transparent)]
    Sql(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to serialize record: {0}")]
    SerializeRecord(serde_cbor::Error),

    #[error("failed to deserialize record: {0}")]
    DeserializeRecord(serde_cbor::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    InvalidStreamName(#[from] InvalidStreamName),

    #[error(transparent)]
    InvalidConsumerGroup(#[from] InvalidConsumerGroup),

    #[error("invalid namespace id: {id:?}")]
    InvalidNamespaceId { id: String },

    #[error("message id {id} already exists in this namespace")]
    DuplicateId { id: Uuid },

    #[error("wrong expected version: {expected_version} (stream: {stream_name}, stream version: {stream_version:?})")]
    WrongExpectedVersion {
        expected_version: i64,
        stream_name: String,
        stream_version: Option<u64>,
    },

    #[error("namespace {id} already exists")]
    NamespaceExists { id: String },

    #[error("namespace {id} not found")]
    NamespaceNotFound { id: String },

    #[error("no namespace for token")]
    UnknownToken,

    #[error("corrupt index entry: {0}")]
    CorruptIndex(String),
}

impl Error {
    /// The wire-stable error code this error surfaces as.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::DuplicateId { .. } => ErrorCode::DuplicateId,
            Error::WrongExpectedVersion { .. } => ErrorCode::StreamVersionConflict,
            Error::NamespaceExists { .. } => ErrorCode::NamespaceExists,
            Error::NamespaceNotFound { .. } => ErrorCode::NamespaceNotFound,
            Error::UnknownToken => ErrorCode::AuthInvalid,
            Error::InvalidStreamName(_)
            | Error::InvalidConsumerGroup(_)
            | Error::InvalidNamespaceId { .. } => ErrorCode::InvalidRequest,
            Error::Database(_)
            | Error::Sql(_)
            | Error::Io(_)
            | Error::SerializeRecord(_)
            | Error::DeserializeRecord(_)
            | Error::Json(_)
            | Error::CorruptIndex(_) => ErrorCode::Internal,
        }
    }
}

/// Wire-stable error codes of the RPC surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    AuthRequired,
    AuthInvalid,
    NamespaceExists,
    NamespaceNotFound,
    StreamVersionConflict,
    DuplicateId,
    InvalidRequest,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::AuthInvalid => "AUTH_INVALID",
            ErrorCode::NamespaceExists => "NAMESPACE_EXISTS",
            ErrorCode::NamespaceNotFound => "NAMESPACE_NOT_FOUND",
            ErrorCode::StreamVersionConflict => "STREAM_VERSION_CONFLICT",
            ErrorCode::DuplicateId => "DUPLICATE_ID",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}
