//! The RPC dispatcher.
//!
//! A call is a JSON array `[method, arg1, arg2, ...]` posted to `/rpc`.
//! The method table is fixed; argument shapes are validated strictly and
//! anything malformed is an `INVALID_REQUEST`. Results are the method's
//! return value encoded as JSON; errors use the `{code, message, details?}`
//! shape.

use std::borrow::Cow;

use axum::body::Bytes;
use axum::extract::State;
use axum::{Extension, Json};
use chrono::Utc;
use runnel::{token, ConsumerGroup, Message, WriteMessage};
use runnel_store::{
    AppendOptions, GetCategoryOptions, GetStreamOptions, NewNamespace, DEFAULT_BATCH_SIZE,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::{require_admin, require_namespace, Auth};
use crate::error::ApiError;
use crate::state::AppState;

pub async fn handle(
    State(state): State<AppState>,
    Extension(auth): Extension<Auth>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let call: Vec<Value> = serde_json::from_slice(&body).map_err(|err| {
        ApiError::invalid_request(format!("request body must be a json array: {err}"))
    })?;
    let (method, args) = call
        .split_first()
        .ok_or_else(|| ApiError::invalid_request("missing method"))?;
    let method = method
        .as_str()
        .ok_or_else(|| ApiError::invalid_request("method must be a string"))?;

    dispatch(&state, &auth, method, args).await
}

async fn dispatch(
    state: &AppState,
    auth: &Auth,
    method: &str,
    args: &[Value],
) -> Result<Json<Value>, ApiError> {
    match method {
        "stream.write" => stream_write(state, auth, args).await,
        "stream.get" => stream_get(state, auth, args).await,
        "stream.last" => stream_last(state, auth, args).await,
        "stream.version" => stream_version(state, auth, args).await,
        "category.get" => category_get(state, auth, args).await,
        "ns.create" => ns_create(state, auth, args).await,
        "ns.delete" => ns_delete(state, auth, args).await,
        "ns.list" => ns_list(state, auth, args).await,
        "ns.info" => ns_info(state, auth, args).await,
        "sys.version" => {
            max_args(args, 0)?;
            Ok(Json(json!(env!("CARGO_PKG_VERSION"))))
        }
        "sys.health" => {
            max_args(args, 0)?;
            Ok(Json(json!({ "status": "ok" })))
        }
        _ => Err(ApiError::invalid_request(format!(
            "unknown method {method:?}"
        ))),
    }
}

fn max_args(args: &[Value], max: usize) -> Result<(), ApiError> {
    if args.len() > max {
        return Err(ApiError::invalid_request(format!(
            "expected at most {max} arguments, got {}",
            args.len()
        )));
    }

    Ok(())
}

fn required<T: DeserializeOwned>(args: &[Value], index: usize, name: &str) -> Result<T, ApiError> {
    let value = args
        .get(index)
        .ok_or_else(|| ApiError::invalid_request(format!("missing {name}")))?;
    serde_json::from_value(value.clone())
        .map_err(|err| ApiError::invalid_request(format!("invalid {name}: {err}")))
}

fn optional<T: DeserializeOwned + Default>(
    args: &[Value],
    index: usize,
    name: &str,
) -> Result<T, ApiError> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|err| ApiError::invalid_request(format!("invalid {name}: {err}"))),
    }
}

/// `[id, type, position, globalPosition, data, metadata, time]`
fn stream_row(message: &Message<'_>) -> Value {
    json!([
        message.id,
        message.msg_type,
        message.position,
        message.global_position,
        message.data,
        message.metadata,
        message.time,
    ])
}

/// `[id, streamName, type, position, globalPosition, data, metadata, time]`
fn category_row(message: &Message<'_>) -> Value {
    json!([
        message.id,
        message.stream_name,
        message.msg_type,
        message.position,
        message.global_position,
        message.data,
        message.metadata,
        message.time,
    ])
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct WriteBody {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct WriteOpts {
    expected_version: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GetStreamOpts {
    position: Option<u64>,
    batch_size: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LastOpts {
    #[serde(rename = "type")]
    msg_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConsumerGroupArg {
    member: u64,
    size: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GetCategoryOpts {
    position: Option<u64>,
    batch_size: Option<i64>,
    correlation: Option<String>,
    consumer_group: Option<ConsumerGroupArg>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct NsCreateOpts {
    description: Option<String>,
    token: Option<String>,
}

async fn stream_write(
    state: &AppState,
    auth: &Auth,
    args: &[Value],
) -> Result<Json<Value>, ApiError> {
    let namespace = require_namespace(auth)?;
    max_args(args, 3)?;
    let stream: String = required(args, 0, "stream")?;
    let body: WriteBody = required(args, 1, "message")?;
    let opts: WriteOpts = optional(args, 2, "options")?;

    let written = state
        .store
        .append_to_stream(
            &namespace.id,
            &stream,
            WriteMessage {
                id: body.id,
                msg_type: Cow::Owned(body.msg_type),
                data: Cow::Owned(body.data),
                metadata: body.metadata.map(Cow::Owned),
                time: None,
            },
            AppendOptions {
                expected_version: opts.expected_version,
            },
        )
        .await
        .map_err(ApiError::from_store)?;

    Ok(Json(json!({
        "position": written.position,
        "globalPosition": written.global_position,
    })))
}

async fn stream_get(
    state: &AppState,
    auth: &Auth,
    args: &[Value],
) -> Result<Json<Value>, ApiError> {
    let namespace = require_namespace(auth)?;
    max_args(args, 2)?;
    let stream: String = required(args, 0, "stream")?;
    let opts: GetStreamOpts = optional(args, 1, "options")?;

    let messages = state
        .store
        .stream_messages(
            &namespace.id,
            &stream,
            GetStreamOptions {
                position: opts.position.unwrap_or(0),
                batch_size: opts.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            },
        )
        .await
        .map_err(ApiError::from_store)?;

    Ok(Json(Value::Array(messages.iter().map(stream_row).collect())))
}

async fn stream_last(
    state: &AppState,
    auth: &Auth,
    args: &[Value],
) -> Result<Json<Value>, ApiError> {
    let namespace = require_namespace(auth)?;
    max_args(args, 2)?;
    let stream: String = required(args, 0, "stream")?;
    let opts: LastOpts = optional(args, 1, "options")?;

    let last = state
        .store
        .last_stream_message(&namespace.id, &stream, opts.msg_type.as_deref())
        .await
        .map_err(ApiError::from_store)?;

    Ok(Json(match last {
        Some(message) => stream_row(&message),
        None => Value::Null,
    }))
}

async fn stream_version(
    state: &AppState,
    auth: &Auth,
    args: &[Value],
) -> Result<Json<Value>, ApiError> {
    let namespace = require_namespace(auth)?;
    max_args(args, 1)?;
    let stream: String = required(args, 0, "stream")?;

    let version = state
        .store
        .stream_version(&namespace.id, &stream)
        .await
        .map_err(ApiError::from_store)?;

    Ok(Json(json!(version)))
}

async fn category_get(
    state: &AppState,
    auth: &Auth,
    args: &[Value],
) -> Result<Json<Value>, ApiError> {
    let namespace = require_namespace(auth)?;
    max_args(args, 2)?;
    let category: String = required(args, 0, "category")?;
    let opts: GetCategoryOpts = optional(args, 1, "options")?;

    let consumer_group = opts
        .consumer_group
        .map(|group| ConsumerGroup::new(group.member, group.size))
        .transpose()
        .map_err(|err| ApiError::invalid_request(err.to_string()))?;

    let messages = state
        .store
        .category_messages(
            &namespace.id,
            &category,
            GetCategoryOptions {
                position: opts.position.unwrap_or(0),
                batch_size: opts.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
                correlation: opts.correlation,
                consumer_group,
            },
        )
        .await
        .map_err(ApiError::from_store)?;

    Ok(Json(Value::Array(
        messages.iter().map(category_row).collect(),
    )))
}

async fn ns_create(state: &AppState, auth: &Auth, args: &[Value]) -> Result<Json<Value>, ApiError> {
    require_admin(auth)?;
    max_args(args, 2)?;
    let id: String = required(args, 0, "namespace id")?;
    let opts: NsCreateOpts = optional(args, 1, "options")?;

    let bearer = match opts.token {
        Some(bearer) => {
            let embedded = token::parse(&bearer)
                .map_err(|err| ApiError::invalid_request(format!("invalid token: {err}")))?;
            if embedded != id {
                return Err(ApiError::invalid_request(
                    "token does not embed the namespace id",
                ));
            }
            bearer
        }
        None => token::generate(&id)
            .map_err(|err| ApiError::invalid_request(format!("invalid namespace id: {err}")))?,
    };

    let namespace = state
        .store
        .create_namespace(NewNamespace {
            id,
            token_hash: token::hash(&bearer),
            description: opts.description.unwrap_or_default(),
            metadata: None,
        })
        .await
        .map_err(ApiError::from_store)?;

    // The only response that ever carries the raw token.
    Ok(Json(json!({
        "namespace": namespace.id,
        "token": bearer,
        "createdAt": namespace.created_at,
    })))
}

async fn ns_delete(state: &AppState, auth: &Auth, args: &[Value]) -> Result<Json<Value>, ApiError> {
    require_admin(auth)?;
    max_args(args, 1)?;
    let id: String = required(args, 0, "namespace id")?;

    let messages_deleted = state
        .store
        .delete_namespace(&id)
        .await
        .map_err(ApiError::from_store)?;

    Ok(Json(json!({
        "namespace": id,
        "deletedAt": Utc::now(),
        "messagesDeleted": messages_deleted,
    })))
}

async fn ns_list(state: &AppState, auth: &Auth, args: &[Value]) -> Result<Json<Value>, ApiError> {
    require_admin(auth)?;
    max_args(args, 0)?;

    let namespaces = state
        .store
        .namespaces()
        .await
        .map_err(ApiError::from_store)?;

    Ok(Json(Value::Array(
        namespaces
            .iter()
            .map(|namespace| {
                json!({
                    "namespace": namespace.id,
                    "description": namespace.description,
                    "createdAt": namespace.created_at,
                })
            })
            .collect(),
    )))
}

async fn ns_info(state: &AppState, auth: &Auth, args: &[Value]) -> Result<Json<Value>, ApiError> {
    require_admin(auth)?;
    max_args(args, 1)?;
    let id: String = required(args, 0, "namespace id")?;

    let namespace = state
        .store
        .namespace(&id)
        .await
        .map_err(ApiError::from_store)?;
    let stats = state
        .store
        .namespace_stats(&id)
        .await
        .map_err(ApiError::from_store)?;

    Ok(Json(json!({
        "namespace": namespace.id,
        "description": namespace.description,
        "createdAt": namespace.created_at,
        "messageCount": stats.message_count,
        "streamCount": stats.stream_count,
        "lastActivity": stats.last_activity,
    })))
}
