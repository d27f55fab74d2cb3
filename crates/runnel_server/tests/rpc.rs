use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use runnel_server::{router, AppState};
use runnel_store::kv::KvConfig;
use runnel_store::{KvStore, SubscriptionBus};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

const ADMIN: &str = "test-admin-token";

fn app() -> (TempDir, Router) {
    app_with(false)
}

fn app_with(auto_create_namespaces: bool) -> (TempDir, Router) {
    let dir = tempfile::tempdir().unwrap();
    let bus = SubscriptionBus::new();
    let store = KvStore::open(dir.path(), bus.clone(), KvConfig::default()).unwrap();
    let state = AppState {
        store: Arc::new(store),
        bus,
        admin_token: Some(ADMIN.to_string()),
        auto_create_namespaces,
    };
    (dir, router(state))
}

async fn rpc(app: &Router, token: &str, call: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/rpc")
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::from(call.to_string()))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap();
    (status, value)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap();
    (status, value)
}

async fn create_namespace(app: &Router, id: &str) -> String {
    let (status, body) = rpc(app, ADMIN, json!(["ns.create", id])).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_and_version_are_public() {
    let (_dir, app) = app();

    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));

    let (status, body) = get(&app, "/version").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn missing_or_unknown_tokens_are_rejected() {
    let (_dir, app) = app();

    let request = Request::builder()
        .method("POST")
        .uri("/rpc")
        .body(Body::from(r#"["sys.health"]"#))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["code"], "AUTH_REQUIRED");

    let (status, body) = rpc(&app, "not-a-token", json!(["sys.health"])).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "AUTH_INVALID");

    // Well-formed but unknown tokens are rejected outside test mode.
    let unknown = runnel::token::generate("ghost").unwrap();
    let (status, body) = rpc(&app, &unknown, json!(["sys.health"])).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "AUTH_INVALID");
}

#[tokio::test]
async fn append_and_read_over_the_wire() {
    let (_dir, app) = app();
    let token = create_namespace(&app, "acct").await;

    let (status, body) = rpc(
        &app,
        &token,
        json!(["stream.write", "account-123", {"type": "Deposited", "data": {"amount": 100}}]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"position": 0, "globalPosition": 0}));

    let (_, body) = rpc(
        &app,
        &token,
        json!(["stream.write", "account-123", {"type": "Deposited", "data": {"amount": 50}}]),
    )
    .await;
    assert_eq!(body, json!({"position": 1, "globalPosition": 1}));

    let (_, version) = rpc(&app, &token, json!(["stream.version", "account-123"])).await;
    assert_eq!(version, json!(1));

    let (_, rows) = rpc(
        &app,
        &token,
        json!(["stream.get", "account-123", {"position": 0, "batchSize": 10}]),
    )
    .await;
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    // [id, type, position, globalPosition, data, metadata, time]
    assert_eq!(rows[0][1], "Deposited");
    assert_eq!(rows[0][2], 0);
    assert_eq!(rows[0][4], json!({"amount": 100}));
    assert_eq!(rows[1][3], 1);

    let (_, last) = rpc(&app, &token, json!(["stream.last", "account-123"])).await;
    assert_eq!(last[2], 1, "last message has position 1");

    let (_, rows) = rpc(&app, &token, json!(["category.get", "account"])).await;
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    // [id, streamName, type, position, globalPosition, data, metadata, time]
    assert_eq!(rows[0][1], "account-123");

    let (_, missing) = rpc(&app, &token, json!(["stream.version", "account-none"])).await;
    assert_eq!(missing, Value::Null);
}

#[tokio::test]
async fn version_conflicts_surface_as_409() {
    let (_dir, app) = app();
    let token = create_namespace(&app, "occ").await;

    let (status, _) = rpc(
        &app,
        &token,
        json!(["stream.write", "order-42", {"type": "Placed", "data": {}}, {"expectedVersion": -1}]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = rpc(
        &app,
        &token,
        json!(["stream.write", "order-42", {"type": "Placed", "data": {}}, {"expectedVersion": -1}]),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "STREAM_VERSION_CONFLICT");

    let (status, body) = rpc(
        &app,
        &token,
        json!(["stream.write", "order-42", {"type": "Shipped", "data": {}}, {"expectedVersion": 0}]),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["position"], 1);
}

#[tokio::test]
async fn duplicate_ids_surface_as_409() {
    let (_dir, app) = app();
    let token = create_namespace(&app, "dup").await;

    let id = uuid::Uuid::new_v4();
    let call = json!(["stream.write", "user-1", {"type": "Registered", "data": {}, "id": id}]);

    let (status, _) = rpc(&app, &token, call.clone()).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = rpc(&app, &token, call).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "DUPLICATE_ID");
}

#[tokio::test]
async fn malformed_calls_are_invalid_requests() {
    let (_dir, app) = app();
    let token = create_namespace(&app, "bad").await;

    for call in [
        json!(["no.such.method"]),
        json!([42]),
        json!([]),
        json!({"method": "stream.get"}),
        json!(["stream.write", 7, {"type": "X"}]),
        json!(["stream.write", "account-1", {"type": "X", "bogus": true}]),
        json!(["stream.get", "account-1", {"position": "zero"}]),
        json!(["category.get", "account", {"consumerGroup": {"member": 2, "size": 2}}]),
        json!(["sys.health", "extra"]),
    ] {
        let (status, body) = rpc(&app, &token, call.clone()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{call} -> {body}");
        assert_eq!(body["code"], "INVALID_REQUEST", "{call}");
    }
}

#[tokio::test]
async fn admin_and_namespace_roles_are_separate() {
    let (_dir, app) = app();
    let token = create_namespace(&app, "roles").await;

    let (status, body) = rpc(&app, &token, json!(["ns.list"])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");

    let (status, _) = rpc(
        &app,
        ADMIN,
        json!(["stream.write", "account-1", {"type": "X", "data": {}}]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, list) = rpc(&app, ADMIN, json!(["ns.list"])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["namespace"], "roles");

    // Both roles may use sys.*.
    let (status, _) = rpc(&app, ADMIN, json!(["sys.health"])).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = rpc(&app, &token, json!(["sys.version"])).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn namespaces_are_isolated() {
    let (_dir, app) = app();
    let token_a = create_namespace(&app, "iso-a").await;
    let token_b = create_namespace(&app, "iso-b").await;

    let (status, _) = rpc(
        &app,
        &token_a,
        json!(["stream.write", "stream-x", {"type": "Secret", "data": {}}]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, rows) = rpc(&app, &token_b, json!(["stream.get", "stream-x"])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rows, json!([]));
}

#[tokio::test]
async fn namespace_lifecycle_over_the_wire() {
    let (_dir, app) = app();
    let token = create_namespace(&app, "life").await;

    let (status, body) = rpc(&app, ADMIN, json!(["ns.create", "life"])).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "NAMESPACE_EXISTS");

    rpc(
        &app,
        &token,
        json!(["stream.write", "account-1", {"type": "Opened", "data": {}}]),
    )
    .await;

    let (status, info) = rpc(&app, ADMIN, json!(["ns.info", "life"])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["namespace"], "life");
    assert_eq!(info["messageCount"], 1);
    assert_eq!(info["streamCount"], 1);
    assert!(info["lastActivity"].is_string());

    let (status, deleted) = rpc(&app, ADMIN, json!(["ns.delete", "life"])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["messagesDeleted"], 1);

    // The namespace's token no longer authenticates.
    let (status, body) = rpc(&app, &token, json!(["sys.health"])).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "AUTH_INVALID");

    let (status, body) = rpc(&app, ADMIN, json!(["ns.info", "life"])).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NAMESPACE_NOT_FOUND");
}

#[tokio::test]
async fn auto_create_mints_namespaces_in_test_mode() {
    let (_dir, app) = app_with(true);

    let token = runnel::token::generate("fresh").unwrap();
    let (status, body) = rpc(
        &app,
        &token,
        json!(["stream.write", "account-1", {"type": "Opened", "data": {}}]),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, list) = rpc(&app, ADMIN, json!(["ns.list"])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list[0]["namespace"], "fresh");
}

#[tokio::test]
async fn subscribe_validates_parameters() {
    let (_dir, app) = app();
    let token = create_namespace(&app, "subs-bad").await;

    for uri in [
        "/subscribe",
        "/subscribe?stream=account-1&category=account",
        "/subscribe?stream=account-1&position=3",
        "/subscribe?category=account&member=0",
        "/subscribe?category=account&member=2&size=2",
    ] {
        let request = Request::builder()
            .uri(uri)
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
    }
}

#[tokio::test]
async fn subscribe_streams_pokes() {
    let (_dir, app) = app();
    let token = create_namespace(&app, "subs").await;

    let request = Request::builder()
        .uri("/subscribe?category=account")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    let mut body = response.into_body();

    // The subscriber is registered once the response exists; this write
    // must produce a poke frame.
    let (status, _) = rpc(
        &app,
        &token,
        json!(["stream.write", "account-1", {"type": "Opened", "data": {}}]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
        .await
        .expect("poke frame before timeout")
        .unwrap()
        .unwrap();
    let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
    assert!(text.contains("event: poke"), "{text}");
    assert!(text.contains(r#""category":"account""#), "{text}");
    assert!(text.contains(r#""globalPosition":0"#), "{text}");
}
