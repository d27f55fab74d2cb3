use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::{auth, rpc, subscribe};

pub fn router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/rpc", post(rpc::handle))
        .route("/subscribe", get(subscribe::handle))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    Router::new()
        .merge(authed)
        .route("/health", get(health))
        .route("/version", get(version))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn version() -> Json<Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}
