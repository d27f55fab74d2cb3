//! Bearer-token authentication.
//!
//! Authorization is the only namespace selector: the middleware hashes the
//! presented token, resolves the namespace through the registry exactly
//! once, and attaches the result to the request. Handlers never take a
//! namespace argument.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use runnel::token;
use runnel_store::{Error, Namespace, NewNamespace};
use tracing::warn;

use crate::error::ApiError;
use crate::state::AppState;

/// The resolved identity of a request.
#[derive(Clone, Debug)]
pub enum Auth {
    /// The process-configured admin token; manages namespaces but owns no
    /// streams.
    Admin,
    /// A namespace token; reads and writes that namespace only.
    Namespace(Namespace),
}

pub async fn require_bearer(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::auth_required("missing authorization header"))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::auth_required("authorization header must be a bearer token"))?;

    let auth = resolve(&state, token).await?;
    req.extensions_mut().insert(auth);
    Ok(next.run(req).await)
}

async fn resolve(state: &AppState, token: &str) -> Result<Auth, ApiError> {
    if state.admin_token.as_deref() == Some(token) {
        return Ok(Auth::Admin);
    }

    let namespace_id =
        token::parse(token).map_err(|_| ApiError::auth_invalid("malformed token"))?;
    let token_hash = token::hash(token);

    match state.store.namespace_by_token_hash(&token_hash).await {
        Ok(namespace) => Ok(Auth::Namespace(namespace)),
        Err(Error::UnknownToken) if state.auto_create_namespaces => {
            // Test mode: a well-formed unknown token mints its namespace on
            // first use.
            warn!(namespace = %namespace_id, "auto-creating namespace for unknown token");
            match state
                .store
                .create_namespace(NewNamespace {
                    id: namespace_id,
                    token_hash,
                    description: "auto-created".to_string(),
                    metadata: None,
                })
                .await
            {
                Ok(namespace) => Ok(Auth::Namespace(namespace)),
                // The id is taken by a different token.
                Err(Error::NamespaceExists { .. }) => {
                    Err(ApiError::auth_invalid("unknown token"))
                }
                Err(err) => Err(ApiError::from_store(err)),
            }
        }
        Err(Error::UnknownToken) => Err(ApiError::auth_invalid("unknown token")),
        Err(err) => Err(ApiError::from_store(err)),
    }
}

pub fn require_namespace(auth: &Auth) -> Result<&Namespace, ApiError> {
    match auth {
        Auth::Namespace(namespace) => Ok(namespace),
        Auth::Admin => Err(ApiError::invalid_request(
            "method requires a namespace token",
        )),
    }
}

pub fn require_admin(auth: &Auth) -> Result<(), ApiError> {
    match auth {
        Auth::Admin => Ok(()),
        Auth::Namespace(_) => Err(ApiError::invalid_request(
            "method requires the admin token",
        )),
    }
}
