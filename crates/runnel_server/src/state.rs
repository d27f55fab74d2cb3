use std::sync::Arc;

use runnel_store::{MessageStore, SubscriptionBus};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MessageStore>,
    pub bus: SubscriptionBus,
    /// Bearer token accepted for `ns.*` administrative methods. When unset,
    /// namespace management is unavailable over the wire.
    pub admin_token: Option<String>,
    /// Test mode: mint a namespace for any well-formed unknown token.
    /// Unsafe for production deployments.
    pub auto_create_namespaces: bool,
}
