pub mod bus;
pub mod error;
pub mod kv;
pub mod namespace;
pub mod sql;
mod store;
pub mod transfer;

pub use bus::{Subscription, SubscriptionBus, SubscriptionFilter};
pub use error::{Error, ErrorCode, Result};
pub use kv::KvStore;
pub use namespace::{Namespace, NamespaceStats, NewNamespace};
pub use sql::SqlStore;
pub use store::*;
