pub mod auth;
pub mod cli;
pub mod error;
pub mod rpc;
pub mod server;
pub mod state;
pub mod subscribe;

pub use server::router;
pub use state::AppState;
