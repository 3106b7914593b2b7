pub mod auth;
pub mod containers;
pub mod daemon;
pub mod dirs;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod server;
pub mod store;

use std::sync::Arc;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub access_tokens: Arc<store::AccessTokenStore>,
    /// Live sessions; gone when the process exits.
    pub sessions: Arc<store::SessionStore>,
    pub identity: Arc<identity::Identity>,
    pub containers: Arc<dyn containers::ContainerBackend>,
}

pub use server::{resolve_data_dir, router, run, ServerConfig, ServerPaths};
