pub mod apps;
pub mod auth;
pub mod dirs;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod server;
pub mod session;
pub mod store;
pub mod sweep;
pub mod users;

use std::sync::Arc;

use apps::Registry;
use store::{ApiKey, Table};
use users::Directory;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub keys: Arc<dyn Table<ApiKey>>,
    /// User accounts and sessions; `None` when user auth is disabled.
    pub users: Option<Directory>,
    /// App id whose keys may call management endpoints.
    pub management_app: Option<String>,
}

impl AppState {
    pub fn new(registry: Arc<Registry>, keys: Arc<dyn Table<ApiKey>>) -> Self {
        Self {
            registry,
            keys,
            users: None,
            management_app: None,
        }
    }

    pub fn with_users(mut self, directory: Directory) -> Self {
        self.users = Some(directory);
        self
    }

    pub fn with_management_app(mut self, app_id: impl Into<String>) -> Self {
        self.management_app = Some(app_id.into());
        self
    }
}

pub use dirs::resolve_data_dir;
pub use server::{router, run, ServerConfig};
