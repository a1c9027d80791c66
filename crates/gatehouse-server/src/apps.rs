//! Sub-application registry.
//!
//! Every app is registered once at startup. Its optional capabilities are
//! resolved into an [`AppEntry`] at that point; request handling only ever
//! reads the resulting table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;

use crate::store::{CountTable, CrashTable, IndividualCrash};
use crate::AppState;

/// A registered sub-application. Only [`App::app_id`] is required; every
/// other capability defaults to absent.
pub trait App: Send + Sync {
    fn app_id(&self) -> &str;

    fn count_table(&self) -> Option<Arc<dyn CountTable>> {
        None
    }

    fn crash_table(&self) -> Option<Arc<dyn CrashTable>> {
        None
    }

    fn crash_filter(&self) -> Option<Arc<dyn CrashFilter>> {
        None
    }

    fn extension(&self) -> Option<&dyn ExtendedApp> {
        None
    }

    fn callback(&self) -> Option<&dyn CallbackApp> {
        None
    }
}

/// Gate consulted before a crash report is persisted.
#[async_trait]
pub trait CrashFilter: Send + Sync {
    async fn should_add_crash(&self, crash: &IndividualCrash) -> bool;
}

/// Lets an app mount its own routes on the shared router.
pub trait ExtendedApp: Send + Sync {
    fn extension(&self, router: Router) -> Router;
}

/// Receives a handle to the core services once, when the router is built.
pub trait CallbackApp: Send + Sync {
    fn add_backend(&self, backend: AppState);
}

/// An app with optional count and crash tables and nothing else.
pub struct SimpleApp {
    app_id: String,
    count: Option<Arc<dyn CountTable>>,
    crash: Option<Arc<dyn CrashTable>>,
}

impl SimpleApp {
    pub fn new(
        app_id: impl Into<String>,
        count: Option<Arc<dyn CountTable>>,
        crash: Option<Arc<dyn CrashTable>>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            count,
            crash,
        }
    }
}

impl App for SimpleApp {
    fn app_id(&self) -> &str {
        &self.app_id
    }

    fn count_table(&self) -> Option<Arc<dyn CountTable>> {
        self.count.clone()
    }

    fn crash_table(&self) -> Option<Arc<dyn CrashTable>> {
        self.crash.clone()
    }
}

/// An app together with the capabilities resolved at registration.
#[derive(Clone)]
pub struct AppEntry {
    pub app: Arc<dyn App>,
    pub count: Option<Arc<dyn CountTable>>,
    pub crash: Option<Arc<dyn CrashTable>>,
    pub crash_filter: Option<Arc<dyn CrashFilter>>,
}

impl AppEntry {
    fn resolve(app: Arc<dyn App>) -> Self {
        Self {
            count: app.count_table(),
            crash: app.crash_table(),
            crash_filter: app.crash_filter(),
            app,
        }
    }

    pub fn app_id(&self) -> &str {
        self.app.app_id()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate app id {0:?}")]
    Duplicate(String),
    #[error("app id must not be empty")]
    EmptyId,
    #[error("app id {0:?} collides with a core route")]
    Reserved(String),
}

/// First path segments owned by core routes. An app with one of these ids
/// could not be reached through the `/{app_id}/...` management routes.
pub const RESERVED_APP_IDS: &[&str] = &["user", "crash", "count", "health"];

/// Registered apps keyed by app id. Immutable once built.
#[derive(Default)]
pub struct Registry {
    apps: HashMap<String, AppEntry>,
}

impl Registry {
    pub fn new(apps: Vec<Arc<dyn App>>) -> Result<Self, RegistryError> {
        let mut map = HashMap::with_capacity(apps.len());
        for app in apps {
            let id = app.app_id().to_owned();
            if id.is_empty() {
                return Err(RegistryError::EmptyId);
            }
            if RESERVED_APP_IDS.contains(&id.as_str()) {
                return Err(RegistryError::Reserved(id));
            }
            if map.contains_key(&id) {
                return Err(RegistryError::Duplicate(id));
            }
            map.insert(id, AppEntry::resolve(app));
        }
        Ok(Self { apps: map })
    }

    pub fn get(&self, app_id: &str) -> Option<&AppEntry> {
        self.apps.get(app_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &AppEntry> {
        self.apps.values()
    }

    pub fn has_count(&self) -> bool {
        self.entries().any(|e| e.count.is_some())
    }

    pub fn has_crash(&self) -> bool {
        self.entries().any(|e| e.crash.is_some())
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}
