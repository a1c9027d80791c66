use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::{
    apps::{App, Registry, SimpleApp},
    handlers::{
        archive_crash, change_password, count_log, create_user, delete_crash, delete_user,
        get_count, health, login, management_archive_crash, management_delete_crash,
        management_get_count, me, report_crash,
    },
    session::{generate_seed, SessionKeys},
    store::{ApiKey, RedbCrashTable, RedbTable, Store},
    sweep::spawn_retention_sweep,
    users::{Directory, KdfParams, PasswordHasher},
    AppState,
};

pub const DB_FILE: &str = "gatehouse.db";
pub const SESSION_KEY_FILE: &str = "gatehouse-session.key";
pub const KEYS_TABLE: &str = "api_keys";
pub const USERS_TABLE: &str = "users";

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// Ids of the stock apps to register; each gets a count and a crash table.
    pub apps: Vec<String>,
    pub management_app: Option<String>,
    /// Single allowed CORS origin, or `*`. No CORS layer when unset.
    pub cors_origin: Option<String>,
    pub user_auth: bool,
    pub sweep_interval: Duration,
    pub retention_days: u32,
    pub kdf: KdfParams,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Splits a comma-separated list, dropping blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("GATEHOUSE_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("GATEHOUSE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            data_dir: std::env::var("GATEHOUSE_DATA_DIR").ok().map(PathBuf::from),
            apps: std::env::var("GATEHOUSE_APPS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            management_app: std::env::var("GATEHOUSE_MANAGEMENT_APP")
                .ok()
                .filter(|v| !v.is_empty()),
            cors_origin: std::env::var("GATEHOUSE_CORS_ORIGIN")
                .ok()
                .filter(|v| !v.is_empty()),
            user_auth: env_flag("GATEHOUSE_USER_AUTH"),
            sweep_interval: Duration::from_secs(24 * 60 * 60),
            retention_days: 30,
            kdf: KdfParams::default(),
        }
    }
}

pub fn open_store(data_dir: &Path) -> Result<Store> {
    Store::open(&data_dir.join(DB_FILE)).context("open store")
}

/// A [`SimpleApp`] with `{app_id}_count` and `{app_id}_crashes` tables.
pub fn stock_app(store: &Store, app_id: &str) -> Result<Arc<dyn App>> {
    let count: RedbTable<crate::store::CountLog> = store
        .table(&format!("{app_id}_count"))
        .with_context(|| format!("open count table for {app_id}"))?;
    let crash = RedbCrashTable::open(store, &format!("{app_id}_crashes"))
        .with_context(|| format!("open crash table for {app_id}"))?;
    Ok(Arc::new(SimpleApp::new(
        app_id,
        Some(Arc::new(count)),
        Some(Arc::new(crash)),
    )))
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = crate::dirs::resolve_data_dir(cfg.data_dir.as_deref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let store = open_store(&data_dir)?;
    let keys: Arc<RedbTable<ApiKey>> =
        Arc::new(store.table(KEYS_TABLE).context("open key table")?);

    let apps = cfg
        .apps
        .iter()
        .map(|id| stock_app(&store, id))
        .collect::<Result<Vec<_>>>()?;
    let registry = Arc::new(Registry::new(apps).context("register apps")?);
    if registry.is_empty() {
        warn!("no apps registered; only /health and user routes will be served");
    }
    info!(apps = registry.len(), "apps registered");

    let mut state = AppState::new(registry.clone(), keys);
    if let Some(mgmt) = cfg.management_app {
        info!(app_id = %mgmt, "management app configured");
        state = state.with_management_app(mgmt);
    }
    if cfg.user_auth {
        let seed = load_or_create_session_seed(&data_dir)?;
        let sessions = SessionKeys::from_seed(&seed).context("load session key")?;
        let users = Arc::new(
            store
                .table::<crate::store::User>(USERS_TABLE)
                .context("open user table")?,
        );
        state = state.with_users(Directory::new(
            users,
            sessions,
            PasswordHasher::new(cfg.kdf),
        ));
        info!("user auth enabled");
    }

    spawn_retention_sweep(registry, cfg.sweep_interval, cfg.retention_days);

    let app = router(state, cfg.cors_origin.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "gatehouse server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}

/// Builds the full router for `state`.
///
/// Callback apps receive the state first. Core routes are mounted only for
/// the capabilities that are actually present; extension apps then add their
/// own routes.
pub fn router(state: AppState, cors_origin: Option<&str>) -> Router {
    for entry in state.registry.entries() {
        if let Some(cb) = entry.app.callback() {
            cb.add_backend(state.clone());
        }
    }

    let mut routes: Router<AppState> = Router::new().route("/health", get(health));

    if state.registry.has_count() {
        routes = routes.route("/count", post(count_log).get(get_count));
    }
    if state.registry.has_crash() {
        routes = routes
            .route("/crash", post(report_crash))
            .route("/crash/archive", post(archive_crash))
            .route("/crash/{crash_id}", delete(delete_crash));
    }
    if state.management_app.is_some() {
        routes = routes
            .route("/{app_id}/count", get(management_get_count))
            .route("/{app_id}/crash/archive", post(management_archive_crash))
            .route("/{app_id}/crash/{crash_id}", delete(management_delete_crash));
    }
    if state.users.is_some() {
        routes = routes
            .route("/user/create", post(create_user))
            .route("/user/login", post(login))
            .route("/user/me", get(me))
            .route("/user/password", post(change_password))
            .route("/user/{user_id}", delete(delete_user));
    }

    let registry = state.registry.clone();
    let mut app = routes.with_state(state);
    for entry in registry.entries() {
        if let Some(ext) = entry.app.extension() {
            app = ext.extension(app);
        }
    }

    if let Some(origin) = cors_origin {
        match build_cors(origin) {
            Some(cors) => app = app.layer(cors),
            None => warn!(origin, "ignoring unparseable CORS origin"),
        }
    }
    app.layer(TraceLayer::new_for_http())
}

fn build_cors(origin: &str) -> Option<CorsLayer> {
    let allow_origin = if origin == "*" {
        AllowOrigin::any()
    } else {
        AllowOrigin::exact(origin.parse::<HeaderValue>().ok()?)
    };
    Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([
                header::CONTENT_TYPE,
                header::AUTHORIZATION,
                HeaderName::from_static("x-api-key"),
            ]),
    )
}

/// Reads the 32-byte session signing seed, creating it on first start.
pub fn load_or_create_session_seed(data_dir: &Path) -> Result<Zeroizing<[u8; 32]>> {
    let path = data_dir.join(SESSION_KEY_FILE);
    if path.exists() {
        let bytes = Zeroizing::new(std::fs::read(&path).context("read session key")?);
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "{SESSION_KEY_FILE} is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })?;
        Ok(Zeroizing::new(seed))
    } else {
        let seed = Zeroizing::new(generate_seed());
        std::fs::write(&path, seed.as_slice()).context("write session key")?;
        info!("generated new session signing key");
        Ok(seed)
    }
}
