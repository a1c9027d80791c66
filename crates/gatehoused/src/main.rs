use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gatehouse_server::store::{ApiKey, Table};
use gatehouse_server::users::KdfParams;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "gatehoused",
    about = "Gatehoused — multi-tenant auth and telemetry server daemon",
    version
)]
struct Cli {
    /// Data directory (default: $GATEHOUSE_DATA_DIR or the platform data dir)
    #[arg(long, global = true, env = "GATEHOUSE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "GATEHOUSE_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind
        #[arg(long, env = "GATEHOUSE_HOST", default_value = "0.0.0.0")]
        host: String,
        /// Comma-separated app ids to register
        #[arg(long, env = "GATEHOUSE_APPS", value_delimiter = ',')]
        apps: Vec<String>,
        /// App id whose keys may use management endpoints
        #[arg(long, env = "GATEHOUSE_MANAGEMENT_APP")]
        management_app: Option<String>,
        /// Allowed CORS origin, or `*`
        #[arg(long, env = "GATEHOUSE_CORS_ORIGIN")]
        cors_origin: Option<String>,
        /// Enable user accounts and session tokens
        #[arg(long, env = "GATEHOUSE_USER_AUTH")]
        user_auth: bool,
        /// How often stale count logs are swept (e.g. "24h")
        #[arg(long, env = "GATEHOUSE_SWEEP_INTERVAL", default_value = "24h", value_parser = humantime::parse_duration)]
        sweep_interval: Duration,
        /// Days of count logs to keep
        #[arg(long, env = "GATEHOUSE_RETENTION_DAYS", default_value = "30")]
        retention_days: u32,
        /// Argon2id memory cost in KiB
        #[arg(long, env = "GATEHOUSE_KDF_MEMORY_KIB", default_value = "65536")]
        kdf_memory_kib: u32,
        /// Log level: error, warn, info, debug, verbose
        #[arg(long, env = "GATEHOUSE_LOG_LEVEL")]
        log_level: Option<String>,
    },
    /// Create an API key (offline). The server must not hold the database open.
    CreateKey {
        /// App id the key authorizes
        #[arg(long)]
        app: String,
        /// Permission to grant; repeatable
        #[arg(long = "perm")]
        perms: Vec<String>,
        /// Origin allowed to use the key without sending it; repeatable
        #[arg(long = "origin")]
        origins: Vec<String>,
        /// Lifetime of the key (e.g. "30d"); never expires when omitted
        #[arg(long, value_parser = humantime::parse_duration)]
        ttl: Option<Duration>,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let raw_level = match &cli.command {
        Commands::Serve { log_level, .. } => log_level.clone(),
        Commands::CreateKey { .. } => None,
    }
    .or_else(|| std::env::var("GATEHOUSE_LOG_LEVEL").ok())
    .unwrap_or_else(|| "warn".into());
    let effective_log_level = if raw_level.eq_ignore_ascii_case("verbose") {
        "debug".to_owned()
    } else {
        raw_level
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&effective_log_level))
        .init();

    match cli.command {
        Commands::Serve {
            port,
            host,
            apps,
            management_app,
            cors_origin,
            user_auth,
            sweep_interval,
            retention_days,
            kdf_memory_kib,
            log_level: _,
        } => {
            let cfg = gatehouse_server::ServerConfig {
                host,
                port,
                data_dir: cli.data_dir,
                apps: apps
                    .into_iter()
                    .map(|a| a.trim().to_owned())
                    .filter(|a| !a.is_empty())
                    .collect(),
                management_app,
                cors_origin,
                user_auth,
                sweep_interval,
                retention_days,
                kdf: KdfParams {
                    memory_kib: kdf_memory_kib,
                    ..KdfParams::default()
                },
            };
            gatehouse_server::run(cfg).await
        }
        Commands::CreateKey {
            app,
            perms,
            origins,
            ttl,
        } => cmd_create_key(cli.data_dir, app, perms, origins, ttl).await,
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_create_key(
    data_dir: Option<PathBuf>,
    app: String,
    perms: Vec<String>,
    origins: Vec<String>,
    ttl: Option<Duration>,
) -> Result<()> {
    if app.is_empty() {
        anyhow::bail!("--app must not be empty");
    }
    let data_dir = gatehouse_server::resolve_data_dir(data_dir.as_deref())?;
    let store = gatehouse_server::server::open_store(&data_dir)?;
    let keys = store
        .table::<ApiKey>(gatehouse_server::server::KEYS_TABLE)
        .context("open key table")?;

    let expiration = ttl
        .map(|ttl| chrono::Duration::from_std(ttl).context("ttl out of range"))
        .transpose()?
        .map(|ttl| chrono::Utc::now() + ttl);

    let key = ApiKey {
        id: gatehouse_server::auth::generate_key_id(),
        app_id: app,
        perm: perms.into_iter().map(|p| (p, true)).collect::<HashMap<_, _>>(),
        expiration,
        allowed_origins: origins,
    };
    keys.insert(&key).await.context("store key")?;

    tracing::info!(app_id = %key.app_id, key_id = %key.id, "audit: key.create");
    println!("{}", serde_json::to_string_pretty(&key)?);
    Ok(())
}
