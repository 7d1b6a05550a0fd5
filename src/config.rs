use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub token_ttl_days: i64,
    pub password_reset_ttl_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Fallback when the `MAX_LOCK_TIME` setting is absent.
    pub max_lock_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadsConfig {
    pub draft_lifetime_days: i64,
    pub max_upload_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub parser_batch_size: i64,
    pub mail_batch_size: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    /// `log` or `http`
    pub transport: String,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub sender: String,
    pub max_retries: i64,
    pub retry_backoff_secs: i64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SecurityConfig {
    pub enable_hsts: Option<bool>,
    pub hsts_max_age: Option<u64>,
    pub hsts_include_subdomains: Option<bool>,
    pub csp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub login_per_minute: usize,
    pub search_per_minute: usize,
    pub upload_per_minute: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub locks: LockConfig,
    pub uploads: UploadsConfig,
    pub workers: WorkersConfig,
    pub mail: MailConfig,
    pub security: Option<SecurityConfig>,
    pub rate_limit: RateLimitConfig,
}

const DEFAULTS: &str = include_str!("../config/default.toml");

impl Default for AppConfig {
    fn default() -> Self {
        // Fallback: parse the embedded default TOML
        match from_toml_layers(&[]) {
            Ok(app_cfg) => app_cfg,
            Err(e) => {
                eprintln!("FATAL: Failed to parse default config: {}", e);
                panic!("Failed to parse default config: {}", e);
            }
        }
    }
}

/// Builds a config from the embedded defaults overlaid with the given TOML snippets.
pub fn from_toml_layers(layers: &[&str]) -> anyhow::Result<AppConfig> {
    let mut builder = ::config::Config::builder()
        .add_source(::config::File::from_str(DEFAULTS, ::config::FileFormat::Toml));
    for layer in layers {
        builder = builder.add_source(::config::File::from_str(layer, ::config::FileFormat::Toml));
    }
    Ok(builder.build()?.try_deserialize()?)
}

pub fn load() -> anyhow::Result<AppConfig> {
    // Load .env first (optional)
    let _ = dotenvy::dotenv();

    let mut builder = ::config::Config::builder()
        .add_source(::config::File::from_str(DEFAULTS, ::config::FileFormat::Toml))
        // Optional local file: fdm.toml (in CWD)
        .add_source(::config::File::with_name("fdm").required(false));

    if let Ok(custom_path) = std::env::var("FDM_CONFIG") {
        builder = builder.add_source(::config::File::with_name(&custom_path).required(false));
    }
    // Environment variables last to have highest precedence
    builder = builder.add_source(::config::Environment::with_prefix("FDM").separator("__"));

    let cfg = builder.build()?;
    let app_cfg: AppConfig = cfg.try_deserialize()?;
    validate(&app_cfg)?;
    Ok(app_cfg)
}

pub fn validate(cfg: &AppConfig) -> anyhow::Result<()> {
    if cfg.server.port == 0 {
        return Err(anyhow::anyhow!("invalid server.port: {}", cfg.server.port));
    }
    #[cfg(unix)]
    if cfg.server.port < 1024 {
        tracing::warn!("Using privileged port {} - may require elevated permissions", cfg.server.port);
    }
    if cfg.server.max_body_bytes == 0 {
        return Err(anyhow::anyhow!("server.max_body_bytes must be > 0"));
    }
    if cfg.database.max_connections == 0 {
        return Err(anyhow::anyhow!("database.max_connections must be > 0"));
    }

    if cfg.storage.root.as_os_str().is_empty() {
        return Err(anyhow::anyhow!("storage.root must not be empty"));
    }

    if cfg.auth.token_ttl_days <= 0 {
        return Err(anyhow::anyhow!("auth.token_ttl_days must be > 0"));
    }
    if cfg.auth.password_reset_ttl_hours <= 0 {
        return Err(anyhow::anyhow!("auth.password_reset_ttl_hours must be > 0"));
    }
    if cfg.locks.max_lock_minutes <= 0 {
        return Err(anyhow::anyhow!("locks.max_lock_minutes must be > 0"));
    }
    if cfg.uploads.draft_lifetime_days <= 0 {
        return Err(anyhow::anyhow!("uploads.draft_lifetime_days must be > 0"));
    }
    if cfg.uploads.max_upload_bytes == 0 {
        return Err(anyhow::anyhow!("uploads.max_upload_bytes must be > 0"));
    }

    if cfg.workers.interval_ms == 0 {
        return Err(anyhow::anyhow!("workers.interval_ms must be > 0"));
    }
    if cfg.workers.parser_batch_size <= 0 || cfg.workers.mail_batch_size <= 0 {
        return Err(anyhow::anyhow!("workers batch sizes must be > 0"));
    }

    match cfg.mail.transport.as_str() {
        "log" => {}
        "http" => {
            if cfg.mail.endpoint.as_deref().map(str::trim).unwrap_or("").is_empty() {
                return Err(anyhow::anyhow!("mail.endpoint is required for the http transport"));
            }
        }
        other => return Err(anyhow::anyhow!("unknown mail.transport: {}", other)),
    }
    if cfg.mail.max_retries <= 0 {
        return Err(anyhow::anyhow!("mail.max_retries must be > 0"));
    }
    if cfg.mail.retry_backoff_secs < 0 {
        return Err(anyhow::anyhow!("mail.retry_backoff_secs must be >= 0"));
    }

    Ok(())
}

pub fn ensure_sqlite_parent_dir(url: &str) -> anyhow::Result<()> {
    if let Some(path) = url.strip_prefix("sqlite://") {
        let path = path.split('?').next().unwrap_or(path);
        let p = Path::new(path);
        if let Some(parent) = p.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }
    Ok(())
}
