use clap::Parser;
use gproc_sync::{BackoffPolicy, BufferLimits, Credentials};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8080";
pub const DEFAULT_STATE_DIR: &str = ".gproc";
pub const DEFAULT_LOG_DIR: &str = ".gproc/logs";
pub const WS_PATH: &str = "/api/v1/ws";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid backend url '{url}': {reason}")]
    InvalidBackendUrl { url: String, reason: String },
    #[error("unsupported backend scheme '{0}', expected http or https")]
    UnsupportedScheme(String),
}

#[derive(Parser, Debug, Clone)]
#[command(name = "gproc-console", about = "Live operator console for a gproc backend")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub backend: String,
    #[arg(long, default_value = "")]
    pub state_dir: String,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value_t = 1000)]
    pub reconnect_base_ms: u64,
    #[arg(long, default_value_t = 10_000)]
    pub reconnect_cap_ms: u64,
    #[arg(long, default_value_t = 0.2)]
    pub jitter: f64,
    #[arg(long, default_value_t = 10)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 30)]
    pub health_interval_secs: u64,
    #[arg(long, default_value_t = 5)]
    pub summary_interval_secs: u64,
    #[arg(long, default_value_t = gproc_sync::buffers::DEFAULT_ALERT_CAPACITY)]
    pub alert_capacity: usize,
    #[arg(long, default_value = "")]
    pub username: String,
    #[arg(long, default_value = "")]
    pub password: String,
    #[arg(long)]
    pub mfa_code: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend_url: Url,
    pub ws_url: Url,
    pub state_dir: PathBuf,
    pub log_dir: String,
    pub debug: bool,
    pub backoff: BackoffPolicy,
    pub limits: BufferLimits,
    pub request_timeout: Duration,
    pub health_interval: Duration,
    pub summary_interval: Duration,
    pub login: Option<Credentials>,
}

impl Config {
    /// Builds the backend-only parts of the config; used by embedders and
    /// tests that do not go through the command line.
    pub fn for_backend(backend: &str, state_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let backend_url = parse_backend_url(backend)?;
        let ws_url = ws_endpoint(&backend_url)?;
        Ok(Self {
            backend_url,
            ws_url,
            state_dir: state_dir.into(),
            log_dir: String::new(),
            debug: false,
            backoff: BackoffPolicy::default(),
            limits: BufferLimits::default(),
            request_timeout: Duration::from_secs(10),
            health_interval: Duration::from_secs(30),
            summary_interval: Duration::from_secs(5),
            login: None,
        })
    }

    pub fn token_path(&self) -> PathBuf {
        self.state_dir.join("token")
    }
}

pub fn load_config(args: Args) -> Result<Config, ConfigError> {
    let backend = resolve_value(&args.backend, "GPROC_BACKEND_URL", DEFAULT_BACKEND_URL);
    let state_dir = resolve_value(&args.state_dir, "GPROC_STATE_DIR", DEFAULT_STATE_DIR);
    let mut config = Config::for_backend(&backend, state_dir)?;
    config.log_dir = resolve_value(&args.log_dir, "GPROC_LOG_DIR", DEFAULT_LOG_DIR);
    config.debug = args.debug || env_true("GPROC_DEBUG");
    config.backoff = BackoffPolicy {
        base: Duration::from_millis(args.reconnect_base_ms),
        cap: Duration::from_millis(args.reconnect_cap_ms),
        jitter: args.jitter,
    };
    config.limits = BufferLimits {
        alerts: args.alert_capacity,
        ..BufferLimits::default()
    };
    config.request_timeout = Duration::from_secs(args.request_timeout_secs.max(1));
    config.health_interval = Duration::from_secs(args.health_interval_secs.max(1));
    config.summary_interval = Duration::from_secs(args.summary_interval_secs.max(1));
    config.login = resolve_credentials(&args);
    Ok(config)
}

fn resolve_credentials(args: &Args) -> Option<Credentials> {
    let username = resolve_value(&args.username, "GPROC_USERNAME", "");
    let password = resolve_value(&args.password, "GPROC_PASSWORD", "");
    if username.trim().is_empty() || password.is_empty() {
        return None;
    }
    let credentials = Credentials::new(username, password);
    match args.mfa_code.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => Some(credentials.with_mfa_code(code)),
        _ => Some(credentials),
    }
}

pub fn parse_backend_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|err| ConfigError::InvalidBackendUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::UnsupportedScheme(other.to_string())),
    }
}

/// `http://host:port/...` becomes `ws://host:port/api/v1/ws`.
pub fn ws_endpoint(backend: &Url) -> Result<Url, ConfigError> {
    let scheme = match backend.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };
    let mut ws = backend.clone();
    ws.set_scheme(scheme)
        .map_err(|_| ConfigError::UnsupportedScheme(scheme.to_string()))?;
    ws.set_path(WS_PATH);
    ws.set_query(None);
    ws.set_fragment(None);
    Ok(ws)
}

fn resolve_value(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
