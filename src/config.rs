//! Configuration for the proxy process
//!
//! Configuration is loaded in order of precedence:
//! 1. Command-line flags (highest priority)
//! 2. Environment variables
//! 3. Config file (~/.config/dproxy/config.toml or $DPROXY_CONFIG)
//! 4. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listeners bind to
    pub host: IpAddr,

    /// Port for the proxy listener (cleartext + CONNECT)
    pub proxy_port: u16,

    /// Port for the direct HTTPS listener (optional)
    pub https_port: u16,

    /// Whether the direct HTTPS listener is enabled
    pub enable_https: bool,

    /// Path to the SQLite record store
    pub db_path: PathBuf,

    /// Data directory (CA material lives under `<data_dir>/certs/`)
    pub data_dir: PathBuf,

    /// Total timeout for upstream requests
    pub request_timeout: Duration,

    /// DPSESSION lifetime
    pub session_expiry: Duration,

    /// Log level used when RUST_LOG is unset
    pub log_level: String,

    /// Startup mode when the store carries none: passthrough|recording|replay
    pub default_mode: String,

    /// Directory for the traffic log (JSONL, one line per transaction)
    pub traffic_log_dir: PathBuf,

    /// Forwarder knobs
    pub forwarder: ForwarderConfig,
}

/// Upstream forwarder configuration
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Total request timeout
    pub total_timeout: Duration,
    /// Retry attempts after the first failure
    pub retries: u32,
    /// Constant delay between retries
    pub retry_delay: Duration,
    /// Whether a timeout is retried like a connect failure
    pub retry_on_timeout: bool,
    /// Redirect cap
    pub max_redirects: usize,
    /// Accept invalid upstream certificates (self-signed test endpoints)
    pub insecure_tls: bool,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            total_timeout: Duration::from_secs(30),
            retries: 3,
            retry_delay: Duration::from_millis(500),
            retry_on_timeout: false,
            max_redirects: 5,
            insecure_tls: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".parse().unwrap(),
            proxy_port: 8080,
            https_port: 8443,
            enable_https: false,
            db_path: PathBuf::from("./data/proxy.db"),
            data_dir: PathBuf::from("./data"),
            request_timeout: Duration::from_millis(30_000),
            session_expiry: Duration::from_secs(86_400),
            log_level: "info".to_string(),
            default_mode: "passthrough".to_string(),
            traffic_log_dir: PathBuf::from("./data/traffic"),
            forwarder: ForwarderConfig::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub host: Option<String>,
    pub proxy_port: Option<u16>,
    pub https_port: Option<u16>,
    pub enable_https: Option<bool>,
    pub db_path: Option<String>,
    pub data_dir: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub session_expiry_seconds: Option<u64>,
    pub log_level: Option<String>,
    pub default_mode: Option<String>,
    pub traffic_log_dir: Option<String>,

    /// Optional [forwarder] section
    pub forwarder: Option<FileForwarder>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileForwarder {
    pub connect_timeout_ms: Option<u64>,
    pub total_timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub retry_on_timeout: Option<bool>,
    pub max_redirects: Option<usize>,
    pub insecure_tls: Option<bool>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.parse().ok())
}

impl Config {
    /// Get the config file path: $DPROXY_CONFIG or ~/.config/dproxy/config.toml
    pub fn config_path() -> Option<PathBuf> {
        if let Some(explicit) = env_var("DPROXY_CONFIG") {
            return Some(PathBuf::from(explicit));
        }
        dirs::home_dir().map(|p| p.join(".config").join("dproxy").join("config.toml"))
    }

    /// Load file config if it exists.
    ///
    /// A config file that exists but cannot be parsed is a fatal error:
    /// failing fast beats silently running with defaults while the operator
    /// debugs the wrong thing.
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Failed to parse config file {}: {}", path.display(), e);
                    eprintln!("Fix or delete the file and restart dproxy.");
                    std::process::exit(1);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("Cannot read config file {}: {}", path.display(), e);
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: env vars -> file -> defaults
    pub fn from_env() -> Self {
        let file = Self::load_file_config();
        let defaults = Config::default();

        let host = env_parse("DPROXY_HOST")
            .or_else(|| file.host.as_deref().and_then(|h| h.parse().ok()))
            .unwrap_or(defaults.host);

        let proxy_port = env_parse("DPROXY_PORT")
            .or(file.proxy_port)
            .unwrap_or(defaults.proxy_port);

        let https_port = env_parse("DPROXY_HTTPS_PORT")
            .or(file.https_port)
            .unwrap_or(defaults.https_port);

        let enable_https = env_var("DPROXY_ENABLE_HTTPS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .or(file.enable_https)
            .unwrap_or(defaults.enable_https);

        let db_path = env_var("DPROXY_DB")
            .or(file.db_path)
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let data_dir = env_var("DPROXY_DATA_DIR")
            .or(file.data_dir)
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let request_timeout = env_parse("DPROXY_REQUEST_TIMEOUT_MS")
            .or(file.request_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.request_timeout);

        let session_expiry = env_parse("DPROXY_SESSION_EXPIRY_SECS")
            .or(file.session_expiry_seconds)
            .map(Duration::from_secs)
            .unwrap_or(defaults.session_expiry);

        let log_level = env_var("DPROXY_LOG_LEVEL")
            .or(file.log_level)
            .unwrap_or(defaults.log_level);

        let default_mode = env_var("DPROXY_MODE")
            .or(file.default_mode)
            .unwrap_or(defaults.default_mode);

        let traffic_log_dir = env_var("DPROXY_TRAFFIC_LOG_DIR")
            .or(file.traffic_log_dir)
            .map(PathBuf::from)
            .unwrap_or(defaults.traffic_log_dir);

        let ff = file.forwarder.unwrap_or_default();
        let fd = defaults.forwarder;
        let forwarder = ForwarderConfig {
            connect_timeout: env_parse("DPROXY_CONNECT_TIMEOUT_MS")
                .or(ff.connect_timeout_ms)
                .map(Duration::from_millis)
                .unwrap_or(fd.connect_timeout),
            total_timeout: ff
                .total_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(request_timeout),
            retries: env_parse("DPROXY_RETRIES").or(ff.retries).unwrap_or(fd.retries),
            retry_delay: ff
                .retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(fd.retry_delay),
            retry_on_timeout: env_var("DPROXY_RETRY_ON_TIMEOUT")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .or(ff.retry_on_timeout)
                .unwrap_or(fd.retry_on_timeout),
            max_redirects: ff.max_redirects.unwrap_or(fd.max_redirects),
            insecure_tls: env_var("DPROXY_INSECURE_TLS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .or(ff.insecure_tls)
                .unwrap_or(fd.insecure_tls),
        };

        Self {
            host,
            proxy_port,
            https_port,
            enable_https,
            db_path,
            data_dir,
            request_timeout,
            session_expiry,
            log_level,
            default_mode,
            traffic_log_dir,
            forwarder,
        }
    }

    /// Directory holding the persisted CA material.
    pub fn certs_dir(&self) -> PathBuf {
        self.data_dir.join("certs")
    }
}
