//! Command-line flags
//!
//! A thin layer over the env/file configuration: every flag simply overrides
//! the corresponding resolved value.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "dproxy", version, about = "Intercepting record/replay proxy for mobile API traffic")]
pub struct Cli {
    /// Proxy listener port
    #[arg(long)]
    pub port: Option<u16>,

    /// Bind address
    #[arg(long)]
    pub host: Option<IpAddr>,

    /// SQLite record store path
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Data directory (CA material, traffic logs)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Startup mode: passthrough, recording, or replay
    #[arg(long)]
    pub mode: Option<String>,

    /// Enable the direct HTTPS listener
    #[arg(long)]
    pub enable_https: bool,

    /// Log level when RUST_LOG is unset
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    /// Fold the flags into a resolved configuration.
    pub fn apply(self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.proxy_port = port;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(db) = self.db {
            config.db_path = db;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(mode) = self.mode {
            config.default_mode = mode;
        }
        if self.enable_https {
            config.enable_https = true;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from(["dproxy", "--port", "9999", "--mode", "replay", "--enable-https"]);
        let config = cli.apply(Config::default());
        assert_eq!(config.proxy_port, 9999);
        assert_eq!(config.default_mode, "replay");
        assert!(config.enable_https);
        // untouched values keep their defaults
        assert_eq!(config.https_port, 8443);
    }
}
