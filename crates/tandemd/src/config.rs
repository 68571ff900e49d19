//! Daemon configuration: command line and environment over an optional TOML file

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Tandem Daemon - collaborative text synchronization server
#[derive(Parser, Debug, Default)]
#[command(name = "tandemd")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long, env = "TANDEM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Bind address
    #[arg(long, env = "TANDEM_BIND")]
    pub bind: Option<String>,

    /// WebSocket port to listen on
    #[arg(long, env = "TANDEM_PORT")]
    pub port: Option<u16>,

    /// SQLite database path for persistence (default: in-memory only)
    #[arg(long, env = "TANDEM_DB")]
    pub db: Option<PathBuf>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long, env = "TANDEM_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Buffered broadcasts per document before slow clients are dropped
    #[arg(long, env = "TANDEM_BROADCAST_CAPACITY")]
    pub broadcast_capacity: Option<usize>,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "TANDEM_METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

/// Effective daemon settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub db: Option<PathBuf>,
    pub log_level: String,
    pub broadcast_capacity: usize,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7070,
            db: None,
            log_level: "info".into(),
            broadcast_capacity: 1024,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// File values (or defaults) with every flag that was given on top
    pub fn load(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(bind) = &args.bind {
            config.bind = bind.clone();
        }
        if let Some(port) = args.port {
            config.port = port;
        }
        if let Some(db) = &args.db {
            config.db = Some(db.clone());
        }
        if let Some(level) = &args.log_level {
            config.log_level = level.clone();
        }
        if let Some(capacity) = args.broadcast_capacity {
            config.broadcast_capacity = capacity;
        }
        if let Some(port) = args.metrics_port {
            config.metrics_port = Some(port);
        }
        Ok(config)
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.bind, self.port))
    }

    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>> {
        self.metrics_port
            .map(|port| {
                format!("{}:{}", self.bind, port)
                    .parse()
                    .with_context(|| format!("Invalid metrics address {}:{}", self.bind, port))
            })
            .transpose()
    }
}
