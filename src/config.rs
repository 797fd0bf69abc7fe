//! Configuration module for echo-bench.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "echo-bench")]
#[command(author = "echo-bench authors")]
#[command(version = "0.1.0")]
#[command(about = "Echo RPC server and throughput load generator", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the echo server
    Serve(ServeArgs),
    /// Drive load against an echo server and print calls per interval
    Bench(BenchArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Address to bind to (e.g., [::1]:50051)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,
}

#[derive(Args, Debug, Default)]
pub struct BenchArgs {
    /// Server address to connect to
    #[arg(short = 'a', long)]
    pub addr: Option<String>,

    /// Number of concurrent workers
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Key sent with every call
    #[arg(short = 'k', long)]
    pub key: Option<String>,

    /// Reporting interval in milliseconds
    #[arg(short = 'i', long)]
    pub interval_ms: Option<u64>,

    /// Stop after this many seconds (runs until interrupted if unset)
    #[arg(short = 'd', long)]
    pub duration: Option<u64>,

    /// Stop after this many successful calls
    #[arg(short = 'n', long)]
    pub max_requests: Option<u64>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub bench: BenchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_addr")]
    pub listen: String,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_addr(),
            max_connections: default_max_connections(),
        }
    }
}

/// Load generator configuration
#[derive(Debug, Deserialize)]
pub struct BenchConfig {
    /// Server address
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Number of workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Request key
    #[serde(default = "default_key")]
    pub key: String,
    /// Reporting interval in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Run length in seconds
    pub duration_secs: Option<u64>,
    /// Successful call limit
    pub max_requests: Option<u64>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            workers: default_workers(),
            key: default_key(),
            interval_ms: default_interval_ms(),
            duration_secs: None,
            max_requests: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_addr() -> String {
    "[::1]:50051".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_workers() -> usize {
    16
}

fn default_key() -> String {
    "key".to_string()
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server settings
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: String,
    pub max_connections: usize,
}

/// Resolved load generator settings
#[derive(Debug, Clone)]
pub struct BenchSettings {
    pub addr: String,
    pub workers: usize,
    pub key: String,
    pub interval: Duration,
    pub duration: Option<Duration>,
    pub max_requests: Option<u64>,
}

impl Default for BenchSettings {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            workers: default_workers(),
            key: default_key(),
            interval: Duration::from_millis(default_interval_ms()),
            duration: None,
            max_requests: None,
        }
    }
}

/// What the process was asked to do
#[derive(Debug, Clone)]
pub enum Mode {
    Serve(ServerSettings),
    Bench(BenchSettings),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let log_level = if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level
        };

        let mode = match cli.command {
            Command::Serve(args) => {
                let settings = ServerSettings {
                    listen: args.listen.unwrap_or(toml_config.server.listen),
                    max_connections: args
                        .max_connections
                        .unwrap_or(toml_config.server.max_connections),
                };
                if settings.max_connections == 0 {
                    return Err(ConfigError::Invalid(
                        "max_connections must be at least 1".to_string(),
                    ));
                }
                Mode::Serve(settings)
            }
            Command::Bench(args) => {
                let bench = toml_config.bench;
                let interval_ms = args.interval_ms.unwrap_or(bench.interval_ms);
                if interval_ms == 0 {
                    return Err(ConfigError::Invalid(
                        "interval_ms must be greater than 0".to_string(),
                    ));
                }
                Mode::Bench(BenchSettings {
                    addr: args.addr.unwrap_or(bench.addr),
                    workers: args.workers.unwrap_or(bench.workers),
                    key: args.key.unwrap_or(bench.key),
                    interval: Duration::from_millis(interval_ms),
                    duration: args
                        .duration
                        .or(bench.duration_secs)
                        .map(Duration::from_secs),
                    max_requests: args.max_requests.or(bench.max_requests),
                })
            }
        };

        Ok(Config { mode, log_level })
    }
}
