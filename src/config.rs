//! Configuration module for longlink.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Pause between failed connect attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Period between heartbeat probes.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How long a probe may go unacknowledged before the connection is recycled.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on a single connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "longlink")]
#[command(version = "0.1.0")]
#[command(about = "Persistent framed TCP link with heartbeat and reconnect", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the echo server
    Server(ServerArgs),
    /// Run the echo client, sending each stdin line
    Client(ClientArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServerArgs {
    /// Address to bind to (e.g., 127.0.0.1:9877)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum concurrent client connections
    #[arg(long)]
    pub max_connections: Option<usize>,
}

#[derive(Args, Debug, Default)]
pub struct ClientArgs {
    /// Server host
    #[arg(long)]
    pub host: Option<String>,

    /// Server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Delay between reconnect attempts in milliseconds
    #[arg(long)]
    pub retry_interval_ms: Option<u64>,

    /// Heartbeat probe period in milliseconds
    #[arg(long)]
    pub heartbeat_interval_ms: Option<u64>,

    /// Heartbeat acknowledgement deadline in milliseconds
    #[arg(long)]
    pub heartbeat_timeout_ms: Option<u64>,

    /// Connect attempt deadline in milliseconds
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Echo server configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
        }
    }
}

/// Link (client) configuration, timings in milliseconds
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            retry_interval_ms: default_retry_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_listen() -> String {
    "127.0.0.1:9877".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9877
}

fn default_retry_interval_ms() -> u64 {
    RETRY_INTERVAL.as_millis() as u64
}

fn default_heartbeat_interval_ms() -> u64 {
    HEARTBEAT_INTERVAL.as_millis() as u64
}

fn default_heartbeat_timeout_ms() -> u64 {
    HEARTBEAT_TIMEOUT.as_millis() as u64
}

fn default_connect_timeout_ms() -> u64 {
    CONNECT_TIMEOUT.as_millis() as u64
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Settings for one [`crate::link::Link`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    pub retry_interval: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
}

impl LinkConfig {
    /// Link to `host:port` with the default timings.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            retry_interval: RETRY_INTERVAL,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// `host:port` for logging.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new(default_host(), default_port())
    }
}

/// Settings for the echo server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: String,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
        }
    }
}

/// Which side this process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Server(ServerConfig),
    Client(LinkConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli.command, cli.log_level, toml_config))
    }

    fn merge(command: Command, log_level: String, toml_config: TomlConfig) -> Self {
        let role = match command {
            Command::Server(args) => Role::Server(ServerConfig {
                listen: args.listen.unwrap_or(toml_config.server.listen),
                max_connections: args
                    .max_connections
                    .unwrap_or(toml_config.server.max_connections),
            }),
            Command::Client(args) => {
                let file = toml_config.client;
                let ms = |cli: Option<u64>, file: u64| Duration::from_millis(cli.unwrap_or(file));
                Role::Client(LinkConfig {
                    host: args.host.unwrap_or(file.host),
                    port: args.port.unwrap_or(file.port),
                    retry_interval: ms(args.retry_interval_ms, file.retry_interval_ms),
                    heartbeat_interval: ms(args.heartbeat_interval_ms, file.heartbeat_interval_ms),
                    heartbeat_timeout: ms(args.heartbeat_timeout_ms, file.heartbeat_timeout_ms),
                    connect_timeout: ms(args.connect_timeout_ms, file.connect_timeout_ms),
                })
            }
        };

        Config {
            role,
            log_level: if log_level != "info" {
                log_level
            } else {
                toml_config.logging.level
            },
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
}
