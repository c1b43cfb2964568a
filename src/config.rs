//! Configuration module for the framed-rpc server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "framed-rpc")]
#[command(version)]
#[command(about = "A JSON RPC server over length-prefixed TCP frames", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7070)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Largest accepted request body in bytes
    #[arg(short = 'm', long)]
    pub max_frame_size: Option<u32>,

    /// Queued responses per connection before reading pauses
    #[arg(short = 'q', long)]
    pub max_queue_depth: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Events drained per poll call
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Disable Nagle's algorithm on accepted sockets
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
    /// Idle timeout in seconds (0 = disabled)
    #[serde(default)]
    pub idle_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            event_capacity: default_event_capacity(),
            nodelay: default_nodelay(),
            idle_timeout: 0,
        }
    }
}

/// Framing and queueing limits
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    /// Largest accepted request body in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,
    /// Queued responses per connection before reading pauses
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            max_queue_depth: default_max_queue_depth(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file, stderr when absent
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:7070".to_string()
}

fn default_backlog() -> u32 {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_event_capacity() -> usize {
    1024
}

fn default_nodelay() -> bool {
    true
}

fn default_max_frame_size() -> u32 {
    64 * 1024 // 64 KB
}

fn default_max_queue_depth() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: u32,
    pub max_connections: usize,
    pub event_capacity: usize,
    pub nodelay: bool,
    pub idle_timeout: u64,
    pub max_frame_size: u32,
    pub max_queue_depth: usize,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve configuration from already-parsed arguments.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: toml_config.server.backlog,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            event_capacity: toml_config.server.event_capacity,
            nodelay: toml_config.server.nodelay,
            idle_timeout: cli.idle_timeout.unwrap_or(toml_config.server.idle_timeout),
            max_frame_size: cli
                .max_frame_size
                .unwrap_or(toml_config.protocol.max_frame_size),
            max_queue_depth: cli
                .max_queue_depth
                .unwrap_or(toml_config.protocol.max_queue_depth),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            log_file: cli.log_file.or(toml_config.logging.file),
        }
    }

    /// Reject limits the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid("max_frame_size must be at least 1"));
        }
        if self.max_queue_depth == 0 {
            return Err(ConfigError::Invalid("max_queue_depth must be at least 1"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
