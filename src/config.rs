//! Configuration module for the revmsg listener.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the listener
#[derive(Parser, Debug)]
#[command(name = "revmsg")]
#[command(author = "revmsg authors")]
#[command(version = "0.1.0")]
#[command(about = "Accepts HTTP-shaped requests and logs their JSON payloads", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:5710)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of connections handled at once
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Size of the per-connection read buffer in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Read timeout in milliseconds
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// Write timeout in milliseconds
    #[arg(long)]
    pub write_timeout: Option<u64>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Listen backlog passed to listen(2)
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            backlog: default_backlog(),
        }
    }
}

/// Per-connection and accept-loop limits
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Bytes read from each connection; anything beyond is dropped
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Consecutive transient accept errors tolerated before giving up
    #[serde(default = "default_max_accept_failures")]
    pub max_accept_failures: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            read_timeout_ms: default_timeout_ms(),
            write_timeout_ms: default_timeout_ms(),
            max_accept_failures: default_max_accept_failures(),
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

fn default_listen() -> String {
    "127.0.0.1:5710".to_string()
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_connections() -> usize {
    1024
}

fn default_buffer_size() -> usize {
    1024
}

fn default_timeout_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_max_accept_failures() -> u32 {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: i32,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_accept_failures: u32,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::empty(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already-parsed CLI args, reading the TOML file they point at.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
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

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let limits = toml_config.limits;
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: toml_config.server.backlog,
            workers: cli.workers.or(toml_config.server.workers),
            max_connections: cli.max_connections.unwrap_or(limits.max_connections),
            buffer_size: cli.buffer_size.unwrap_or(limits.buffer_size),
            read_timeout: Duration::from_millis(
                cli.read_timeout.unwrap_or(limits.read_timeout_ms),
            ),
            write_timeout: Duration::from_millis(
                cli.write_timeout.unwrap_or(limits.write_timeout_ms),
            ),
            max_accept_failures: limits.max_accept_failures,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be at least 1"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }
        Ok(())
    }
}

impl CliArgs {
    fn empty() -> Self {
        Self {
            config: None,
            listen: None,
            max_connections: None,
            buffer_size: None,
            read_timeout: None,
            write_timeout: None,
            workers: None,
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
