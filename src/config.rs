//! Configuration module for the packetlog server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the packet log server
#[derive(Parser, Debug)]
#[command(name = "packetlog")]
#[command(author = "packetlog authors")]
#[command(version = "0.1.0")]
#[command(
    about = "Appends newline-delimited packets to a shared log and replays it to the sender",
    long_about = None
)]
pub struct CliArgs {
    /// Run in the background, detached from the terminal
    #[arg(short, long)]
    pub daemon: bool,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to (defaults to every local interface)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Path of the packet log file
    #[arg(long)]
    pub log_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Write diagnostics to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log_store: LogStoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to; unset binds every local interface
    pub listen: Option<String>,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Bytes requested per socket read
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// How long shutdown waits for connections to finish, in milliseconds
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: None,
            port: default_port(),
            backlog: default_backlog(),
            read_buffer_size: default_read_buffer_size(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

/// Packet log configuration
#[derive(Debug, Deserialize)]
pub struct LogStoreConfig {
    /// Path of the log file
    #[serde(default = "default_log_path")]
    pub path: PathBuf,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file
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

fn default_port() -> u16 {
    9000
}

fn default_backlog() -> i32 {
    10
}

fn default_read_buffer_size() -> usize {
    2048
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/var/tmp/aesdsocketdata")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub daemon: bool,
    pub listen: Option<String>,
    pub port: u16,
    pub backlog: i32,
    pub read_buffer_size: usize,
    pub drain_timeout: Duration,
    pub log_path: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let log_path = cli.log_path.unwrap_or(toml_config.log_store.path);
        // Daemon mode changes the working directory before the log is removed.
        let log_path = std::path::absolute(&log_path)
            .map_err(|e| ConfigError::LogPath(log_path.clone(), e))?;

        Ok(Config {
            daemon: cli.daemon,
            listen: cli.listen.or(toml_config.server.listen),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: toml_config.server.backlog,
            read_buffer_size: toml_config.server.read_buffer_size.max(1),
            drain_timeout: Duration::from_millis(toml_config.server.drain_timeout_ms),
            log_path,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            log_file: cli.log_file.or(toml_config.logging.file),
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    LogPath(PathBuf, std::io::Error),
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
            ConfigError::LogPath(path, e) => {
                write!(f, "Invalid log path '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
