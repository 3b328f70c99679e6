//! Configuration module for the peer endpoint.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the endpoint
#[derive(Parser, Debug)]
#[command(name = "endpoint")]
#[command(version = "0.1.0")]
#[command(about = "A peer-to-peer message endpoint", long_about = None)]
pub struct CliArgs {
    /// Port to listen on
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host address for listening and outbound connections
    #[arg(long)]
    pub host: Option<String>,

    /// Maximum accepted message payload in bytes
    #[arg(short = 'm', long)]
    pub max_message: Option<usize>,

    /// Event loop wakeup interval in milliseconds
    #[arg(long)]
    pub tick_ms: Option<u64>,

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
    pub messages: MessageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: Option<u16>,
    /// Host address for listening and outbound connections
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: None,
            host: default_host(),
        }
    }
}

/// Message handling configuration
#[derive(Debug, Deserialize)]
pub struct MessageConfig {
    /// Maximum accepted message payload in bytes
    #[serde(default = "default_max_message")]
    pub max_message: usize,
    /// Event loop wakeup interval in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            max_message: default_max_message(),
            tick_ms: default_tick_ms(),
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_max_message() -> usize {
    255
}

fn default_tick_ms() -> u64 {
    250
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: String,
    pub max_message: usize,
    pub tick_ms: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::resolve(cli)
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let port = cli
            .port
            .or(toml_config.server.port)
            .ok_or(ConfigError::MissingPort)?;

        // Merge CLI args with TOML config (CLI takes precedence)
        Ok(Config {
            port,
            host: cli.host.unwrap_or(toml_config.server.host),
            max_message: cli
                .max_message
                .unwrap_or(toml_config.messages.max_message),
            tick_ms: cli.tick_ms.unwrap_or(toml_config.messages.tick_ms),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    MissingPort,
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingPort => {
                write!(f, "No listen port given on the command line or in a config file")
            }
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("endpoint").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.port, None);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.messages.max_message, 255);
        assert_eq!(config.messages.tick_ms, 250);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            port = 20001
            host = "0.0.0.0"

            [messages]
            max_message = 1024
            tick_ms = 100

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, Some(20001));
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.messages.max_message, 1024);
        assert_eq!(config.messages.tick_ms, 100);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_port_argument_is_required() {
        let err = Config::resolve(cli(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingPort));
    }

    #[test]
    fn test_positional_port_resolves() {
        let config = Config::resolve(cli(&["20100"])).unwrap();
        assert_eq!(config.port, 20100);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.max_message, 255);
        assert_eq!(config.log_level, "info");
    }
}
