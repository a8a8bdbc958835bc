//! Configuration types for the Crimson daemon
//!
//! The daemon reads an optional TOML file; command line flags take
//! precedence over file values.

use serde::Deserialize;
use std::path::PathBuf;

/// Root configuration for the OSD process
#[derive(Debug, Deserialize, Default)]
pub struct OsdConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network and worker configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Bind address; empty string means all interfaces
    #[serde(default)]
    pub address: String,
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to the cluster OsdMap file
    #[serde(default)]
    pub map: Option<PathBuf>,
    /// Worker core count; defaults to available parallelism
    #[serde(default)]
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: default_port(),
            map: None,
            workers: None,
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

fn default_port() -> u16 {
    6800
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = OsdConfig::default();
        assert_eq!(cfg.server.port, 6800);
        assert!(cfg.server.address.is_empty());
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_partial_file() {
        let cfg: OsdConfig = toml::from_str(
            r#"
            [server]
            port = 7000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 7000);
        assert!(cfg.server.map.is_none());
        assert_eq!(cfg.logging.level, "info");
    }
}
