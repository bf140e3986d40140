//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// Prefix for environment variable overrides, e.g. `TURNSTILE__SERVER__LISTEN_ADDR`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Idle entry eviction
    #[serde(default)]
    pub cleanup: CleanupSettings,

    /// Path to the rate limit rules file
    #[serde(default)]
    pub rules_path: Option<String>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Idle entry eviction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupSettings {
    /// Seconds between sweeps
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,

    /// Seconds an entry may go unused before it is evicted
    #[serde(default = "default_entry_ttl")]
    pub ttl_secs: u64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            ttl_secs: default_entry_ttl(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_entry_ttl() -> u64 {
    600
}

impl CleanupSettings {
    /// Get the sweep interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Get the entry TTL.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Settings {
    /// Load settings from an optional YAML file, then apply environment
    /// overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
        }

        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cleanup.interval_secs == 0 {
            return Err(TurnstileError::Config(
                "cleanup.interval_secs must be non-zero".to_string(),
            ));
        }
        if self.cleanup.ttl_secs == 0 {
            return Err(TurnstileError::Config(
                "cleanup.ttl_secs must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(settings.logging.level, "info");
        assert_eq!(settings.logging.format, LogFormat::Text);
        assert_eq!(settings.cleanup.interval(), Duration::from_secs(60));
        assert_eq!(settings.cleanup.ttl(), Duration::from_secs(600));
        assert!(settings.rules_path.is_none());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
server:
  listen_addr: 0.0.0.0:9000
logging:
  format: json
rules_path: /etc/turnstile/rules.yaml
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.server.listen_addr.port(), 9000);
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert_eq!(settings.logging.level, "info");
        assert_eq!(settings.cleanup.ttl_secs, 600);
        assert_eq!(settings.rules_path.as_deref(), Some("/etc/turnstile/rules.yaml"));
    }

    #[test]
    fn test_zero_cleanup_rejected() {
        let yaml = r#"
cleanup:
  interval_secs: 0
"#;
        assert!(Settings::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir()
            .join(format!("turnstile-settings-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "cleanup:\n  interval_secs: 5\n  ttl_secs: 30\nlogging:\n  level: debug\n",
        )
        .unwrap();

        let settings = Settings::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(settings.cleanup.interval_secs, 5);
        assert_eq!(settings.cleanup.ttl_secs, 30);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn test_environment_overrides() {
        // Keys no other loading test asserts on, since the environment is shared
        std::env::set_var("TURNSTILE__SERVER__LISTEN_ADDR", "0.0.0.0:9999");
        std::env::set_var("TURNSTILE__LOGGING__FORMAT", "json");

        let settings = Settings::load(None);

        std::env::remove_var("TURNSTILE__SERVER__LISTEN_ADDR");
        std::env::remove_var("TURNSTILE__LOGGING__FORMAT");

        let settings = settings.unwrap();
        assert_eq!(settings.server.listen_addr, "0.0.0.0:9999".parse().unwrap());
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert_eq!(settings.cleanup.ttl_secs, 600);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(Settings::load(Some("/nonexistent/turnstile.yaml")).is_err());
    }
}
