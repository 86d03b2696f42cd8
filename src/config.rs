//! Configuration loading and validation.
//!
//! Configuration comes from a YAML file (path given as the first CLI
//! argument, `config.yaml` by default). A missing file falls back to
//! defaults; `LB_LISTEN_ADDR` overrides the listen address. Everything
//! here is static for the process lifetime; only per-client limits can
//! change at runtime, through the admin API.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the server binds. A bare `":port"` form is accepted and
    /// normalized to `0.0.0.0:port`.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Upstream URLs. Must be non-empty.
    #[serde(default)]
    pub backends: Vec<String>,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_health_check_timeout_secs")]
    pub health_check_timeout_secs: u64,
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_capacity")]
    pub default_capacity: i64,
    #[serde(default = "default_refill_rate")]
    pub default_refill_rate: f64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Optional backing store for custom per-client limits.
    #[serde(default)]
    pub db: Option<DbConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    pub driver: String,
    pub path: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_health_check_interval_secs() -> u64 {
    10
}

fn default_health_check_timeout_secs() -> u64 {
    2
}

fn default_capacity() -> i64 {
    10
}

fn default_refill_rate() -> f64 {
    1.0
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            backends: Vec::new(),
            health_check_interval_secs: default_health_check_interval_secs(),
            health_check_timeout_secs: default_health_check_timeout_secs(),
            rate_limiter: RateLimiterConfig::default(),
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_capacity: default_capacity(),
            default_refill_rate: default_refill_rate(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            db: None,
        }
    }
}

impl Config {
    /// Parses a configuration document without validating it.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("could not parse configuration as YAML")
    }

    /// Loads, normalizes, and validates configuration from `path`.
    ///
    /// A missing file is not an error (defaults apply, which validation
    /// will then reject for the empty backend list); a malformed file is.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => {
                let config = Self::from_yaml(&raw)
                    .with_context(|| format!("invalid config file '{path}'"))?;
                tracing::info!(path, "loaded configuration");
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path, "config file not found, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("could not read config file '{path}'"))
            }
        };

        if let Ok(addr) = std::env::var("LB_LISTEN_ADDR") {
            if !addr.is_empty() {
                config.listen_addr = addr;
            }
        }
        if config.listen_addr.starts_with(':') {
            config.listen_addr = format!("0.0.0.0{}", config.listen_addr);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            bail!("no backend servers configured");
        }
        if self.health_check_interval_secs == 0 {
            bail!("health_check_interval_secs must be positive");
        }
        if self.health_check_timeout_secs == 0 {
            bail!("health_check_timeout_secs must be positive");
        }
        if self.rate_limiter.enabled {
            if self.rate_limiter.default_capacity <= 0 {
                bail!("rate_limiter.default_capacity must be positive");
            }
            if self.rate_limiter.default_refill_rate <= 0.0 {
                bail!("rate_limiter.default_refill_rate must be positive");
            }
            if let Some(db) = &self.rate_limiter.db {
                if db.driver != "sqlite" {
                    bail!(
                        "unsupported rate_limiter.db.driver: {} (only 'sqlite' is supported)",
                        db.driver
                    );
                }
                if db.path.is_empty() {
                    bail!("rate_limiter.db.path must be specified when db.driver is set");
                }
            }
        }
        Ok(())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }
}

impl RateLimiterConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_to_omitted_fields() {
        let config = Config::from_yaml("backends: [\"http://localhost:8081\"]").unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.health_check_interval_secs, 10);
        assert_eq!(config.health_check_timeout_secs, 2);
        assert!(!config.rate_limiter.enabled);
        assert_eq!(config.rate_limiter.default_capacity, 10);
        assert_eq!(config.rate_limiter.default_refill_rate, 1.0);
        assert_eq!(config.rate_limiter.cleanup_interval_secs, 300);
        assert!(config.rate_limiter.db.is_none());
    }

    #[test]
    fn test_full_document_round_trips() {
        let config = Config::from_yaml(
            r#"
            listen_addr: "127.0.0.1:9090"
            backends:
              - "http://localhost:8081"
              - "http://localhost:8082"
            health_check_interval_secs: 5
            health_check_timeout_secs: 1
            rate_limiter:
              enabled: true
              default_capacity: 3
              default_refill_rate: 0.5
              cleanup_interval_secs: 60
              db:
                driver: "sqlite"
                path: "limits.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:9090");
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.health_check_interval(), Duration::from_secs(5));
        assert!(config.rate_limiter.enabled);
        assert_eq!(config.rate_limiter.default_capacity, 3);
        assert_eq!(config.rate_limiter.cleanup_interval(), Duration::from_secs(60));
        assert_eq!(config.rate_limiter.db.unwrap().driver, "sqlite");
    }

    #[test]
    fn test_validate_rejects_empty_backends() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("no backend servers"));
    }

    #[test]
    fn test_validate_rejects_non_positive_limits_when_enabled() {
        let mut config = Config::default();
        config.backends = vec!["http://localhost:8081".to_string()];
        config.rate_limiter.enabled = true;
        config.rate_limiter.default_capacity = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_db_driver() {
        let mut config = Config::default();
        config.backends = vec!["http://localhost:8081".to_string()];
        config.rate_limiter.enabled = true;
        config.rate_limiter.db = Some(DbConfig {
            driver: "postgres".to_string(),
            path: "limits.db".to_string(),
        });

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unsupported rate_limiter.db.driver"));
    }

    #[test]
    fn test_validate_requires_db_path_with_driver() {
        let mut config = Config::default();
        config.backends = vec!["http://localhost:8081".to_string()];
        config.rate_limiter.enabled = true;
        config.rate_limiter.db = Some(DbConfig {
            driver: "sqlite".to_string(),
            path: String::new(),
        });

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disabled_limiter_skips_limit_validation() {
        let mut config = Config::default();
        config.backends = vec!["http://localhost:8081".to_string()];
        config.rate_limiter.default_capacity = -1;

        assert!(config.validate().is_ok());
    }
}
