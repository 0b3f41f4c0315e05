//! Environment-driven configuration.
//!
//! Every variable is optional with a stated default; malformed values are
//! startup errors so a misconfigured daemon exits non-zero instead of
//! running with surprising settings. Durations accept humantime strings
//! ("30s", "5m").

use std::time::Duration;

use thiserror::Error;

use crate::breaker::BreakerConfig;
use crate::webhook::WebhookConfig;

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host (`ADE_HOST`, default `0.0.0.0`).
    pub host: String,
    /// Bind port (`ADE_PORT`, default `8080`).
    pub port: u16,
    /// Graceful-shutdown drain window (`ADE_SHUTDOWN_TIMEOUT`, default 5s).
    pub shutdown_timeout: Duration,
}

/// Storage settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// SQLite path, or `:memory:` (`DATABASE_URL`, default `ade.db`).
    pub url: String,
}

/// Feature-derivation settings.
#[derive(Debug, Clone)]
pub struct FeatureConfig {
    /// Rolling window length (`FEATURE_WINDOW_SIZE`, default 5m).
    pub window: Duration,
    /// Maximum events fetched per derivation.
    pub max_events: u32,
}

/// Simulation settings.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Default iteration count (`SIMULATION_DEFAULT_ITERATIONS`, default 1000).
    pub default_iterations: u32,
    /// Iteration ceiling (`SIMULATION_MAX_ITERATIONS`, default 10000).
    pub max_iterations: u32,
}

/// Action-runtime settings.
#[derive(Debug, Clone)]
pub struct ActionConfig {
    /// Per-attempt webhook timeout (`ACTION_WEBHOOK_TIMEOUT`, default 30s).
    pub webhook_timeout: Duration,
    /// Additional delivery attempts (`ACTION_MAX_RETRIES`, default 3).
    pub max_retries: u32,
    /// Default destination when a request carries none
    /// (`ACTION_WEBHOOK_URL`, no default).
    pub default_webhook_url: Option<String>,
}

/// Logging settings.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter directive (`ADE_LOG_LEVEL`, default `info`).
    pub level: String,
    /// `json` or `pretty` (`ADE_LOG_FORMAT`, default `json`).
    pub format: LogFormat,
}

/// Log output format closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Machine-readable JSON lines.
    Json,
    /// Human-readable output.
    Pretty,
}

/// The full daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Storage settings.
    pub database: DatabaseConfig,
    /// External cache endpoint, handed to the cache collaborator
    /// (`REDIS_URL`, no default).
    pub redis_url: Option<String>,
    /// Event-log brokers, handed to the publisher collaborator
    /// (`KAFKA_BROKERS`, no default).
    pub kafka_brokers: Vec<String>,
    /// Feature-derivation settings.
    pub features: FeatureConfig,
    /// Simulation settings.
    pub simulation: SimulationConfig,
    /// Action-runtime settings.
    pub action: ActionConfig,
    /// Circuit-breaker settings (`CB_MAX_FAILURES`, `CB_RESET_TIMEOUT`).
    pub breaker: BreakerConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Configuration errors; all fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable's value does not parse.
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        /// The environment variable.
        var: &'static str,
        /// The raw value.
        value: String,
        /// Parser detail.
        reason: String,
    },
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for any malformed value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Loads configuration through an arbitrary lookup, for tests.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for any malformed value.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let breaker_defaults = BreakerConfig::default();

        Ok(Self {
            server: ServerConfig {
                host: string_var(&lookup, "ADE_HOST", "0.0.0.0"),
                port: parse_var(&lookup, "ADE_PORT", 8080)?,
                shutdown_timeout: duration_var(
                    &lookup,
                    "ADE_SHUTDOWN_TIMEOUT",
                    Duration::from_secs(5),
                )?,
            },
            database: DatabaseConfig {
                url: string_var(&lookup, "DATABASE_URL", "ade.db"),
            },
            redis_url: lookup("REDIS_URL").filter(|v| !v.is_empty()),
            kafka_brokers: lookup("KAFKA_BROKERS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|b| !b.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            features: FeatureConfig {
                window: duration_var(
                    &lookup,
                    "FEATURE_WINDOW_SIZE",
                    Duration::from_secs(5 * 60),
                )?,
                max_events: 1000,
            },
            simulation: SimulationConfig {
                default_iterations: parse_var(&lookup, "SIMULATION_DEFAULT_ITERATIONS", 1000)?,
                max_iterations: parse_var(&lookup, "SIMULATION_MAX_ITERATIONS", 10_000)?,
            },
            action: ActionConfig {
                webhook_timeout: duration_var(
                    &lookup,
                    "ACTION_WEBHOOK_TIMEOUT",
                    Duration::from_secs(30),
                )?,
                max_retries: parse_var(&lookup, "ACTION_MAX_RETRIES", 3)?,
                default_webhook_url: lookup("ACTION_WEBHOOK_URL").filter(|v| !v.is_empty()),
            },
            breaker: BreakerConfig {
                max_failures: parse_var(&lookup, "CB_MAX_FAILURES", breaker_defaults.max_failures)?,
                reset_timeout: duration_var(
                    &lookup,
                    "CB_RESET_TIMEOUT",
                    breaker_defaults.reset_timeout,
                )?,
                half_open_max_calls: breaker_defaults.half_open_max_calls,
            },
            logging: LoggingConfig {
                level: string_var(&lookup, "ADE_LOG_LEVEL", "info"),
                format: match string_var(&lookup, "ADE_LOG_FORMAT", "json").as_str() {
                    "pretty" | "text" => LogFormat::Pretty,
                    _ => LogFormat::Json,
                },
            },
        })
    }

    /// The webhook client settings implied by the action section.
    #[must_use]
    pub fn webhook(&self) -> WebhookConfig {
        WebhookConfig {
            timeout: self.action.webhook_timeout,
            max_retries: self.action.max_retries,
            ..WebhookConfig::default()
        }
    }
}

fn string_var(lookup: &impl Fn(&str) -> Option<String>, var: &str, default: &str) -> String {
    lookup(var)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn duration_var(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match lookup(var).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => humantime::parse_duration(&raw).map_err(|e| ConfigError::Invalid {
            var,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.database.url, "ade.db");
        assert_eq!(config.features.window, Duration::from_secs(300));
        assert_eq!(config.simulation.default_iterations, 1000);
        assert_eq!(config.simulation.max_iterations, 10_000);
        assert_eq!(config.action.webhook_timeout, Duration::from_secs(30));
        assert_eq!(config.action.max_retries, 3);
        assert_eq!(config.breaker.max_failures, 5);
        assert_eq!(config.breaker.reset_timeout, Duration::from_secs(30));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_overrides() {
        let lookup = lookup_from(&[
            ("ADE_PORT", "9090"),
            ("ADE_LOG_FORMAT", "pretty"),
            ("FEATURE_WINDOW_SIZE", "2m"),
            ("ACTION_MAX_RETRIES", "1"),
            ("CB_RESET_TIMEOUT", "1h"),
            ("KAFKA_BROKERS", "k1:9092, k2:9092"),
        ]);
        let config = Config::from_lookup(lookup).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.features.window, Duration::from_secs(120));
        assert_eq!(config.action.max_retries, 1);
        assert_eq!(config.breaker.reset_timeout, Duration::from_secs(3600));
        assert_eq!(config.kafka_brokers, vec!["k1:9092", "k2:9092"]);
    }

    #[test]
    fn test_malformed_values_are_fatal() {
        let lookup = lookup_from(&[("ADE_PORT", "not-a-port")]);
        assert!(Config::from_lookup(lookup).is_err());

        let lookup = lookup_from(&[("ACTION_WEBHOOK_TIMEOUT", "half a minute")]);
        assert!(Config::from_lookup(lookup).is_err());
    }
}
