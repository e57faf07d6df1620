use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub auth_clock_skew: Duration,
    pub rate_limit_window: Duration,
    pub push_rate_limit_per_window: u32,
    pub pull_rate_limit_per_window: u32,
    /// Change-log entries retained per tenant before pulls report
    /// `cursor_lost` and clients fall back to snapshots.
    pub changelog_retention: usize,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("jwt_secret", &"[REDACTED]")
            .field("jwt_issuer", &self.jwt_issuer)
            .field("auth_clock_skew", &self.auth_clock_skew)
            .field("rate_limit_window", &self.rate_limit_window)
            .field(
                "push_rate_limit_per_window",
                &self.push_rate_limit_per_window,
            )
            .field(
                "pull_rate_limit_per_window",
                &self.pull_rate_limit_per_window,
            )
            .field("changelog_retention", &self.changelog_retention)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "SILT_API_BIND_ADDR", "127.0.0.1:8080");

        let jwt_secret = required_trimmed(&lookup, "SILT_JWT_SECRET")?;
        if jwt_secret.len() < 32 {
            return Err(ConfigError::Invalid(
                "SILT_JWT_SECRET must be at least 32 bytes".to_string(),
            ));
        }
        let jwt_issuer = value_or_default(&lookup, "SILT_JWT_ISSUER", "silt-api");

        let auth_clock_skew_secs = value_or_default(&lookup, "AUTH_CLOCK_SKEW_SECS", "60")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid("AUTH_CLOCK_SKEW_SECS must be an integer in [0, 300]".to_string())
            })?;
        if auth_clock_skew_secs > 300 {
            return Err(ConfigError::Invalid(
                "AUTH_CLOCK_SKEW_SECS must be in [0, 300]".to_string(),
            ));
        }

        let rate_limit_window_secs = value_or_default(&lookup, "RATE_LIMIT_WINDOW_SECS", "60")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "RATE_LIMIT_WINDOW_SECS must be an integer in [10, 3600]".to_string(),
                )
            })?;
        if !(10..=3_600).contains(&rate_limit_window_secs) {
            return Err(ConfigError::Invalid(
                "RATE_LIMIT_WINDOW_SECS must be in [10, 3600]".to_string(),
            ));
        }

        let push_rate_limit_per_window =
            value_or_default(&lookup, "SYNC_PUSH_RATE_LIMIT_PER_WINDOW", "600")
                .parse::<u32>()
                .map_err(|_| {
                    ConfigError::Invalid(
                        "SYNC_PUSH_RATE_LIMIT_PER_WINDOW must be an integer in [1, 10000]"
                            .to_string(),
                    )
                })?;
        if !(1..=10_000).contains(&push_rate_limit_per_window) {
            return Err(ConfigError::Invalid(
                "SYNC_PUSH_RATE_LIMIT_PER_WINDOW must be in [1, 10000]".to_string(),
            ));
        }

        let pull_rate_limit_per_window =
            value_or_default(&lookup, "SYNC_PULL_RATE_LIMIT_PER_WINDOW", "240")
                .parse::<u32>()
                .map_err(|_| {
                    ConfigError::Invalid(
                        "SYNC_PULL_RATE_LIMIT_PER_WINDOW must be an integer in [1, 10000]"
                            .to_string(),
                    )
                })?;
        if !(1..=10_000).contains(&pull_rate_limit_per_window) {
            return Err(ConfigError::Invalid(
                "SYNC_PULL_RATE_LIMIT_PER_WINDOW must be in [1, 10000]".to_string(),
            ));
        }

        let changelog_retention = value_or_default(&lookup, "CHANGELOG_RETENTION", "10000")
            .parse::<usize>()
            .map_err(|_| {
                ConfigError::Invalid("CHANGELOG_RETENTION must be an integer >= 100".to_string())
            })?;
        if changelog_retention < 100 {
            return Err(ConfigError::Invalid(
                "CHANGELOG_RETENTION must be >= 100".to_string(),
            ));
        }

        Ok(Self {
            bind_addr,
            jwt_secret,
            jwt_issuer,
            auth_clock_skew: Duration::from_secs(auth_clock_skew_secs),
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            push_rate_limit_per_window,
            pull_rate_limit_per_window,
            changelog_retention,
        })
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}


#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn base_env() -> HashMap<&'static str, &'static str> {
        let mut map = HashMap::new();
        map.insert(
            "SILT_JWT_SECRET",
            "0123456789abcdef0123456789abcdef-test",
        );
        map
    }

    #[test]
    fn config_requires_jwt_secret() {
        let map: HashMap<&str, &str> = HashMap::new();
        let err = AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("SILT_JWT_SECRET"));
    }

    #[test]
    fn config_rejects_short_secret() {
        let mut map = base_env();
        map.insert("SILT_JWT_SECRET", "short");
        let err = AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("at least 32 bytes"));
    }

    #[test]
    fn config_redacts_secret_in_debug() {
        let map = base_env();
        let config =
            AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string())).unwrap();
        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("0123456789abcdef"));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn config_applies_defaults() {
        let map = base_env();
        let config =
            AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string())).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.jwt_issuer, "silt-api");
        assert_eq!(config.push_rate_limit_per_window, 600);
        assert_eq!(config.changelog_retention, 10_000);
    }
}
