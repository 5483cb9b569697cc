//! Application configuration management.
//!
//! This module handles loading configuration from environment variables.
//! It uses the `envy` crate to deserialize environment variables into a type-safe struct,
//! then validates the few string-typed settings that select a policy.

use std::time::Duration;

use serde::Deserialize;

use crate::services::gateway::ChargePolicy;
use crate::services::usage_recorder::UsageLogMode;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Application configuration loaded from environment variables.
///
/// # Environment Variables
///
/// - `DATABASE_URL` (optional): PostgreSQL connection string. Without it the service
///   runs on the in-process store.
/// - `SERVER_PORT` (optional): HTTP server port, defaults to 3000
/// - `APP_ENV` (optional): `development` or `production` (default)
///
/// The remaining variables tune the gateway; see the field docs.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_port")]
    pub server_port: u16,

    #[serde(default = "default_app_env")]
    pub app_env: String,

    /// Name of the cookie carrying the session token.
    #[serde(default = "default_session_cookie_name")]
    pub session_cookie_name: String,

    #[serde(default = "default_session_ttl_days")]
    pub session_ttl_days: i64,

    /// API keys are `<prefix>_<64 hex chars>`.
    #[serde(default = "default_api_key_prefix")]
    pub api_key_prefix: String,

    #[serde(default = "default_max_api_keys")]
    pub max_api_keys_per_user: usize,

    /// Timeout applied to every store call made by the gateway.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// `pay_to_attempt` or `pay_on_success`.
    #[serde(default = "default_charge_policy")]
    pub charge_policy: String,

    /// `await` or `detached`.
    #[serde(default = "default_usage_log_mode")]
    pub usage_log_mode: String,

    #[serde(default = "default_rate_limit_gc_interval_secs")]
    pub rate_limit_gc_interval_secs: u64,

    /// Raw key accepted by the test identity provider. Needs `demo_user_email` too.
    #[serde(default)]
    pub demo_api_key: Option<String>,

    #[serde(default)]
    pub demo_user_email: Option<String>,

    #[serde(default = "default_simulated_latency_ms")]
    pub simulated_latency_ms: u64,

    /// Share of `GET /api/demo` requests that fail on purpose, between 0 and 1.
    #[serde(default = "default_demo_error_rate")]
    pub demo_error_rate: f64,

    #[serde(default = "default_shutdown_drain_secs")]
    pub shutdown_drain_secs: u64,
}

/// Default port if SERVER_PORT environment variable is not set.
fn default_port() -> u16 {
    3000
}

fn default_app_env() -> String {
    "production".to_string()
}

fn default_session_cookie_name() -> String {
    "session".to_string()
}

fn default_session_ttl_days() -> i64 {
    7
}

fn default_api_key_prefix() -> String {
    "gis".to_string()
}

fn default_max_api_keys() -> usize {
    5
}

fn default_store_timeout_ms() -> u64 {
    5000
}

fn default_charge_policy() -> String {
    "pay_to_attempt".to_string()
}

fn default_usage_log_mode() -> String {
    "await".to_string()
}

fn default_rate_limit_gc_interval_secs() -> u64 {
    300
}

fn default_simulated_latency_ms() -> u64 {
    100
}

fn default_shutdown_drain_secs() -> u64 {
    10
}

fn default_demo_error_rate() -> f64 {
    0.1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            server_port: default_port(),
            app_env: default_app_env(),
            session_cookie_name: default_session_cookie_name(),
            session_ttl_days: default_session_ttl_days(),
            api_key_prefix: default_api_key_prefix(),
            max_api_keys_per_user: default_max_api_keys(),
            store_timeout_ms: default_store_timeout_ms(),
            charge_policy: default_charge_policy(),
            usage_log_mode: default_usage_log_mode(),
            rate_limit_gc_interval_secs: default_rate_limit_gc_interval_secs(),
            demo_api_key: None,
            demo_user_email: None,
            simulated_latency_ms: default_simulated_latency_ms(),
            demo_error_rate: default_demo_error_rate(),
            shutdown_drain_secs: default_shutdown_drain_secs(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// This method first attempts to load a `.env` file (which is optional),
    /// then reads environment variables and deserializes them into a Config struct.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Environment variable values cannot be parsed into expected types
    /// - A policy selector (`CHARGE_POLICY`, `USAGE_LOG_MODE`, `APP_ENV`) has an unknown value
    pub fn from_env() -> Result<Self, ConfigError> {
        // Try to load .env file if it exists (does nothing if not found)
        dotenvy::dotenv().ok();

        // Field names are automatically converted: database_url -> DATABASE_URL
        let config = envy::from_env::<Config>()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject unknown policy selectors up front so a typo never silently changes billing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.charge_policy()?;
        self.usage_log_mode()?;
        if !matches!(self.app_env.as_str(), "development" | "production") {
            return Err(ConfigError::Invalid {
                name: "APP_ENV",
                value: self.app_env.clone(),
            });
        }
        if self.api_key_prefix.is_empty() || self.api_key_prefix.contains('_') {
            return Err(ConfigError::Invalid {
                name: "API_KEY_PREFIX",
                value: self.api_key_prefix.clone(),
            });
        }
        if !(0.0..=1.0).contains(&self.demo_error_rate) {
            return Err(ConfigError::Invalid {
                name: "DEMO_ERROR_RATE",
                value: self.demo_error_rate.to_string(),
            });
        }
        Ok(())
    }

    pub fn is_development(&self) -> bool {
        self.app_env == "development"
    }

    pub fn charge_policy(&self) -> Result<ChargePolicy, ConfigError> {
        match self.charge_policy.as_str() {
            "pay_to_attempt" => Ok(ChargePolicy::PayToAttempt),
            "pay_on_success" => Ok(ChargePolicy::PayOnSuccess),
            other => Err(ConfigError::Invalid {
                name: "CHARGE_POLICY",
                value: other.to_string(),
            }),
        }
    }

    pub fn usage_log_mode(&self) -> Result<UsageLogMode, ConfigError> {
        match self.usage_log_mode.as_str() {
            "await" => Ok(UsageLogMode::Await),
            "detached" => Ok(UsageLogMode::Detached),
            other => Err(ConfigError::Invalid {
                name: "USAGE_LOG_MODE",
                value: other.to_string(),
            }),
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// The test identity provider is only enabled when both demo settings are present.
    pub fn demo_identity(&self) -> Option<(&str, &str)> {
        match (&self.demo_api_key, &self.demo_user_email) {
            (Some(key), Some(email)) if !key.is_empty() && !email.is_empty() => {
                Some((key.as_str(), email.as_str()))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.charge_policy().unwrap(), ChargePolicy::PayToAttempt);
        assert_eq!(config.usage_log_mode().unwrap(), UsageLogMode::Await);
        assert!(!config.is_development());
        assert!(config.demo_identity().is_none());
    }

    #[test]
    fn unknown_charge_policy_is_rejected() {
        let config = Config {
            charge_policy: "free_for_all".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { name: "CHARGE_POLICY", .. })
        ));
    }

    #[test]
    fn prefix_with_separator_is_rejected() {
        let config = Config {
            api_key_prefix: "gis_live".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn demo_error_rate_must_be_a_share() {
        let config = Config {
            demo_error_rate: 1.5,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                name: "DEMO_ERROR_RATE",
                ..
            })
        ));
    }

    #[test]
    fn demo_identity_needs_both_settings() {
        let config = Config {
            demo_api_key: Some("gis_demo".to_string()),
            ..Config::default()
        };
        assert!(config.demo_identity().is_none());

        let config = Config {
            demo_api_key: Some("gis_demo".to_string()),
            demo_user_email: Some("demo@example.com".to_string()),
            ..Config::default()
        };
        assert_eq!(
            config.demo_identity(),
            Some(("gis_demo", "demo@example.com"))
        );
    }
}
