//! Runtime configuration.
//!
//! Values come from serde (defaults per field) or from the environment via
//! [`ConsoleConfig::from_env`].

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the console runtime and its binary.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleConfig {
    /// Listen address (e.g., "0.0.0.0:8080").
    #[serde(default = "ConsoleConfig::default_listen_addr")]
    pub listen_addr: String,

    /// Absolute lifetime of a database session in seconds.
    #[serde(default = "ConsoleConfig::default_session_ttl")]
    pub session_ttl_seconds: u64,

    /// Period of the expired-session sweep in seconds.
    #[serde(default = "ConsoleConfig::default_reaper_interval")]
    pub reaper_interval_seconds: u64,

    /// Number of finished operations kept for status polling.
    #[serde(default = "ConsoleConfig::default_max_history")]
    pub max_operation_history: usize,

    /// How long shutdown waits for the in-flight operation.
    #[serde(default = "ConsoleConfig::default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,

    /// Upper bound on closing a single database connection.
    #[serde(default = "ConsoleConfig::default_close_timeout")]
    pub close_timeout_seconds: u64,

    /// Base URL of the Atlas Administration API.
    #[serde(default = "ConsoleConfig::default_atlas_base_url")]
    pub atlas_base_url: String,

    /// Bearer token for the Atlas Administration API.
    #[serde(default)]
    pub atlas_access_token: Option<String>,
}

impl ConsoleConfig {
    fn default_listen_addr() -> String {
        "0.0.0.0:8080".to_string()
    }

    const fn default_session_ttl() -> u64 {
        3600 // 1 hour
    }

    const fn default_reaper_interval() -> u64 {
        300 // 5 minutes
    }

    const fn default_max_history() -> usize {
        500
    }

    const fn default_shutdown_grace() -> u64 {
        30
    }

    const fn default_close_timeout() -> u64 {
        10
    }

    fn default_atlas_base_url() -> String {
        "https://cloud.mongodb.com/api/atlas/v2".to_string()
    }

    /// Build a configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("LISTEN_ADDR") {
            config.listen_addr = val;
        }
        if let Ok(val) = std::env::var("SESSION_TTL_SECONDS") {
            if let Ok(n) = val.parse() {
                config.session_ttl_seconds = n;
            }
        }
        if let Ok(val) = std::env::var("SESSION_REAPER_INTERVAL_SECONDS") {
            if let Ok(n) = val.parse() {
                config.reaper_interval_seconds = n;
            }
        }
        if let Ok(val) = std::env::var("OPERATION_HISTORY_LIMIT") {
            if let Ok(n) = val.parse() {
                config.max_operation_history = n;
            }
        }
        if let Ok(val) = std::env::var("SHUTDOWN_GRACE_SECONDS") {
            if let Ok(n) = val.parse() {
                config.shutdown_grace_seconds = n;
            }
        }
        if let Ok(val) = std::env::var("SESSION_CLOSE_TIMEOUT_SECONDS") {
            if let Ok(n) = val.parse() {
                config.close_timeout_seconds = n;
            }
        }
        if let Ok(val) = std::env::var("ATLAS_BASE_URL") {
            config.atlas_base_url = val;
        }
        config.atlas_access_token = std::env::var("ATLAS_ACCESS_TOKEN")
            .ok()
            .filter(|token| !token.is_empty());

        config
    }

    /// Session lifetime as a `Duration`.
    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }

    /// Reaper period as a `Duration`. Never zero.
    #[must_use]
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_seconds.max(1))
    }

    /// Shutdown grace period as a `Duration`.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    /// Connection close bound as a `Duration`.
    #[must_use]
    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_seconds)
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            listen_addr: Self::default_listen_addr(),
            session_ttl_seconds: Self::default_session_ttl(),
            reaper_interval_seconds: Self::default_reaper_interval(),
            max_operation_history: Self::default_max_history(),
            shutdown_grace_seconds: Self::default_shutdown_grace(),
            close_timeout_seconds: Self::default_close_timeout(),
            atlas_base_url: Self::default_atlas_base_url(),
            atlas_access_token: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ConsoleConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.session_ttl_seconds, 3600);
        assert_eq!(config.reaper_interval_seconds, 300);
        assert_eq!(config.max_operation_history, 500);
        assert!(config.atlas_access_token.is_none());
    }

    #[test]
    fn durations() {
        let config = ConsoleConfig::default();
        assert_eq!(config.session_ttl(), Duration::from_secs(3600));
        assert_eq!(config.reaper_interval(), Duration::from_secs(300));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(30));
        assert_eq!(config.close_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn zero_reaper_interval_is_clamped() {
        let config = ConsoleConfig {
            reaper_interval_seconds: 0,
            ..ConsoleConfig::default()
        };
        assert_eq!(config.reaper_interval(), Duration::from_secs(1));
    }

    #[test]
    fn deserialize_fills_defaults() {
        let config: ConsoleConfig =
            serde_json::from_str(r#"{"session_ttl_seconds": 60}"#).unwrap();
        assert_eq!(config.session_ttl_seconds, 60);
        assert_eq!(config.reaper_interval_seconds, 300);
        assert_eq!(
            config.atlas_base_url,
            "https://cloud.mongodb.com/api/atlas/v2"
        );
    }
}
