//! Configuration for the dispatch engine
//!
//! A single serde-deserializable `Config` struct with sensible defaults,
//! loadable from TOML. Durations are stored as integer seconds or
//! milliseconds so config files stay plain; typed accessors hand out
//! `std::time::Duration`.

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Development mode: plain HTTP, no canonical-host enforcement,
    /// insecure cookies, statics served from disk
    pub dev_mode: bool,

    /// Canonical host to redirect web traffic onto (e.g. "example.com").
    /// When unset no host enforcement happens.
    pub canonical_host: Option<String>,

    /// Server listening address
    pub host: String,

    /// Server listening port
    pub port: u16,

    /// Lifetime of session cookies, in seconds.
    /// Default: 14 days
    pub cookie_duration_secs: u64,

    /// Lifetime of freshly signed tokens, in seconds.
    /// Default: 1 day
    pub token_duration_secs: u64,

    /// Overall deadline for a single request, in milliseconds
    pub request_timeout_ms: u64,

    /// Per-call bound for direct (non-transactional) datastore calls,
    /// in milliseconds
    pub datastore_timeout_ms: u64,

    /// Deadline for one transaction attempt, in milliseconds
    pub transaction_timeout_ms: u64,

    /// Deadline for queue topic/subscription provisioning, in milliseconds
    pub queue_init_timeout_ms: u64,

    /// Shared secret guarding the queue provisioning endpoint, as hex
    pub queue_init_key: String,

    /// Header the platform sets on genuine cron invocations. Trusted
    /// because the platform strips it from external traffic.
    pub cron_header: String,

    /// Header the platform sets on task-queue invocations
    pub task_header: String,

    /// Where to send unauthenticated users of non-anonymous routes.
    /// When unset those requests get a 404.
    pub login_url: Option<String>,

    /// User ids granted admin routes
    pub admin_user_ids: Vec<i64>,

    /// Directory statics are read from in dev mode
    pub static_dir: String,

    /// Maximum accepted request body size in bytes
    pub max_body_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dev_mode: false,
            canonical_host: None,
            host: "127.0.0.1".to_string(),
            port: 8080,
            cookie_duration_secs: 14 * 24 * 60 * 60,
            token_duration_secs: 24 * 60 * 60,
            request_timeout_ms: 30_000,
            datastore_timeout_ms: 10_000,
            transaction_timeout_ms: 20_000,
            queue_init_timeout_ms: 30_000,
            queue_init_key: String::new(),
            cron_header: "x-appengine-cron".to_string(),
            task_header: "x-appengine-queuename".to_string(),
            login_url: None,
            admin_user_ids: Vec::new(),
            static_dir: "static".to_string(),
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Parse a config from a TOML string
    pub fn from_toml(input: &str) -> Result<Self> {
        toml::from_str(input).context("failed to parse config TOML")
    }

    /// Whether requests must be addressed to the canonical host
    pub fn ensure_host(&self) -> bool {
        self.canonical_host.is_some()
    }

    pub fn cookie_duration(&self) -> Duration {
        Duration::from_secs(self.cookie_duration_secs)
    }

    /// Cookie Max-Age in whole seconds
    pub fn cookie_seconds(&self) -> i64 {
        self.cookie_duration_secs as i64
    }

    pub fn token_duration(&self) -> Duration {
        Duration::from_secs(self.token_duration_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn datastore_timeout(&self) -> Duration {
        Duration::from_millis(self.datastore_timeout_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn queue_init_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_init_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(!config.dev_mode);
        assert!(!config.ensure_host());
        assert_eq!(config.cookie_seconds(), 14 * 24 * 60 * 60);
        assert_eq!(config.datastore_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn parses_partial_toml() {
        let config = Config::from_toml(
            r#"
            dev_mode = true
            canonical_host = "example.com"
            request_timeout_ms = 5000
            "#,
        )
        .unwrap();
        assert!(config.dev_mode);
        assert!(config.ensure_host());
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        // Unspecified fields keep their defaults.
        assert_eq!(config.port, 8080);
    }
}
