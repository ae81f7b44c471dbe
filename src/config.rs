//! Configuration file parser for `feedsieve.toml`.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged as a warning, since they
//! are usually typos. The value is built once at startup and handed to the
//! scheduler, processor and API constructors.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::util::HostPolicy;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level service configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file
    pub database_path: PathBuf,

    /// TOML file with `[[source]]` definitions
    pub sources_path: PathBuf,

    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub fetch: FetchConfig,
    pub serve: ServeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("feedsieve.db"),
            sources_path: PathBuf::from("sources.toml"),
            server: ServerConfig::default(),
            scheduler: SchedulerConfig::default(),
            fetch: FetchConfig::default(),
            serve: ServeConfig::default(),
        }
    }
}

/// HTTP listener and admin authentication.
///
/// SEC-015: Custom Debug impl masks `admin_token` so it never reaches logs.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,

    /// Bearer token for `/admin` routes. Admin routes are disabled when unset.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            admin_token: None,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen", &self.listen)
            .field(
                "admin_token",
                &self.admin_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Longest fetch interval accepted for the global default and per source
/// (30 days).
pub const MAX_FETCH_INTERVAL_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the scheduler scans for due sources.
    pub tick_interval_secs: u64,

    /// Fetch interval for sources without their own `interval_secs`.
    pub fetch_interval_secs: u64,

    /// Number of concurrent processor runs.
    pub worker_count: usize,

    /// Bounded task queue between the ticker and the workers.
    pub queue_capacity: usize,

    /// How long `stop()` waits for in-flight runs.
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            fetch_interval_secs: 900,
            worker_count: 4,
            queue_capacity: 64,
            shutdown_grace_secs: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,

    /// Sent as `User-Agent` on every request.
    pub user_agent: String,

    /// Bodies larger than this are rejected.
    pub max_body_bytes: usize,

    /// Idle keep-alive connections kept per host.
    pub max_idle_per_host: usize,

    /// Permit source URLs on loopback or private addresses.
    pub allow_private_hosts: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: concat!("feedsieve/", env!("CARGO_PKG_VERSION")).to_string(),
            max_body_bytes: 10 * 1024 * 1024, // 10MB
            max_idle_per_host: 2,
            allow_private_hosts: false,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn host_policy(&self) -> HostPolicy {
        if self.allow_private_hosts {
            HostPolicy::Any
        } else {
            HostPolicy::PublicOnly
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// Maximum items in a rendered feed.
    pub max_items: usize,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self { max_items: 100 }
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::from_toml(&content)?;
        tracing::info!(
            path = %path.display(),
            workers = config.scheduler.worker_count,
            interval_secs = config.scheduler.fetch_interval_secs,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.scheduler.worker_count == 0, "scheduler.worker_count must be at least 1"),
            (self.scheduler.queue_capacity == 0, "scheduler.queue_capacity must be at least 1"),
            (self.scheduler.tick_interval_secs == 0, "scheduler.tick_interval_secs must be at least 1"),
            (
                self.scheduler.fetch_interval_secs > MAX_FETCH_INTERVAL_SECS,
                "scheduler.fetch_interval_secs must be at most 2592000 (30 days)",
            ),
            (self.fetch.timeout_secs == 0, "fetch.timeout_secs must be at least 1"),
            (self.fetch.user_agent.trim().is_empty(), "fetch.user_agent must not be empty"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(ConfigError::Invalid((*message).to_string())),
            None => Ok(()),
        }
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    const SECTIONS: [(&str, &[&str]); 4] = [
        ("server", &["listen", "admin_token"]),
        (
            "scheduler",
            &[
                "tick_interval_secs",
                "fetch_interval_secs",
                "worker_count",
                "queue_capacity",
                "shutdown_grace_secs",
            ],
        ),
        (
            "fetch",
            &[
                "timeout_secs",
                "user_agent",
                "max_body_bytes",
                "max_idle_per_host",
                "allow_private_hosts",
            ],
        ),
        ("serve", &["max_items"]),
    ];

    for (key, value) in raw {
        if key == "database_path" || key == "sources_path" {
            continue;
        }
        let Some((_, known)) = SECTIONS.iter().find(|(section, _)| *section == key.as_str()) else {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            continue;
        };
        if let Some(table) = value.as_table() {
            for inner in table.keys() {
                if !known.contains(&inner.as_str()) {
                    tracing::warn!(key = %format!("{}.{}", key, inner), "Unknown key in config file, ignoring");
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.scheduler.worker_count, 4);
        assert_eq!(config.scheduler.fetch_interval(), Duration::from_secs(900));
        assert_eq!(config.fetch.timeout(), Duration::from_secs(30));
        assert!(config.fetch.user_agent.starts_with("feedsieve/"));
        assert!(config.server.admin_token.is_none());
        assert_eq!(config.serve.max_items, 100);
        assert_eq!(config.fetch.host_policy(), HostPolicy::PublicOnly);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/feedsieve_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.scheduler.worker_count, 4);
    }

    #[test]
    fn test_empty_file_returns_default() {
        let dir = std::env::temp_dir().join("feedsieve_config_test_empty");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "   \n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8080");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let config = Config::from_toml("[scheduler]\nworker_count = 8\n").unwrap();
        assert_eq!(config.scheduler.worker_count, 8);
        assert_eq!(config.scheduler.queue_capacity, 64); // default
        assert_eq!(config.fetch.timeout_secs, 30); // default
    }

    #[test]
    fn test_full_config() {
        let content = r#"
database_path = "/var/lib/feedsieve/db.sqlite"
sources_path = "/etc/feedsieve/sources.toml"

[server]
listen = "0.0.0.0:9000"
admin_token = "s3cret"

[scheduler]
tick_interval_secs = 5
fetch_interval_secs = 60
worker_count = 2
queue_capacity = 10
shutdown_grace_secs = 3

[fetch]
timeout_secs = 15
user_agent = "custom-agent/2.0"
max_body_bytes = 2048
max_idle_per_host = 1
allow_private_hosts = true

[serve]
max_items = 25
"#;
        let config = Config::from_toml(content).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/var/lib/feedsieve/db.sqlite"));
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.admin_token.as_deref(), Some("s3cret"));
        assert_eq!(config.scheduler.tick_interval(), Duration::from_secs(5));
        assert_eq!(config.scheduler.shutdown_grace(), Duration::from_secs(3));
        assert_eq!(config.fetch.user_agent, "custom-agent/2.0");
        assert_eq!(config.fetch.max_body_bytes, 2048);
        assert_eq!(config.fetch.host_policy(), HostPolicy::Any);
        assert_eq!(config.serve.max_items, 25);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let err = Config::from_toml("this is not [valid toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let config = Config::from_toml("totally_fake_key = 1\n[scheduler]\nworkers = 3\n").unwrap();
        assert_eq!(config.scheduler.worker_count, 4);
    }

    #[test]
    fn test_huge_fetch_interval_rejected() {
        let err = Config::from_toml("[scheduler]\nfetch_interval_secs = 9223372036854775807\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("fetch_interval_secs"));

        let config = Config::from_toml("[scheduler]\nfetch_interval_secs = 2592000\n").unwrap();
        assert_eq!(config.scheduler.fetch_interval_secs, MAX_FETCH_INTERVAL_SECS);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = Config::from_toml("[scheduler]\nworker_count = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("worker_count"));
    }

    #[test]
    fn test_wrong_type_returns_error() {
        assert!(Config::from_toml("[scheduler]\nworker_count = \"four\"\n").is_err());
    }

    // SEC-014: File size limit
    #[test]
    fn test_too_large_file_rejected() {
        let dir = std::env::temp_dir().join("feedsieve_config_test_too_large");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "a".repeat(1_048_577)).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));

        std::fs::remove_dir_all(&dir).ok();
    }

    // SEC-015: Debug output masks the admin token
    #[test]
    fn test_debug_masks_admin_token() {
        let mut config = Config::default();
        config.server.admin_token = Some("super-secret-token".to_string());

        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("super-secret-token"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
