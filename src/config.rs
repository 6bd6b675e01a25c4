//! Configuration file parser for `feedfan.toml`.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged as a warning so typos are
//! visible.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid config value: {0}")]
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
    /// SQLite database file (`:memory:` for an ephemeral store).
    pub database_path: PathBuf,

    /// Minutes between scheduled batch passes.
    pub sync_interval_minutes: u64,

    /// Upper bound of batch passes allowed to run at the same time.
    pub max_concurrent_syncs: usize,

    /// Distinct feed URLs fetched in parallel within one pass.
    pub max_concurrent_fetches: usize,

    /// Upper bound for one fetch + parse, in seconds.
    pub fetch_timeout_secs: u64,

    /// Maximum accepted response body.
    pub max_feed_bytes: usize,

    /// Largest page size the query engine will serve.
    pub max_page_size: u32,

    /// Permit feed URLs on loopback/private hosts.
    pub allow_private_hosts: bool,

    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("feedfan.db"),
            sync_interval_minutes: 30,
            max_concurrent_syncs: 3,
            max_concurrent_fetches: 10,
            fetch_timeout_secs: 10,
            max_feed_bytes: 10 * 1024 * 1024,
            max_page_size: 100,
            allow_private_hosts: false,
            user_agent: concat!("feedfan/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 9] = [
        "database_path",
        "sync_interval_minutes",
        "max_concurrent_syncs",
        "max_concurrent_fetches",
        "fetch_timeout_secs",
        "max_feed_bytes",
        "max_page_size",
        "allow_private_hosts",
        "user_agent",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)`
    /// - Zero intervals, pool sizes or timeouts → `Err(ConfigError::Invalid)`
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

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        tracing::info!(
            database = %config.database_path.display(),
            interval_minutes = config.sync_interval_minutes,
            "Loaded configuration"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.sync_interval_minutes == 0, "sync_interval_minutes must be > 0"),
            (self.max_concurrent_syncs == 0, "max_concurrent_syncs must be > 0"),
            (self.max_concurrent_fetches == 0, "max_concurrent_fetches must be > 0"),
            (self.fetch_timeout_secs == 0, "fetch_timeout_secs must be > 0"),
            (self.max_feed_bytes == 0, "max_feed_bytes must be > 0"),
            (self.max_page_size == 0, "max_page_size must be > 0"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, msg)) => Err(ConfigError::Invalid((*msg).to_string())),
            None => Ok(()),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_minutes * 60)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
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
        assert_eq!(config.sync_interval_minutes, 30);
        assert_eq!(config.max_concurrent_syncs, 3);
        assert_eq!(config.fetch_timeout_secs, 10);
        assert_eq!(config.max_page_size, 100);
        assert!(!config.allow_private_hosts);
        assert!(config.user_agent.starts_with("feedfan/"));
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/feedfan_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.sync_interval_minutes, 30);
    }

    #[test]
    fn test_empty_content_returns_default() {
        let config = Config::from_toml("   \n").unwrap();
        assert_eq!(config.max_concurrent_fetches, 10);
    }

    #[test]
    fn test_partial_config_keeps_other_defaults() {
        let config =
            Config::from_toml("sync_interval_minutes = 5\nallow_private_hosts = true").unwrap();
        assert_eq!(config.sync_interval_minutes, 5);
        assert!(config.allow_private_hosts);
        assert_eq!(config.max_concurrent_syncs, 3);
        assert_eq!(config.sync_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_unknown_keys_are_accepted() {
        let config = Config::from_toml("theme = \"dark\"\nfetch_timeout_secs = 6").unwrap();
        assert_eq!(config.fetch_timeout(), Duration::from_secs(6));
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(matches!(
            Config::from_toml("sync_interval_minutes = ["),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(matches!(
            Config::from_toml("max_concurrent_syncs = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("fetch_timeout_secs = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join("feedfan_config_test_load");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feedfan.toml");
        std::fs::write(&path, "database_path = \"/var/lib/feedfan/data.db\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/var/lib/feedfan/data.db"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
