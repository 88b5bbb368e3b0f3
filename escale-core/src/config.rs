//! Repository configuration.
//!
//! One TOML file per repository (default: `escale.toml`). Every tunable
//! has a serde default, so a minimal config is just the relay URI, the
//! local root and a pseudonym.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::engine::{ConflictStrategy, ConsumeMode};

/// Root configuration for one synchronized repository.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryConfig {
    /// Relay backend settings.
    pub relay: RelayConfig,
    /// Local repository settings.
    pub local: LocalConfig,
    /// Client identity.
    pub client: ClientConfig,
    /// Engine behavior.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Encryption settings.
    #[serde(default)]
    pub security: SecurityConfig,
    /// Scheduler pacing.
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// Relay backend settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Backend URI: `file:///path/to/dir` or `mem:` (tests/demo).
    pub uri: String,
    /// Maximum relay blob name length in bytes.
    #[serde(default = "default_max_name_len")]
    pub max_name_len: usize,
}

/// Local repository settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalConfig {
    /// Root directory of the synchronized tree.
    pub root: PathBuf,
    /// Index file location (default: `<root>/.escale/index.json`).
    #[serde(default)]
    pub index: Option<PathBuf>,
    /// Quarantine directory (default: `<root>/.escale/quarantine`).
    #[serde(default)]
    pub quarantine: Option<PathBuf>,
}

/// Client identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Stable pseudonym used in locks, placeholders and messages.
    pub pseudonym: String,
}

/// Engine behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SyncConfig {
    /// Conflict resolution strategy, fixed for the repository lifetime.
    pub conflict: ConflictStrategy,
    /// What a pull does to the placeholder.
    pub consume: ConsumeMode,
    /// Compress payloads before encryption.
    pub compress: bool,
    /// Default access modifier for paths without an explicit one,
    /// in the `access` syntax (e.g. `"r w"` or `"r w?"`).
    pub access_default: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conflict: ConflictStrategy::NewerWins,
            consume: ConsumeMode::OneShot,
            compress: false,
            access_default: "r w".to_string(),
        }
    }
}

/// Encryption settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SecurityConfig {
    /// Payload passphrase; payloads are stored in the clear if unset.
    pub passphrase: Option<String>,
    /// Hex-encoded per-repository KDF salt; required with a passphrase.
    pub salt: Option<String>,
}

/// Scheduler pacing.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ScheduleConfig {
    /// Seconds between scans.
    pub scan_interval_secs: u64,
    /// Maximum random jitter added to each scan interval, in seconds.
    pub jitter_secs: u64,
    /// Age after which a foreign lock is stale, in seconds.
    pub lock_ttl_secs: u64,
    /// Lock settling interval, in milliseconds.
    pub lock_settle_ms: u64,
    /// Deadline for each relay adapter call, in seconds.
    pub deadline_secs: u64,
    /// Consumed placeholders and tombstones older than this are
    /// forgotten, in seconds. `0` disables garbage collection.
    pub placeholder_retention_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 60,
            jitter_secs: 10,
            lock_ttl_secs: 3600,
            lock_settle_ms: 500,
            deadline_secs: 30,
            placeholder_retention_secs: 30 * 24 * 3600,
        }
    }
}

fn default_max_name_len() -> usize {
    escale_relay::DEFAULT_MAX_NAME_LEN
}

impl RepositoryConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.security.passphrase.is_some() && self.security.salt.is_none() {
            return Err(ConfigError::Invalid(
                "security.salt is required when a passphrase is configured".into(),
            ));
        }
        if let Some(salt) = &self.security.salt {
            let bytes = hex::decode(salt)
                .map_err(|e| ConfigError::Invalid(format!("security.salt is not hex: {e}")))?;
            if bytes.len() < 8 {
                return Err(ConfigError::Invalid(
                    "security.salt must be at least 8 bytes".into(),
                ));
            }
        }
        if self.schedule.scan_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "schedule.scan_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Index file location.
    pub fn index_path(&self) -> PathBuf {
        self.local
            .index
            .clone()
            .unwrap_or_else(|| self.local.root.join(".escale").join("index.json"))
    }

    /// Quarantine directory.
    pub fn quarantine_dir(&self) -> PathBuf {
        self.local
            .quarantine
            .clone()
            .unwrap_or_else(|| self.local.root.join(".escale").join("quarantine"))
    }

    /// The configured placeholder retention horizon, if enabled.
    pub fn retention(&self) -> Option<Duration> {
        match self.schedule.placeholder_retention_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the configuration file.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },

    /// A value failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> &'static str {
        r#"
[relay]
uri = "file:///tmp/relay"

[local]
root = "/home/user/sync"

[client]
pseudonym = "laptop"
"#
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config: RepositoryConfig = toml::from_str(minimal()).unwrap();
        assert_eq!(config.schedule.scan_interval_secs, 60);
        assert_eq!(config.sync.conflict, ConflictStrategy::NewerWins);
        assert_eq!(config.sync.consume, ConsumeMode::OneShot);
        assert!(!config.sync.compress);
        assert!(config.security.passphrase.is_none());
        assert_eq!(config.relay.max_name_len, 255);
    }

    #[test]
    fn full_config_parses() {
        let toml = r#"
[relay]
uri = "file:///srv/relay"
max_name_len = 128

[local]
root = "/data/sync"
index = "/data/state/index.json"

[client]
pseudonym = "desk-01"

[sync]
conflict = "reject"
consume = "retain-history"
compress = true
access_default = "r w?"

[security]
passphrase = "hunter2"
salt = "00112233445566778899aabbccddeeff"

[schedule]
scan_interval_secs = 30
jitter_secs = 5
lock_ttl_secs = 600
lock_settle_ms = 250
deadline_secs = 10
placeholder_retention_secs = 0
"#;
        let config: RepositoryConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.sync.conflict, ConflictStrategy::Reject);
        assert_eq!(config.sync.consume, ConsumeMode::RetainHistory);
        assert_eq!(config.index_path(), PathBuf::from("/data/state/index.json"));
        assert_eq!(config.retention(), None);
    }

    #[test]
    fn passphrase_requires_salt() {
        let mut config: RepositoryConfig = toml::from_str(minimal()).unwrap();
        config.security.passphrase = Some("secret".into());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.security.salt = Some("0011223344556677".into());
        config.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let toml = format!("{}\nnot_a_field = 1\n", minimal());
        assert!(toml::from_str::<RepositoryConfig>(&toml).is_err());
    }

    #[test]
    fn default_paths_derive_from_root() {
        let config: RepositoryConfig = toml::from_str(minimal()).unwrap();
        assert_eq!(
            config.index_path(),
            PathBuf::from("/home/user/sync/.escale/index.json")
        );
        assert_eq!(
            config.quarantine_dir(),
            PathBuf::from("/home/user/sync/.escale/quarantine")
        );
    }
}
