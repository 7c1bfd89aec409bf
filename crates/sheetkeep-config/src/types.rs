//! Configuration types mapping to the TOML schema.
//!
//! ```toml
//! [session]
//! idle_timeout_millis = 7200000
//! session_timeout_millis = 1800000   # optional external cap
//! preview_prefix = "PREVIEW_"
//!
//! [checkpoint]
//! max_checkpoints_per_session = 10
//! swap_dir = "/var/tmp/sheetkeep"
//!
//! [cluster]
//! multi_node = true
//! max_resident_sessions = 500
//! flush_interval_secs = 30
//!
//! [logging]
//! filter = "sheetkeep=debug,info"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Default configuration values.
pub mod defaults {
    pub const MAX_CHECKPOINTS_PER_SESSION: usize = 10;
    pub const MAX_RESIDENT_SESSIONS: usize = 500;
    pub const FLUSH_INTERVAL_SECS: u64 = 30;
    pub const IDLE_TIMEOUT_MILLIS: u64 = 7_200_000;
    pub const DELETE_RETRY_MILLIS: u64 = 5_000;
    pub const PREVIEW_PREFIX: &str = "PREVIEW_";
    pub const LOG_FILTER: &str = "sheetkeep=info,warn";
}

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetkeepConfig {
    /// Session lifetime settings.
    pub session: Option<SessionSection>,

    /// Checkpoint history and swap settings.
    pub checkpoint: Option<CheckpointSection>,

    /// Cluster residency and flush settings.
    pub cluster: Option<ClusterSection>,

    /// Logging settings.
    pub logging: Option<LoggingSection>,
}

impl SheetkeepConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: SheetkeepConfig) {
        if other.session.is_some() {
            self.session = other.session;
        }

        if other.checkpoint.is_some() {
            self.checkpoint = other.checkpoint;
        }

        if other.cluster.is_some() {
            self.cluster = other.cluster;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// Session section, or defaults when absent.
    pub fn session(&self) -> SessionSection {
        self.session.clone().unwrap_or_default()
    }

    /// Checkpoint section, or defaults when absent.
    pub fn checkpoint(&self) -> CheckpointSection {
        self.checkpoint.clone().unwrap_or_default()
    }

    /// Cluster section, or defaults when absent.
    pub fn cluster(&self) -> ClusterSection {
        self.cluster.clone().unwrap_or_default()
    }

    /// Logging section, or defaults when absent.
    pub fn logging(&self) -> LoggingSection {
        self.logging.clone().unwrap_or_default()
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let checkpoint = self.checkpoint();
        if checkpoint.max_checkpoints_per_session == 0 {
            return Err(ConfigError::Invalid {
                field: "checkpoint.max_checkpoints_per_session".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let cluster = self.cluster();
        if cluster.multi_node && cluster.max_resident_sessions == 0 {
            return Err(ConfigError::Invalid {
                field: "cluster.max_resident_sessions".to_string(),
                reason: "must be at least 1 when multi_node is set".to_string(),
            });
        }
        if cluster.flush_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "cluster.flush_interval_secs".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        if self.session().preview_prefix.is_empty() {
            return Err(ConfigError::Invalid {
                field: "session.preview_prefix".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// Session lifetime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Idle time after which a session is reclaimed.
    pub idle_timeout_millis: u64,
    /// External session timeout; caps the idle timeout when smaller.
    pub session_timeout_millis: Option<u64>,
    /// Id prefix marking preview-class sessions.
    pub preview_prefix: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            idle_timeout_millis: defaults::IDLE_TIMEOUT_MILLIS,
            session_timeout_millis: None,
            preview_prefix: defaults::PREVIEW_PREFIX.to_string(),
        }
    }
}

impl SessionSection {
    /// Idle timeout clamped to the external session timeout.
    pub fn effective_idle_timeout(&self) -> Duration {
        let millis = match self.session_timeout_millis {
            Some(external) if external < self.idle_timeout_millis => external,
            _ => self.idle_timeout_millis,
        };
        Duration::from_millis(millis)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Checkpoint
// ─────────────────────────────────────────────────────────────────────────────

/// Checkpoint history configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    /// Undo history depth per session.
    pub max_checkpoints_per_session: usize,
    /// Directory for swapped checkpoints. Defaults to the system temp dir.
    pub swap_dir: Option<PathBuf>,
    /// Delay before retrying a failed swap file delete.
    pub delete_retry_millis: u64,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            max_checkpoints_per_session: defaults::MAX_CHECKPOINTS_PER_SESSION,
            swap_dir: None,
            delete_retry_millis: defaults::DELETE_RETRY_MILLIS,
        }
    }
}

impl CheckpointSection {
    /// Resolved swap directory.
    pub fn swap_dir(&self) -> PathBuf {
        self.swap_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("sheetkeep-swap"))
    }

    pub fn delete_retry(&self) -> Duration {
        Duration::from_millis(self.delete_retry_millis)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cluster
// ─────────────────────────────────────────────────────────────────────────────

/// Cluster residency configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Whether this node is one of several serving the same sessions.
    pub multi_node: bool,
    /// Locally resident session cap, only enforced with `multi_node`.
    pub max_resident_sessions: usize,
    /// Interval between background flushes to the distributed cache.
    pub flush_interval_secs: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            multi_node: false,
            max_resident_sessions: defaults::MAX_RESIDENT_SESSIONS,
            flush_interval_secs: defaults::FLUSH_INTERVAL_SECS,
        }
    }
}

impl ClusterSection {
    /// Resident cap, if one applies.
    pub fn resident_cap(&self) -> Option<usize> {
        self.multi_node.then_some(self.max_resident_sessions)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `EnvFilter` directive for console output.
    pub filter: String,
    /// Emit console logs as JSON.
    pub json: bool,
    /// Directory for daily-rolling JSON log files.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: defaults::LOG_FILTER.to_string(),
            json: false,
            directory: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SheetkeepConfig::new();
        assert_eq!(config.checkpoint().max_checkpoints_per_session, 10);
        assert_eq!(config.cluster().max_resident_sessions, 500);
        assert_eq!(config.cluster().flush_interval(), Duration::from_secs(30));
        assert_eq!(
            config.session().effective_idle_timeout(),
            Duration::from_millis(7_200_000)
        );
        assert_eq!(config.session().preview_prefix, "PREVIEW_");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sections() {
        let config = SheetkeepConfig::from_toml(
            r#"
[checkpoint]
max_checkpoints_per_session = 3

[cluster]
multi_node = true
max_resident_sessions = 2
"#,
        )
        .unwrap();

        assert_eq!(config.checkpoint().max_checkpoints_per_session, 3);
        assert_eq!(config.cluster().resident_cap(), Some(2));
        // Unspecified fields keep defaults
        assert_eq!(config.cluster().flush_interval_secs, 30);
        assert!(config.session.is_none());
    }

    #[test]
    fn test_resident_cap_requires_multi_node() {
        let cluster = ClusterSection {
            multi_node: false,
            max_resident_sessions: 2,
            ..Default::default()
        };
        assert_eq!(cluster.resident_cap(), None);
    }

    #[test]
    fn test_idle_timeout_clamped() {
        let session = SessionSection {
            idle_timeout_millis: 10_000,
            session_timeout_millis: Some(4_000),
            ..Default::default()
        };
        assert_eq!(session.effective_idle_timeout(), Duration::from_millis(4_000));

        let session = SessionSection {
            idle_timeout_millis: 10_000,
            session_timeout_millis: Some(60_000),
            ..Default::default()
        };
        assert_eq!(session.effective_idle_timeout(), Duration::from_millis(10_000));
    }

    #[test]
    fn test_merge_overrides_present_sections() {
        let mut base = SheetkeepConfig::from_toml(
            r#"
[cluster]
flush_interval_secs = 10

[logging]
json = true
"#,
        )
        .unwrap();
        let overlay = SheetkeepConfig::from_toml(
            r#"
[cluster]
flush_interval_secs = 60
"#,
        )
        .unwrap();

        base.merge(overlay);
        assert_eq!(base.cluster().flush_interval_secs, 60);
        assert!(base.logging().json);
    }

    #[test]
    fn test_validate_rejects_zero_history() {
        let config = SheetkeepConfig::from_toml(
            r#"
[checkpoint]
max_checkpoints_per_session = 0
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "checkpoint.max_checkpoints_per_session"));
    }

    #[test]
    fn test_toml_roundtrip_preserves_values() {
        let mut config = SheetkeepConfig::new();
        config.cluster = Some(ClusterSection {
            multi_node: true,
            max_resident_sessions: 42,
            flush_interval_secs: 5,
        });
        let text = config.to_toml().unwrap();
        assert!(text.contains("max_resident_sessions = 42"));
        assert_eq!(SheetkeepConfig::from_toml(&text).unwrap(), config);
    }
}
