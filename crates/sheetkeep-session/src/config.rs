//! Configuration for the session directory.

use std::path::PathBuf;
use std::time::Duration;

use sheetkeep_config::SheetkeepConfig;
use sheetkeep_config::defaults;

/// Idle sweep cadence when none is configured.
pub const DEFAULT_IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for a [`SessionDirectory`](crate::SessionDirectory).
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Local residency cap. `None` means unbounded (single-node mode).
    pub resident_cap: Option<usize>,

    /// Id prefix marking preview-class sessions, evicted first under the cap.
    pub preview_prefix: String,

    /// Checkpoints kept per session.
    pub max_checkpoints: usize,

    /// Directory holding swapped checkpoints.
    pub swap_dir: PathBuf,

    /// Delay before retrying a failed swap file delete.
    pub delete_retry: Duration,

    /// Sessions idle longer than this are disposed by the sweep.
    pub idle_timeout: Duration,

    /// Whether to run the periodic flush, idle sweep and rebalance tasks.
    /// If false, callers drive `flush_all`, `sweep_idle` and
    /// `handle_rebalance` themselves.
    pub enable_background_tasks: bool,

    /// Interval for the periodic `flush_all`.
    pub flush_interval: Duration,

    /// Interval for the idle sweep.
    pub idle_sweep_interval: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            resident_cap: None,
            preview_prefix: defaults::PREVIEW_PREFIX.to_string(),
            max_checkpoints: defaults::MAX_CHECKPOINTS_PER_SESSION,
            swap_dir: std::env::temp_dir().join("sheetkeep-swap"),
            delete_retry: Duration::from_millis(defaults::DELETE_RETRY_MILLIS),
            idle_timeout: Duration::from_millis(defaults::IDLE_TIMEOUT_MILLIS),
            enable_background_tasks: true,
            flush_interval: Duration::from_secs(defaults::FLUSH_INTERVAL_SECS),
            idle_sweep_interval: DEFAULT_IDLE_SWEEP_INTERVAL,
        }
    }
}

impl DirectoryConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the directory settings from a loaded configuration file.
    pub fn from_config(config: &SheetkeepConfig) -> Self {
        let session = config.session();
        let checkpoint = config.checkpoint();
        let cluster = config.cluster();
        Self {
            resident_cap: cluster.resident_cap(),
            preview_prefix: session.preview_prefix.clone(),
            max_checkpoints: checkpoint.max_checkpoints_per_session,
            swap_dir: checkpoint.swap_dir(),
            delete_retry: checkpoint.delete_retry(),
            idle_timeout: session.effective_idle_timeout(),
            flush_interval: cluster.flush_interval(),
            ..Self::default()
        }
    }

    /// Cap the number of locally resident sessions.
    pub fn with_resident_cap(mut self, cap: usize) -> Self {
        self.resident_cap = Some(cap);
        self
    }

    /// Let the local tier grow without bound.
    pub fn without_resident_cap(mut self) -> Self {
        self.resident_cap = None;
        self
    }

    /// Set the id prefix that marks preview sessions. Empty disables
    /// preview eviction.
    pub fn with_preview_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.preview_prefix = prefix.into();
        self
    }

    /// Set how many checkpoints each session keeps.
    pub fn with_max_checkpoints(mut self, max: usize) -> Self {
        self.max_checkpoints = max;
        self
    }

    /// Set the directory swapped checkpoints are written to.
    pub fn with_swap_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.swap_dir = dir.into();
        self
    }

    /// Set the delay before a failed swap file delete is retried.
    pub fn with_delete_retry(mut self, delay: Duration) -> Self {
        self.delete_retry = delay;
        self
    }

    /// Set how long a session may go untouched before the sweep closes it.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enable or disable the background tasks.
    pub fn with_background_tasks(mut self, enabled: bool) -> Self {
        self.enable_background_tasks = enabled;
        self
    }

    /// Set the period of the background `flush_all`.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the period of the background idle sweep.
    pub fn with_idle_sweep_interval(mut self, interval: Duration) -> Self {
        self.idle_sweep_interval = interval;
        self
    }

    /// Whether `id` names a preview-class session.
    pub fn is_preview(&self, id: &str) -> bool {
        !self.preview_prefix.is_empty() && id.starts_with(&self.preview_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DirectoryConfig::default();
        assert_eq!(config.resident_cap, None);
        assert_eq!(config.max_checkpoints, 10);
        assert_eq!(config.flush_interval, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_millis(7_200_000));
        assert!(config.enable_background_tasks);
    }

    #[test]
    fn test_from_config_single_node_has_no_cap() {
        let config = DirectoryConfig::from_config(&SheetkeepConfig::default());
        assert_eq!(config.resident_cap, None);
    }

    #[test]
    fn test_from_config_multi_node() {
        let file = SheetkeepConfig::from_toml(
            r#"
            [session]
            idle_timeout_millis = 60000
            session_timeout_millis = 1000

            [checkpoint]
            max_checkpoints_per_session = 4

            [cluster]
            multi_node = true
            max_resident_sessions = 2
            flush_interval_secs = 5
            "#,
        )
        .unwrap();

        let config = DirectoryConfig::from_config(&file);
        assert_eq!(config.resident_cap, Some(2));
        assert_eq!(config.max_checkpoints, 4);
        assert_eq!(config.idle_timeout, Duration::from_millis(1000));
        assert_eq!(config.flush_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_is_preview() {
        let config = DirectoryConfig::new();
        assert!(config.is_preview("PREVIEW_x"));
        assert!(!config.is_preview("s1"));
        assert!(!config.with_preview_prefix("").is_preview("PREVIEW_x"));
    }
}
