//! Configuration for atlas-idb
//!
//! Centralized configuration with sensible defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for one backing store instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for the store. `None` keeps everything in memory.
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── indexeddb.leveldb/    (key-value engine files)
    ///     ├── indexeddb.blob/       (blob files, one dir per database)
    ///     └── corruption_info       (sidecar left after detected corruption)
    pub data_dir: Option<PathBuf>,

    /// Origin the store belongs to, e.g. "https://example.com"
    pub origin: String,

    // -------------------------------------------------------------------------
    // Engine Tuning
    // -------------------------------------------------------------------------
    /// File handle cap handed to the engine
    pub max_open_files: usize,

    /// Verify checksums on every read path the engine offers
    pub paranoid_checks: bool,

    /// Bytes of log the engine accumulates before writing a fresh table
    pub write_buffer_size: usize,

    // -------------------------------------------------------------------------
    // Blob Journal Cleaning
    // -------------------------------------------------------------------------
    /// Pending cleaning requests that force an immediate cleaning pass
    pub max_journal_clean_requests: usize,

    /// Delay armed by the first cleaning request of a burst
    pub initial_journal_cleaning_window: Duration,

    /// Longest a burst of requests may keep postponing the cleaning pass
    pub max_journal_cleaning_window: Duration,

    // -------------------------------------------------------------------------
    // Migration
    // -------------------------------------------------------------------------
    /// Hosts whose stores skip blob file validation when migrating to v5
    pub blob_validation_exclusions: Vec<String>,

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------
    /// Minimum spacing between tombstone sweeps of one store
    pub tombstone_sweep_interval: Duration,

    /// Minimum spacing between pre-close compactions of one store
    pub compaction_interval: Duration,

    /// Wall time a pre-close task may use per run
    pub pre_close_task_budget: Duration,

    /// Idle time before a tombstone-triggered cleanup runs
    pub cleanup_delay: Duration,

    /// Process-wide spacing between maintenance runs of any store
    pub global_maintenance_spacing: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            origin: "http://localhost".to_string(),
            max_open_files: 80,
            paranoid_checks: true,
            write_buffer_size: 4 * 1024 * 1024, // 4 MB
            max_journal_clean_requests: 5,
            initial_journal_cleaning_window: Duration::from_millis(10),
            max_journal_cleaning_window: Duration::from_secs(2),
            blob_validation_exclusions: Vec::new(),
            tombstone_sweep_interval: Duration::from_secs(3 * 24 * 60 * 60),
            compaction_interval: Duration::from_secs(3 * 24 * 60 * 60),
            pre_close_task_budget: Duration::from_secs(60),
            cleanup_delay: Duration::from_secs(2),
            global_maintenance_spacing: Duration::from_secs(10 * 60),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn is_in_memory(&self) -> bool {
        self.data_dir.is_none()
    }

    /// Directory holding the key-value engine files
    pub fn database_path(&self) -> Option<PathBuf> {
        self.data_dir.as_deref().map(|dir| dir.join("indexeddb.leveldb"))
    }

    /// Root of the per-database blob directories
    pub fn blob_path(&self) -> Option<PathBuf> {
        self.data_dir.as_deref().map(|dir| dir.join("indexeddb.blob"))
    }

    pub fn corruption_info_path(&self) -> Option<PathBuf> {
        self.data_dir.as_deref().map(|dir| dir.join("corruption_info"))
    }

    /// Host part of the origin ("https://a.example:8080" -> "a.example")
    pub fn origin_host(&self) -> &str {
        let rest = self
            .origin
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.origin);
        let authority = rest.split('/').next().unwrap_or(rest);
        authority.split(':').next().unwrap_or(authority)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Persist the store under `path`
    pub fn data_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.config.data_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Keep the store purely in memory
    pub fn in_memory(mut self) -> Self {
        self.config.data_dir = None;
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.config.origin = origin.into();
        self
    }

    pub fn max_open_files(mut self, count: usize) -> Self {
        self.config.max_open_files = count;
        self
    }

    pub fn paranoid_checks(mut self, enabled: bool) -> Self {
        self.config.paranoid_checks = enabled;
        self
    }

    /// Set the engine log size limit (in bytes)
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    pub fn max_journal_clean_requests(mut self, count: usize) -> Self {
        self.config.max_journal_clean_requests = count;
        self
    }

    pub fn journal_cleaning_windows(mut self, initial: Duration, max: Duration) -> Self {
        self.config.initial_journal_cleaning_window = initial;
        self.config.max_journal_cleaning_window = max;
        self
    }

    /// Add a host that skips blob validation during the v5 migration
    pub fn exclude_from_blob_validation(mut self, host: impl Into<String>) -> Self {
        self.config.blob_validation_exclusions.push(host.into());
        self
    }

    pub fn tombstone_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.tombstone_sweep_interval = interval;
        self
    }

    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.config.compaction_interval = interval;
        self
    }

    pub fn pre_close_task_budget(mut self, budget: Duration) -> Self {
        self.config.pre_close_task_budget = budget;
        self
    }

    pub fn cleanup_delay(mut self, delay: Duration) -> Self {
        self.config.cleanup_delay = delay;
        self
    }

    pub fn global_maintenance_spacing(mut self, spacing: Duration) -> Self {
        self.config.global_maintenance_spacing = spacing;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
