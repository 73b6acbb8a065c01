//! Scheduler configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Most sources downloaded from at the same time.
pub const MAX_SOURCES_IN_PARALLEL: usize = 4;

/// Highest accepted per-source worker count.
pub const MAX_TASK_IN_PARALLEL: usize = 5;

/// Per-source worker count until changed at runtime.
pub const DEFAULT_PARALLELISM: usize = 1;

/// Failed attempts after which an item is no longer picked up automatically.
pub const MAX_TRIES: u32 = 3;

/// Folder name of the current page layout under the data root.
pub const DOWNLOADS_DIR: &str = "downloads2";

/// Folder name of the legacy page layout under the data root.
pub const LEGACY_DOWNLOADS_DIR: &str = "downloads";

/// Invalid configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A count that must be positive was zero.
    #[error("{field} must be greater than zero")]
    Zero {
        /// Offending field.
        field: &'static str,
    },

    /// Parallelism above the per-source ceiling.
    #[error("parallelism {value} exceeds max_tasks_in_parallel {max}")]
    ParallelismTooHigh {
        /// Requested parallelism.
        value: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// An interval that must be positive was zero.
    #[error("{field} must be a positive duration")]
    ZeroInterval {
        /// Offending field.
        field: &'static str,
    },
}

/// Tuning knobs of the download scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Ceiling on sources with live workers.
    pub max_sources_in_parallel: usize,
    /// Ceiling on `parallelism`.
    pub max_tasks_in_parallel: usize,
    /// Workers started per active source.
    pub parallelism: usize,
    /// Retry ceiling for errored items.
    pub max_tries: u32,
    /// Minimum spacing between rebalance passes.
    pub rebalance_interval: Duration,
    /// Minimum spacing between throttled status broadcasts.
    pub notify_interval: Duration,
    /// Pause between marking an item finished and removing it.
    pub finish_debounce: Duration,
    /// Minimum spacing between in-page progress updates.
    pub progress_sample: Duration,
    /// Root of the current page layout.
    pub downloads_root: PathBuf,
    /// Root of the legacy page layout.
    pub legacy_root: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new("data")
    }
}

impl SchedulerConfig {
    /// Default configuration with both page layouts under `data_root`.
    #[must_use]
    pub fn new(data_root: impl AsRef<Path>) -> Self {
        let data_root = data_root.as_ref();
        Self {
            max_sources_in_parallel: MAX_SOURCES_IN_PARALLEL,
            max_tasks_in_parallel: MAX_TASK_IN_PARALLEL,
            parallelism: DEFAULT_PARALLELISM,
            max_tries: MAX_TRIES,
            rebalance_interval: Duration::from_secs(1),
            notify_interval: Duration::from_secs(1),
            finish_debounce: Duration::from_millis(300),
            progress_sample: Duration::from_millis(100),
            downloads_root: data_root.join(DOWNLOADS_DIR),
            legacy_root: data_root.join(LEGACY_DOWNLOADS_DIR),
        }
    }

    /// Checks every value.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sources_in_parallel == 0 {
            return Err(ConfigError::Zero {
                field: "max_sources_in_parallel",
            });
        }
        if self.max_tasks_in_parallel == 0 {
            return Err(ConfigError::Zero {
                field: "max_tasks_in_parallel",
            });
        }
        if self.parallelism == 0 {
            return Err(ConfigError::Zero {
                field: "parallelism",
            });
        }
        if self.parallelism > self.max_tasks_in_parallel {
            return Err(ConfigError::ParallelismTooHigh {
                value: self.parallelism,
                max: self.max_tasks_in_parallel,
            });
        }
        if self.max_tries == 0 {
            return Err(ConfigError::Zero { field: "max_tries" });
        }
        for (field, value) in [
            ("rebalance_interval", self.rebalance_interval),
            ("notify_interval", self.notify_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroInterval { field });
            }
        }
        Ok(())
    }
}
