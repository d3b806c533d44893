//! Configuration module for homeserver-backups
//!
//! This module handles loading and validating configuration from TOML files.
//! Only `global.data_directory` is required; every other setting has a default.
//!
//! ## Example Usage
//!
//! ```no_run
//! use homeserver_backups::config;
//!
//! let config = config::load_config("/etc/homeserver-backups.toml")?;
//! println!("Backing up {:?}", config.global.data_directory);
//! # Ok::<(), config::ConfigError>(())
//! ```

mod loader;
mod types;

pub use loader::{load_config, parse_config, ConfigError, Result};
pub use types::*;

use std::time::Duration;

impl ScheduleConfig {
    /// Scheduler settings in the form the scheduler consumes them
    pub fn to_scheduler_config(&self) -> crate::managers::scheduler::SchedulerConfig {
        crate::managers::scheduler::SchedulerConfig {
            interval: Duration::from_secs(self.interval_minutes * 60),
            failure_threshold: Duration::from_secs(self.failure_threshold_hours * 60 * 60),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

/// Expand tilde (~) in path
pub fn expand_tilde(path: &std::path::Path) -> std::path::PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}
