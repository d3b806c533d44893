use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub global: GlobalConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Global configuration settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Root of the live system data (home, app-data, db, ...)
    pub data_directory: PathBuf,

    /// restic binary name or path, resolved through PATH
    #[serde(default = "default_restic_binary")]
    pub restic_binary: String,

    /// Host name recorded on every snapshot
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Where restic keeps its local cache
    #[serde(default)]
    pub cache_directory: Option<PathBuf>,

    /// Logging configuration
    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_max_files")]
    pub log_max_files: u32,
}

/// Background backup schedule
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,

    /// Alert once a repository has gone this long without a successful backup
    #[serde(default = "default_failure_threshold_hours")]
    pub failure_threshold_hours: u64,

    /// How often the scheduler wakes up to check whether a run is due
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            failure_threshold_hours: default_failure_threshold_hours(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RestoreConfig {
    /// Free space required on top of the snapshot size
    #[serde(default = "default_safety_margin_gb")]
    pub safety_margin_gb: u64,

    /// Reboot into the restored data once staging completes
    #[serde(default = "default_reboot")]
    pub reboot: bool,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            safety_margin_gb: default_safety_margin_gb(),
            reboot: default_reboot(),
        }
    }
}

impl RestoreConfig {
    pub fn safety_margin_bytes(&self) -> u64 {
        self.safety_margin_gb * 1024 * 1024 * 1024
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RetentionPolicy {
    #[serde(default = "default_keep_last")]
    pub last: u32,
    #[serde(default = "default_keep_hourly")]
    pub hourly: u32,
    #[serde(default = "default_keep_daily")]
    pub daily: u32,
    #[serde(default = "default_keep_weekly")]
    pub weekly: u32,
    #[serde(default = "default_keep_monthly")]
    pub monthly: u32,
    #[serde(default)]
    pub yearly: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            last: default_keep_last(),
            hourly: default_keep_hourly(),
            daily: default_keep_daily(),
            weekly: default_keep_weekly(),
            monthly: default_keep_monthly(),
            yearly: 0,
        }
    }
}

/// Notification configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationConfig {
    /// Optional webhook that receives newly raised notifications
    #[serde(default)]
    pub webhook_url: String,

    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_seconds: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            webhook_timeout_seconds: default_webhook_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AuthConfig {
    /// Token accepted by the API facade. Empty means no user has been set up yet.
    #[serde(default)]
    pub api_token: String,
}

// Default value functions

fn default_restic_binary() -> String { "restic".to_string() }
fn default_hostname() -> String { "homeserver".to_string() }
fn default_log_directory() -> PathBuf { PathBuf::from("~/logs") }
fn default_log_level() -> String { "info".to_string() }
fn default_log_max_files() -> u32 { 10 }
fn default_interval_minutes() -> u64 { 60 }
fn default_failure_threshold_hours() -> u64 { 24 }
fn default_poll_interval_ms() -> u64 { 100 }
fn default_safety_margin_gb() -> u64 { 5 }
fn default_reboot() -> bool { true }
fn default_keep_last() -> u32 { 10 }
fn default_keep_hourly() -> u32 { 24 }
fn default_keep_daily() -> u32 { 7 }
fn default_keep_weekly() -> u32 { 4 }
fn default_keep_monthly() -> u32 { 12 }
fn default_webhook_timeout() -> u64 { 30 }
