//! Fluent API for building test configurations
//!
//! Every builder owns a fresh temporary directory holding the data directory
//! (with the usual top-level layout) and the log directory.

use homeserver_backups::config::{
    AuthConfig, Config, GlobalConfig, NotificationConfig, RestoreConfig, RetentionPolicy,
    ScheduleConfig,
};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Token accepted by the API in tests
pub const TEST_TOKEN: &str = "test-token";

/// Builder for creating test configurations
pub struct ConfigBuilder {
    temp_dir: TempDir,
    config: Config,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder with test defaults
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        let data_directory = temp_dir.path().join("data");
        for dir in ["home", "app-data", "external", "network", "db"] {
            fs::create_dir_all(data_directory.join(dir)).expect("Failed to create data directory");
        }

        let log_directory = temp_dir.path().join("logs");
        fs::create_dir_all(&log_directory).expect("Failed to create log_directory");

        let config = Config {
            global: GlobalConfig {
                data_directory,
                restic_binary: "restic".to_string(),
                hostname: "homeserver".to_string(),
                cache_directory: None,
                log_directory,
                log_level: "debug".to_string(),
                log_max_files: 5,
            },
            schedule: ScheduleConfig::default(),
            restore: RestoreConfig {
                safety_margin_gb: 5,
                reboot: false,
            },
            retention: RetentionPolicy::default(),
            notifications: NotificationConfig::default(),
            auth: AuthConfig {
                api_token: TEST_TOKEN.to_string(),
            },
        };

        Self { temp_dir, config }
    }

    /// Reboot after a staged restore (off by default in tests)
    pub fn with_reboot(mut self, reboot: bool) -> Self {
        self.config.restore.reboot = reboot;
        self
    }

    pub fn with_safety_margin_gb(mut self, gb: u64) -> Self {
        self.config.restore.safety_margin_gb = gb;
        self
    }

    /// An empty token means no user account exists yet
    pub fn with_api_token(mut self, token: &str) -> Self {
        self.config.auth.api_token = token.to_string();
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleConfig) -> Self {
        self.config.schedule = schedule;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.config.retention = retention;
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.global.data_directory
    }

    /// Build the configuration; the temp dir is leaked so paths stay valid
    pub fn build(self) -> Config {
        let (config, temp_dir) = self.persist();
        std::mem::forget(temp_dir);
        config
    }

    /// Build the configuration along with the directory that owns its paths
    pub fn persist(self) -> (Config, TempDir) {
        (self.config, self.temp_dir)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> String {
        toml::to_string(&self.config).expect("Failed to serialize config")
    }

    /// Write the configuration next to the data directory and return its path
    pub fn write_config_file(&self) -> PathBuf {
        let path = self.temp_dir.path().join("config.toml");
        fs::write(&path, self.to_toml()).expect("Failed to write config file");
        path
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
