//! Test context and harness for integration testing
//!
//! A [`TestContext`] owns a throwaway data directory and a [`Backups`] engine
//! wired to the mock restic and system operations. External drives and
//! network shares are plain directories under the data directory.

use crate::config_builder::{ConfigBuilder, TEST_TOKEN};
use homeserver_backups::config::Config;
use homeserver_backups::managers::restore;
use homeserver_backups::utils::restic_ops::mock::MockResticOps;
use homeserver_backups::utils::system::mock::MockSystemOps;
use homeserver_backups::{
    BackupScheduler, Backups, BackupsApi, NotificationManager, RestoreOrchestrator, SchedulerConfig,
    StaticToken,
};
use homeserver_backups::utils::DataLayout;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Test context that manages test resources and provides common utilities
pub struct TestContext {
    /// Owns every path in `config`
    _temp_dir: TempDir,
    config: Config,
    pub restic: MockResticOps,
    pub system: MockSystemOps,
    backups: Arc<Backups>,
}

impl TestContext {
    /// Create a new test context with the default test configuration
    pub fn new() -> Self {
        Self::from_builder(ConfigBuilder::new())
    }

    /// Create a test context from a ConfigBuilder
    pub fn from_builder(builder: ConfigBuilder) -> Self {
        Self::with_mocks(builder, MockResticOps::new(), MockSystemOps::new())
    }

    /// Create a test context around preconfigured mocks
    pub fn with_mocks(builder: ConfigBuilder, restic: MockResticOps, system: MockSystemOps) -> Self {
        let (config, temp_dir) = builder.persist();
        let backups = build_backups(&config, &restic, &system);

        Self {
            _temp_dir: temp_dir,
            config,
            restic,
            system,
            backups,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backups(&self) -> Arc<Backups> {
        Arc::clone(&self.backups)
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.global.data_directory
    }

    pub fn layout(&self) -> DataLayout {
        DataLayout::new(self.data_dir())
    }

    /// Attach an external drive; returns its virtual path
    pub fn create_external_drive(&self, name: &str) -> String {
        let path = self.data_dir().join("external").join(name);
        std::fs::create_dir_all(&path).expect("Failed to create external drive");
        format!("/External/{}", name)
    }

    /// Mount a network share; returns its virtual path
    pub fn create_network_share(&self, host: &str, share: &str) -> String {
        let path = self.data_dir().join("network").join(host).join(share);
        std::fs::create_dir_all(&path).expect("Failed to create network share");
        format!("/Network/{}/{}", host, share)
    }

    /// Make storage at a virtual path unreachable, or reachable again
    pub fn set_offline(&self, virtual_path: &str, offline: bool) {
        let system_path = self
            .layout()
            .virtual_to_system(virtual_path)
            .expect("Invalid virtual path");
        self.restic.set_offline(&system_path, offline);
    }

    /// Path inside the data directory
    pub fn path(&self, relative: &str) -> PathBuf {
        self.data_dir().join(relative)
    }

    /// Write a file relative to the data directory
    pub fn write_file(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        std::fs::write(&path, content).expect("Failed to write file");
        path
    }

    /// Read a file relative to the data directory
    pub fn read_file(&self, relative: &str) -> anyhow::Result<String> {
        Ok(std::fs::read_to_string(self.path(relative))?)
    }

    pub fn file_exists(&self, relative: &str) -> bool {
        self.path(relative).exists()
    }

    /// Install an app with the given manifest; returns its data directory
    pub fn install_app(&self, id: &str, manifest: &str) -> PathBuf {
        self.write_file(&format!("app-data/{}/manifest.yml", id), manifest);
        self.path(&format!("app-data/{}", id))
    }

    pub fn restore_orchestrator(&self) -> Arc<RestoreOrchestrator> {
        Arc::new(RestoreOrchestrator::new(
            self.backups(),
            self.config.restore.clone(),
        ))
    }

    pub fn scheduler(&self, config: SchedulerConfig) -> BackupScheduler {
        BackupScheduler::new(self.backups(), config)
    }

    /// API guarded by `token`; an empty token means no user exists yet
    pub fn api_with_token(&self, token: &str) -> BackupsApi {
        BackupsApi::new(
            self.backups(),
            self.restore_orchestrator(),
            Arc::new(StaticToken::new(token)),
        )
    }

    /// API guarded by the configured token
    pub fn api(&self) -> BackupsApi {
        self.api_with_token(&self.config.auth.api_token)
    }

    /// Simulate a process restart: stop, apply a pending restore, start fresh
    pub async fn restart(&mut self) -> anyhow::Result<bool> {
        self.backups.stop().await;
        let applied = restore::apply_pending_restore(&self.layout())?;
        self.backups = build_backups(&self.config, &self.restic, &self.system);
        self.backups.start().await;
        Ok(applied)
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

fn build_backups(config: &Config, restic: &MockResticOps, system: &MockSystemOps) -> Arc<Backups> {
    let layout = DataLayout::new(config.global.data_directory.clone());
    let notifications = NotificationManager::new(
        config.notifications.clone(),
        layout.notifications_file(),
    );
    Arc::new(Backups::new(
        config,
        Arc::new(restic.clone()),
        Arc::new(system.clone()),
        Arc::new(notifications),
    ))
}

/// The token tests pass to guarded API calls
pub fn token() -> Option<&'static str> {
    Some(TEST_TOKEN)
}

/// Extension trait for assertion helpers
pub trait ResultAssertions<T> {
    /// Assert that the result is Ok and return the value
    fn assert_ok(self) -> T;

    /// Assert that the result is Ok with a custom message
    fn assert_ok_msg(self, msg: &str) -> T;

    /// Assert that the result is Err
    fn assert_err(self);

    /// Assert that the result is Err and the error message contains the given string
    fn assert_err_contains(self, needle: &str);
}

impl<T: std::fmt::Debug, E: std::fmt::Display> ResultAssertions<T> for Result<T, E> {
    fn assert_ok(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => panic!("Expected Ok, got Err: {}", e),
        }
    }

    fn assert_ok_msg(self, msg: &str) -> T {
        match self {
            Ok(v) => v,
            Err(e) => panic!("{}: {}", msg, e),
        }
    }

    fn assert_err(self) {
        if let Ok(v) = self {
            panic!("Expected Err, got Ok: {:?}", v);
        }
    }

    fn assert_err_contains(self, needle: &str) {
        match self {
            Ok(v) => panic!("Expected Err containing '{}', got Ok: {:?}", needle, v),
            Err(e) => {
                let err_msg = e.to_string();
                assert!(
                    err_msg.contains(needle),
                    "Expected error containing '{}', got: {}",
                    needle,
                    err_msg
                );
            }
        }
    }
}
