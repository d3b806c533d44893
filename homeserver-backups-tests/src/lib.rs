//! Test utilities for homeserver-backups
//!
//! This crate provides shared test utilities, re-exports of the mock
//! implementations, and helper functions for testing the backup engine.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use test_utils::{TestContext, TEST_PASSWORD};
//!
//! #[tokio::test]
//! async fn my_test() {
//!     let ctx = TestContext::new();
//!     let drive = ctx.create_external_drive("SanDisk");
//!     let id = ctx.backups().create_repository(&drive, TEST_PASSWORD).await.unwrap();
//!     // ... test code
//! }
//! ```

pub mod config_builder;
pub mod fixtures;
pub mod test_context;

// Re-export commonly used items
pub use config_builder::{ConfigBuilder, TEST_TOKEN};
pub use fixtures::*;
pub use test_context::{token, ResultAssertions, TestContext};

// Re-export types from the main crate for convenience
pub use homeserver_backups::config::{
    Config, GlobalConfig, NotificationConfig, RestoreConfig, RetentionPolicy, ScheduleConfig,
};
pub use homeserver_backups::utils::restic::{ResticEnv, Snapshot};

// Re-export mock implementations from the main crate
pub use homeserver_backups::utils::restic_ops::mock::{MockResticOps, ResticCall};
pub use homeserver_backups::utils::restic_ops::ResticOperations;
pub use homeserver_backups::utils::system::mock::{MockSystemOps, SystemCall};
pub use homeserver_backups::utils::system::SystemOperations;

/// Common test result type
pub type TestResult<T = ()> = anyhow::Result<T>;
