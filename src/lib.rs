//! Home Server Backups Library
//!
//! Backup and restore orchestration for a home server's data directory,
//! wrapping restic.

pub mod api;
pub mod config;
pub mod error;
pub mod managers;
pub mod utils;

// Re-export commonly used types
pub use api::{BackupsApi, StaticToken, TokenVerifier};
pub use config::{load_config, Config};
pub use error::{BackupError, Result};
pub use managers::backup::{Backup, Backups, RepositorySize};
pub use managers::logging::{init_console_logging, init_logging, LogGuard, LoggingConfig};
pub use managers::notification::NotificationManager;
pub use managers::progress::{BackupEvent, EventBus, EventKind, RestoreStatus, Subscription};
pub use managers::restore::{apply_pending_restore, is_restore_first_start, RestoreOrchestrator};
pub use managers::scheduler::{BackupScheduler, SchedulerConfig};
