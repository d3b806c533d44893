//! Restore orchestration
//!
//! A restore never touches the live data directly. The snapshot is extracted
//! into a staging directory, marked with the first-start flag and moved to
//! `<data>/import`. The next process start calls [`apply_pending_restore`],
//! which swaps the imported entries in before anything else reads the data.

use crate::config::RestoreConfig;
use crate::error::{BackupError, Result};
use crate::managers::backup::{Backup, Backups};
use crate::managers::progress::{RestoreProgressTracker, RestoreStatus};
use crate::utils::layout::{
    DataLayout, FIRST_START_FLAG, IMPORT_DIR, INTERNAL_MOUNTS_DIR, STAGING_DIR,
};
use crate::utils::restic::ToolProgress;
use anyhow::Context;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Live entries an import never replaces
const PRESERVED_ENTRIES: &[&str] = &[
    "external",
    "network",
    "backups",
    INTERNAL_MOUNTS_DIR,
    IMPORT_DIR,
    STAGING_DIR,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Idle,
    CheckingSpace,
    Restoring,
    /// Waiting for the next start to apply the import
    Staged,
}

pub struct RestoreOrchestrator {
    backups: Arc<Backups>,
    config: RestoreConfig,
    progress: RestoreProgressTracker,
    phase: Mutex<RestorePhase>,
    running: tokio::sync::Mutex<()>,
}

impl RestoreOrchestrator {
    pub fn new(backups: Arc<Backups>, config: RestoreConfig) -> Self {
        let progress = RestoreProgressTracker::new(backups.events().clone());
        Self {
            backups,
            config,
            progress,
            phase: Mutex::new(RestorePhase::Idle),
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn status(&self) -> RestoreStatus {
        self.progress.current()
    }

    pub fn phase(&self) -> RestorePhase {
        *lock(&self.phase)
    }

    fn set_phase(&self, phase: RestorePhase) {
        debug!("Restore phase: {:?}", phase);
        *lock(&self.phase) = phase;
    }

    /// Stage `backup_id` for import on the next start
    pub async fn restore(&self, backup_id: &str) -> Result<()> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| BackupError::InProgress("A restore is already running".to_string()))?;
        self.backups.ensure_running()?;

        let backup = self.backups.get_backup(backup_id).await?;

        self.set_phase(RestorePhase::CheckingSpace);
        if let Err(e) = self.check_space(&backup).await {
            self.set_phase(RestorePhase::Idle);
            return Err(e);
        }

        info!("Restoring backup {} ({} bytes)", backup_id, backup.size);
        self.set_phase(RestorePhase::Restoring);
        self.progress.start(backup_id);

        if let Err(e) = self.stage(&backup).await {
            error!("Restore of backup {} failed: {}", backup_id, e);
            self.discard_staging().await;
            self.backups.unmount_all().await;
            self.progress.fail(&e.to_string());
            self.set_phase(RestorePhase::Idle);
            return Err(e);
        }

        self.set_phase(RestorePhase::Staged);
        self.progress.succeed();
        info!("Backup {} staged, it will be applied on the next start", backup_id);

        if self.config.reboot {
            self.backups.stop().await;
            if let Err(e) = self.backups.system().reboot().await {
                error!("Failed to reboot after restore: {:#}", e);
            }
        }

        Ok(())
    }

    async fn check_space(&self, backup: &Backup) -> Result<()> {
        let usage = self
            .backups
            .system()
            .disk_usage(self.backups.layout().data_directory())
            .await?;
        let needed = backup.size.saturating_add(self.config.safety_margin_bytes());

        if usage.available < needed {
            warn!(
                "Not enough space to restore {}: need {} bytes, {} available",
                backup.id, needed, usage.available
            );
            return Err(BackupError::NotEnoughSpace {
                needed,
                available: usage.available,
            });
        }
        Ok(())
    }

    async fn stage(&self, backup: &Backup) -> Result<()> {
        let layout = self.backups.layout();
        let staging = layout.staging_dir();
        let import = layout.import_dir();

        // Left behind by an interrupted restore
        self.discard_staging().await;
        tokio::fs::create_dir_all(&staging).await?;

        let env = self.backups.repository_env(backup.repository_id()).await?;
        let mut on_progress = |progress: ToolProgress| self.progress.update(&progress);
        self.backups
            .restic()
            .restore_snapshot(
                &env,
                backup.snapshot_id(),
                layout.data_directory(),
                &staging,
                &mut on_progress,
            )
            .await?;

        tokio::fs::write(staging.join(FIRST_START_FLAG), backup.id.as_bytes()).await?;

        // An older restore that was never applied is superseded
        if tokio::fs::symlink_metadata(&import).await.is_ok() {
            warn!("Replacing a pending restore that was never applied");
            tokio::fs::remove_dir_all(&import).await?;
        }
        tokio::fs::rename(&staging, &import).await?;
        Ok(())
    }

    async fn discard_staging(&self) {
        let staging = self.backups.layout().staging_dir();
        match tokio::fs::remove_dir_all(&staging).await {
            Ok(()) => debug!("Removed staging directory {:?}", staging),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove staging directory {:?}: {}", staging, e),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Move a staged restore into place. Returns true if there was one.
///
/// Every top-level entry of `<data>/import` replaces the live entry of the
/// same name, the first-start flag last. Entries holding removable media or
/// mounts are left alone. Safe to rerun after an interruption.
pub fn apply_pending_restore(layout: &DataLayout) -> anyhow::Result<bool> {
    let import = layout.import_dir();
    if fs::symlink_metadata(&import).is_err() {
        return Ok(false);
    }

    info!("Applying restored data from {:?}", import);
    let mut names: Vec<String> = fs::read_dir(&import)
        .with_context(|| format!("Failed to read {:?}", import))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    names.sort_by_key(|name| (name.as_str() == FIRST_START_FLAG, name.clone()));

    for name in names {
        let imported = import.join(&name);
        if PRESERVED_ENTRIES.contains(&name.as_str()) {
            debug!("Not replacing {} from restored data", name);
            remove_path(&imported)?;
            continue;
        }

        let live = layout.data_directory().join(&name);
        remove_path(&live)?;
        fs::rename(&imported, &live)
            .with_context(|| format!("Failed to move {:?} to {:?}", imported, live))?;
        debug!("Restored {}", name);
    }

    fs::remove_dir(&import).with_context(|| format!("Failed to remove {:?}", import))?;
    info!("Restore applied");
    Ok(true)
}

/// Whether the data was just restored and has not been acknowledged yet
pub fn is_restore_first_start(layout: &DataLayout) -> bool {
    layout.first_start_flag().exists()
}

pub fn clear_first_start_flag(layout: &DataLayout) -> anyhow::Result<()> {
    remove_path(&layout.first_start_flag())
}

fn remove_path(path: &Path) -> anyhow::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to stat {:?}", path)),
    };

    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
    .with_context(|| format!("Failed to remove {:?}", path))
}
