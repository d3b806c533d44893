//! Backup manager - repositories, backup runs, browsing and mounting snapshots

use crate::config::{Config, RetentionPolicy};
use crate::error::{BackupError, Result};
use crate::managers::ignore::IgnoreRuleCompiler;
use crate::managers::notification::{backups_failing_id, NotificationManager};
use crate::managers::progress::{BackupProgress, BackupProgressTracker, EventBus};
use crate::managers::repository::{
    derive_password, repository_id, Repository, RepositoryStore, RepositorySummary,
    REPOSITORY_CONTAINER,
};
use crate::utils::layout::{normalize_virtual_path, DataLayout};
use crate::utils::locker::RepositoryLocks;
use crate::utils::restic::{is_wrong_password, Restic, ResticEnv, ToolProgress};
use crate::utils::system::SystemOperations;
use crate::utils::{RealResticOps, RealSystemOps, ResticOperations};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Snapshot directories re-exposed under a mounted backup, as (snapshot, visible) names
const MOUNT_REMAP: &[(&str, &str)] = &[("home", "Home"), ("app-data", "Apps")];

/// A snapshot as seen by users
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    /// `<repository id>:<snapshot id>`
    pub id: String,
    /// Milliseconds since the Unix epoch
    pub time: i64,
    /// Bytes
    pub size: u64,
}

impl Backup {
    pub fn repository_id(&self) -> &str {
        self.id.split_once(':').map(|(r, _)| r).unwrap_or(&self.id)
    }

    pub fn snapshot_id(&self) -> &str {
        self.id.split_once(':').map(|(_, s)| s).unwrap_or_default()
    }
}

/// Split `<repository id>:<snapshot id>`
pub fn parse_backup_id(backup_id: &str) -> Result<(&str, &str)> {
    match backup_id.split_once(':') {
        Some((repository, snapshot)) if !repository.is_empty() && !snapshot.is_empty() => {
            Ok((repository, snapshot))
        }
        _ => Err(BackupError::BackupNotFound(backup_id.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RepositorySize {
    pub used: u64,
    pub capacity: u64,
    pub available: u64,
}

/// Directory name for a mount created at `time`
fn mount_name(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn is_valid_mount_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}

pub struct Backups {
    layout: DataLayout,
    retention: RetentionPolicy,
    repositories: RepositoryStore,
    ignore: IgnoreRuleCompiler,
    restic: Arc<dyn ResticOperations>,
    system: Arc<dyn SystemOperations>,
    notifications: Arc<NotificationManager>,
    events: EventBus,
    progress: BackupProgressTracker,
    locks: RepositoryLocks,
    running: AtomicBool,
    mount_lock: Mutex<()>,
}

impl Backups {
    pub fn new(
        config: &Config,
        restic: Arc<dyn ResticOperations>,
        system: Arc<dyn SystemOperations>,
        notifications: Arc<NotificationManager>,
    ) -> Self {
        let layout = DataLayout::new(config.global.data_directory.clone());
        let events = EventBus::new();

        Self {
            repositories: RepositoryStore::new(layout.registry_file()),
            ignore: IgnoreRuleCompiler::new(layout.clone()),
            retention: config.retention.clone(),
            progress: BackupProgressTracker::new(events.clone()),
            events,
            layout,
            restic,
            system,
            notifications,
            locks: RepositoryLocks::new(),
            running: AtomicBool::new(true),
            mount_lock: Mutex::new(()),
        }
    }

    /// Wire up the real restic binary and host operations
    pub fn from_config(config: &Config) -> Self {
        let layout = DataLayout::new(config.global.data_directory.clone());
        let restic = Restic::new(
            config.global.restic_binary.clone(),
            config.global.cache_directory.clone(),
        );
        let notifications = NotificationManager::new(
            config.notifications.clone(),
            layout.notifications_file(),
        );

        Self::new(
            config,
            Arc::new(RealResticOps::new(restic, config.global.hostname.clone())),
            Arc::new(RealSystemOps::new()),
            Arc::new(notifications),
        )
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn ignore(&self) -> &IgnoreRuleCompiler {
        &self.ignore
    }

    pub fn notifications(&self) -> &Arc<NotificationManager> {
        &self.notifications
    }

    pub(crate) fn restic(&self) -> &Arc<dyn ResticOperations> {
        &self.restic
    }

    pub(crate) fn system(&self) -> &Arc<dyn SystemOperations> {
        &self.system
    }

    /// Accept work again and clear mounts left over from a previous run
    pub async fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!("Backup engine started");
        self.unmount_all().await;
    }

    /// Refuse new tool invocations and tear down every mount
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("Backup engine stopping");
        self.unmount_all().await;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(BackupError::ShuttingDown)
        }
    }

    // Repositories

    /// Create a new repository inside `path`, which must be on external or network storage
    pub async fn create_repository(&self, path: &str, password: &str) -> Result<String> {
        self.ensure_running()?;
        let (virtual_path, system_path) = self.resolve_location(path)?;

        match tokio::fs::create_dir(&system_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(BackupError::AlreadyExists(virtual_path));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BackupError::InvalidPath(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let repository = Repository {
            id: repository_id(&virtual_path),
            path: virtual_path,
            password: derive_password(password),
            last_backup: None,
        };

        info!("Initializing repository {} at {}", repository.id, repository.path);
        let env = ResticEnv::new(&repository.password, &system_path);
        if let Err(e) = self.restic.init_repository(&env).await {
            error!("Failed to initialize repository at {:?}: {:#}", system_path, e);
            if let Err(cleanup) = tokio::fs::remove_dir_all(&system_path).await {
                warn!("Failed to remove {:?}: {}", system_path, cleanup);
            }
            return Err(e.into());
        }

        let id = repository.id.clone();
        self.repositories.insert(repository).await?;
        Ok(id)
    }

    /// Register a repository another installation created inside `path`
    pub async fn connect_to_existing_repository(&self, path: &str, password: &str) -> Result<String> {
        self.ensure_running()?;
        let (virtual_path, system_path) = self.resolve_location(path)?;

        let id = repository_id(&virtual_path);
        let already_registered = self.repositories.get(&id).await.is_ok();
        let repository = Repository {
            id: id.clone(),
            path: virtual_path,
            password: derive_password(password),
            last_backup: None,
        };
        let env = ResticEnv::new(&repository.password, &system_path);
        self.repositories.insert(repository).await?;

        if let Err(e) = self.restic.verify_repository(&env).await {
            if !already_registered {
                if let Err(forget) = self.repositories.remove(&id).await {
                    warn!("Failed to forget repository {}: {}", id, forget);
                }
            }
            let message = format!("{:#}", e);
            warn!("Failed to connect to repository {}: {}", id, message);
            if is_wrong_password(&message) {
                return Err(BackupError::InvalidPassword);
            }
            return Err(e.into());
        }

        info!("Connected to existing repository {}", id);
        Ok(id)
    }

    /// Drop a repository from the registry; its data on the medium stays
    pub async fn forget_repository(&self, id: &str) -> Result<()> {
        self.repositories.remove(id).await?;
        if let Err(e) = self.notifications.clear(&backups_failing_id(id)).await {
            warn!("Failed to clear notification for {}: {:#}", id, e);
        }
        Ok(())
    }

    pub async fn get_repositories(&self) -> Result<Vec<RepositorySummary>> {
        Ok(self
            .repositories
            .list()
            .await?
            .iter()
            .map(RepositorySummary::from)
            .collect())
    }

    pub async fn get_repository(&self, id: &str) -> Result<RepositorySummary> {
        Ok(RepositorySummary::from(&self.repositories.get(id).await?))
    }

    pub async fn repository_size(&self, id: &str) -> Result<RepositorySize> {
        let repository = self.repositories.get(id).await?;
        self.ensure_running()?;
        let env = self.env(&repository)?;

        let used = self.restic.raw_data_size(&env).await?;
        let system_path = self.layout.virtual_to_system(&repository.path)?;
        let usage = self.system.disk_usage(&system_path).await?;

        Ok(RepositorySize {
            used,
            capacity: usage.capacity,
            available: usage.available,
        })
    }

    /// Virtual path of the container and where it lives on disk
    fn resolve_location(&self, path: &str) -> Result<(String, PathBuf)> {
        let location = self.layout.virtual_to_system(path)?;
        if !self.layout.is_removable_storage(&location) {
            return Err(BackupError::InvalidPath(path.to_string()));
        }

        let virtual_path = format!("{}/{}", normalize_virtual_path(path), REPOSITORY_CONTAINER);
        Ok((virtual_path, location.join(REPOSITORY_CONTAINER)))
    }

    fn env(&self, repository: &Repository) -> Result<ResticEnv> {
        let system_path = self.layout.virtual_to_system(&repository.path)?;
        Ok(ResticEnv::new(&repository.password, &system_path))
    }

    pub(crate) async fn repository_env(&self, id: &str) -> Result<ResticEnv> {
        let repository = self.repositories.get(id).await?;
        self.env(&repository)
    }

    // Backup runs

    /// Take one snapshot of the data directory into repository `id`
    pub async fn backup(&self, id: &str) -> Result<()> {
        let repository = self.repositories.get(id).await?;
        self.ensure_running()?;
        let _lock = self.locks.try_acquire(id).ok_or_else(|| {
            BackupError::InProgress(format!("Backup of repository {} is already running", id))
        })?;

        let env = self.env(&repository)?;
        let exclude_file = self.ignore.write_exclude_file(id).await?;
        let paths = [self.layout.data_directory().to_path_buf()];

        info!("Starting backup of {:?} to repository {}", paths[0], id);
        let started = std::time::Instant::now();

        // The progress entry disappears as soon as the tool is done
        let result = {
            let handle = self.progress.begin(id);
            let mut on_progress = |progress: ToolProgress| handle.update(&progress);
            self.restic
                .backup(&env, &paths, &exclude_file, &mut on_progress)
                .await
        };

        let snapshot_id = match result {
            Ok(snapshot_id) => snapshot_id,
            Err(e) => {
                error!("Backup to repository {} failed: {:#}", id, e);
                return Err(e.into());
            }
        };

        self.repositories
            .set_last_backup(id, Utc::now().timestamp_millis())
            .await?;
        if let Err(e) = self.notifications.clear(&backups_failing_id(id)).await {
            warn!("Failed to clear notification for {}: {:#}", id, e);
        }

        info!(
            "Created snapshot {} in repository {} in {:.1}s",
            snapshot_id,
            id,
            started.elapsed().as_secs_f64()
        );

        if let Err(e) = self.restic.apply_retention(&env, &self.retention).await {
            warn!("Failed to apply retention policy to {}: {:#}", id, e);
        }

        Ok(())
    }

    /// Every backup currently running
    pub fn backup_progress(&self) -> Vec<BackupProgress> {
        self.progress.current()
    }

    pub fn is_backing_up(&self, id: &str) -> bool {
        self.locks.is_held(id)
    }

    // Browsing

    /// Snapshots of one repository, oldest first
    pub async fn list_backups(&self, repository_id: &str) -> Result<Vec<Backup>> {
        let repository = self.repositories.get(repository_id).await?;
        self.ensure_running()?;
        let env = self.env(&repository)?;

        let mut backups: Vec<Backup> = self
            .restic
            .list_snapshots(&env)
            .await?
            .into_iter()
            .map(|snapshot| Backup {
                id: format!("{}:{}", repository_id, snapshot.id),
                time: snapshot.timestamp_millis().unwrap_or_default(),
                size: snapshot.size(),
            })
            .collect();
        backups.sort_by_key(|b| b.time);
        Ok(backups)
    }

    /// Snapshots of every reachable repository, oldest first
    pub async fn list_all_backups(&self) -> Result<Vec<Backup>> {
        let mut all = Vec::new();
        for repository in self.repositories.list().await? {
            match self.list_backups(&repository.id).await {
                Ok(backups) => all.extend(backups),
                Err(e) => error!("Failed to list backups of {}: {}", repository.id, e),
            }
        }
        all.sort_by_key(|b| b.time);
        Ok(all)
    }

    pub async fn get_backup(&self, backup_id: &str) -> Result<Backup> {
        let (repository_id, _) = parse_backup_id(backup_id)?;
        self.list_backups(repository_id)
            .await?
            .into_iter()
            .find(|b| b.id == backup_id)
            .ok_or_else(|| BackupError::BackupNotFound(backup_id.to_string()))
    }

    /// Names directly inside `path` (relative to the data directory) of a backup
    pub async fn list_backup_files(&self, backup_id: &str, path: Option<&str>) -> Result<Vec<String>> {
        let backup = self.get_backup(backup_id).await?;
        let env = self.repository_env(backup.repository_id()).await?;
        let directory = self.layout.snapshot_path(path.unwrap_or("/"));

        debug!("Listing {:?} in backup {}", directory, backup_id);
        Ok(self
            .restic
            .list_snapshot_files(&env, backup.snapshot_id(), &directory)
            .await?)
    }

    // Mounting

    /// Expose a backup read-only under the backup root; returns the directory name
    pub async fn mount_backup(&self, backup_id: &str) -> Result<String> {
        let backup = self.get_backup(backup_id).await?;
        let env = self.repository_env(backup.repository_id()).await?;
        self.ensure_running()?;

        let name = self.reserve_mount_name().await?;
        let internal = self.layout.internal_mounts().join(&name);
        let root = self.layout.backup_root().join(&name);

        match self.mount_into(&backup, &env, &internal, &root).await {
            Ok(()) => {
                info!("Mounted backup {} at {}", backup_id, name);
                Ok(name)
            }
            Err(e) => {
                error!("Failed to mount backup {}: {:#}", backup_id, e);
                if let Err(cleanup) = self.unmount_backup(&name).await {
                    warn!("Failed to clean up mount {}: {}", name, cleanup);
                }
                Err(BackupError::Mount {
                    backup_id: backup_id.to_string(),
                    reason: format!("{:#}", e),
                })
            }
        }
    }

    /// Claim a fresh timestamp directory name, unique even for calls in the same millisecond
    async fn reserve_mount_name(&self) -> Result<String> {
        let _guard = self.mount_lock.lock().await;
        let mut time = Utc::now();
        loop {
            let name = mount_name(time);
            let internal = self.layout.internal_mounts().join(&name);
            let root = self.layout.backup_root().join(&name);
            if !internal.exists() && !root.exists() {
                tokio::fs::create_dir_all(&internal).await?;
                tokio::fs::create_dir_all(&root).await?;
                return Ok(name);
            }
            time = time + ChronoDuration::milliseconds(1);
        }
    }

    async fn mount_into(
        &self,
        backup: &Backup,
        env: &ResticEnv,
        internal: &Path,
        root: &Path,
    ) -> anyhow::Result<()> {
        let exposed = self
            .restic
            .mount_snapshot(env, backup.snapshot_id(), self.layout.data_directory(), internal)
            .await?;

        for (source, visible) in MOUNT_REMAP {
            let source = exposed.join(source);
            if tokio::fs::metadata(&source).await.is_err() {
                debug!("Backup {} has no {:?}, not exposing it", backup.id, source);
                continue;
            }
            let target = root.join(visible);
            tokio::fs::create_dir_all(&target).await?;
            self.system.bind_mount(&source, &target).await?;
        }
        Ok(())
    }

    /// Tear down a mount. Every step is attempted even if an earlier one fails.
    pub async fn unmount_backup(&self, name: &str) -> Result<()> {
        if !is_valid_mount_name(name) {
            return Err(BackupError::InvalidPath(name.to_string()));
        }

        let root = self.layout.backup_root().join(name);
        for (_, visible) in MOUNT_REMAP {
            let target = root.join(visible);
            if tokio::fs::symlink_metadata(&target).await.is_err() {
                continue;
            }
            if let Err(e) = self.system.unmount(&target).await {
                warn!("Failed to unmount {:?}: {:#}", target, e);
            }
            remove_empty_dir(&target).await;
        }
        remove_empty_dir(&root).await;

        let internal = self.layout.internal_mounts().join(name);
        if tokio::fs::metadata(&internal).await.is_ok() {
            if let Err(e) = self.restic.unmount(&internal).await {
                warn!("Failed to unmount {:?}: {:#}", internal, e);
            }
            remove_empty_dir(&internal).await;
        }

        info!("Unmounted backup {}", name);
        Ok(())
    }

    /// Unmount everything found under the backup root and the internal mount directory
    pub async fn unmount_all(&self) {
        let mut names = Vec::new();
        for dir in [self.layout.backup_root(), self.layout.internal_mounts()] {
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name().to_string_lossy().to_string();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }

        for name in names {
            if let Err(e) = self.unmount_backup(&name).await {
                warn!("Failed to unmount {}: {}", name, e);
            }
        }
    }
}

/// Remove a directory that should be empty by now; never recurses into a live mount
async fn remove_empty_dir(path: &Path) {
    match tokio::fs::remove_dir(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {:?}: {}", path, e),
    }
}
