//! Restic operations abstraction for testability
//!
//! This module provides a trait-based abstraction for restic operations,
//! enabling dependency injection and mocking for tests.

use crate::config::RetentionPolicy;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// Re-export types from restic module
pub use super::restic::{Restic, ResticEnv, Snapshot, ToolProgress};

/// Callback receiving normalized progress while a long command runs
pub type ProgressSink<'a> = &'a mut (dyn FnMut(ToolProgress) + Send);

/// How long a freshly spawned `restic mount` may take to expose the snapshot
pub const MOUNT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Abstraction for restic operations, enabling mocking in tests
#[async_trait]
pub trait ResticOperations: Send + Sync {
    /// Initialize a new repository at the env's location
    async fn init_repository(&self, env: &ResticEnv) -> Result<()>;

    /// Open an existing repository, failing on a wrong password or location
    async fn verify_repository(&self, env: &ResticEnv) -> Result<()>;

    /// Back up `paths`; returns the id of the new snapshot
    async fn backup(
        &self,
        env: &ResticEnv,
        paths: &[PathBuf],
        exclude_file: &Path,
        on_progress: ProgressSink<'_>,
    ) -> Result<String>;

    /// Apply retention policy to repository
    async fn apply_retention(&self, env: &ResticEnv, retention: &RetentionPolicy) -> Result<()>;

    /// List snapshots in a repository
    async fn list_snapshots(&self, env: &ResticEnv) -> Result<Vec<Snapshot>>;

    /// Names of the entries directly inside `directory` of a snapshot
    async fn list_snapshot_files(
        &self,
        env: &ResticEnv,
        snapshot_id: &str,
        directory: &Path,
    ) -> Result<Vec<String>>;

    /// Restore the `source` subtree of a snapshot into `target`
    async fn restore_snapshot(
        &self,
        env: &ResticEnv,
        snapshot_id: &str,
        source: &Path,
        target: &Path,
        on_progress: ProgressSink<'_>,
    ) -> Result<()>;

    /// Expose a snapshot read-only under `mountpoint`. Returns the directory
    /// at which the snapshot's copy of `source` is visible.
    async fn mount_snapshot(
        &self,
        env: &ResticEnv,
        snapshot_id: &str,
        source: &Path,
        mountpoint: &Path,
    ) -> Result<PathBuf>;

    /// Tear down a mount created by `mount_snapshot`
    async fn unmount(&self, mountpoint: &Path) -> Result<()>;

    /// Bytes the repository occupies on its storage
    async fn raw_data_size(&self, env: &ResticEnv) -> Result<u64>;
}

/// Default implementation using real restic calls
pub struct RealResticOps {
    restic: Restic,
    hostname: String,
    mounts: Mutex<HashMap<PathBuf, Child>>,
}

impl RealResticOps {
    pub fn new(restic: Restic, hostname: impl Into<String>) -> Self {
        Self {
            restic,
            hostname: hostname.into(),
            mounts: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ResticOperations for RealResticOps {
    async fn init_repository(&self, env: &ResticEnv) -> Result<()> {
        super::restic::init_repository(&self.restic, env).await
    }

    async fn verify_repository(&self, env: &ResticEnv) -> Result<()> {
        super::restic::verify_repository(&self.restic, env).await
    }

    async fn backup(
        &self,
        env: &ResticEnv,
        paths: &[PathBuf],
        exclude_file: &Path,
        on_progress: ProgressSink<'_>,
    ) -> Result<String> {
        super::restic::backup(&self.restic, env, paths, exclude_file, &self.hostname, on_progress)
            .await
    }

    async fn apply_retention(&self, env: &ResticEnv, retention: &RetentionPolicy) -> Result<()> {
        super::restic::apply_retention(&self.restic, env, retention).await
    }

    async fn list_snapshots(&self, env: &ResticEnv) -> Result<Vec<Snapshot>> {
        super::restic::list_snapshots(&self.restic, env).await
    }

    async fn list_snapshot_files(
        &self,
        env: &ResticEnv,
        snapshot_id: &str,
        directory: &Path,
    ) -> Result<Vec<String>> {
        super::restic::list_snapshot_files(&self.restic, env, snapshot_id, directory).await
    }

    async fn restore_snapshot(
        &self,
        env: &ResticEnv,
        snapshot_id: &str,
        source: &Path,
        target: &Path,
        on_progress: ProgressSink<'_>,
    ) -> Result<()> {
        super::restic::restore_snapshot(&self.restic, env, snapshot_id, source, target, on_progress)
            .await
    }

    async fn mount_snapshot(
        &self,
        env: &ResticEnv,
        snapshot_id: &str,
        source: &Path,
        mountpoint: &Path,
    ) -> Result<PathBuf> {
        let short_id: String = snapshot_id.chars().take(8).collect();
        let args = vec![
            "mount".to_string(),
            "--no-default-permissions".to_string(),
            mountpoint.display().to_string(),
        ];
        let mut child = self.restic.spawn(env, &args)?;

        // restic exposes every snapshot under ids/<short id>/<original path>
        let snapshot_root = mountpoint.join("ids").join(&short_id);
        let deadline = tokio::time::Instant::now() + MOUNT_READY_TIMEOUT;
        loop {
            if let Some(status) = child.try_wait().context("Failed to poll restic mount")? {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    use tokio::io::AsyncReadExt;
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                anyhow::bail!(super::restic::describe_failure(&stderr, status));
            }

            if tokio::fs::metadata(&snapshot_root).await.is_ok() {
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                let _ = child.kill().await;
                anyhow::bail!(
                    "restic mount did not expose snapshot {} within {:?}",
                    short_id,
                    MOUNT_READY_TIMEOUT
                );
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!("Mounted snapshot {} at {:?}", short_id, mountpoint);
        self.mounts.lock().await.insert(mountpoint.to_path_buf(), child);

        let relative = source.strip_prefix("/").unwrap_or(source);
        Ok(snapshot_root.join(relative))
    }

    async fn unmount(&self, mountpoint: &Path) -> Result<()> {
        let child = self.mounts.lock().await.remove(mountpoint);

        let mountpoint_arg = mountpoint.display().to_string();
        let unmounted = super::command::run_command(
            "umount",
            &[mountpoint_arg.as_str()],
            Duration::from_secs(30),
        )
        .await;

        if let Some(mut child) = child {
            // restic exits on its own once the FUSE mount is gone
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(_) => debug!("restic mount process for {:?} exited", mountpoint),
                Err(_) => {
                    warn!("restic mount for {:?} did not exit, killing it", mountpoint);
                    let _ = child.kill().await;
                }
            }
            return Ok(());
        }

        unmounted.map(|_| ())
    }

    async fn raw_data_size(&self, env: &ResticEnv) -> Result<u64> {
        super::restic::raw_data_size(&self.restic, env).await
    }
}

/// Mock implementation for testing
/// Available for use in external test crates
///
/// Repositories are plain directories: a `config.json` holding the password
/// and one directory per snapshot with a copy of the backed-up tree.
pub mod mock {
    use super::*;
    use crate::utils::restic::SnapshotSummary;
    use chrono::{DateTime, Utc};
    use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
    use sha2::{Digest, Sha256};
    use std::collections::HashSet;
    use std::fs;
    use std::io::ErrorKind;
    use std::sync::{Arc, Mutex};

    /// Recorded operation call
    #[derive(Clone, Debug, PartialEq)]
    pub enum ResticCall {
        Init { repository: PathBuf },
        Verify { repository: PathBuf },
        Backup { paths: Vec<PathBuf> },
        ApplyRetention,
        ListSnapshots,
        ListFiles { snapshot_id: String, directory: PathBuf },
        Restore { snapshot_id: String, target: PathBuf },
        Mount { snapshot_id: String, mountpoint: PathBuf },
        Unmount { mountpoint: PathBuf },
        Stats,
    }

    #[derive(serde::Serialize, serde::Deserialize)]
    struct RepoConfig {
        password: String,
    }

    #[derive(serde::Serialize)]
    struct SnapshotRecord<'a> {
        id: &'a str,
        short_id: &'a str,
        time: String,
        hostname: &'a str,
        paths: Vec<String>,
        summary: SummaryRecord,
    }

    #[derive(serde::Serialize)]
    struct SummaryRecord {
        total_bytes_processed: u64,
    }

    /// Mock restic operations for testing
    #[derive(Clone, Default)]
    pub struct MockResticOps {
        /// Recorded operation calls
        pub calls: Arc<Mutex<Vec<ResticCall>>>,
        /// Storage locations that currently fail as if unreachable
        offline: Arc<Mutex<HashSet<PathBuf>>>,
        /// Delay inserted before every backup and restore completes
        delay: Arc<Mutex<Duration>>,
        /// Whether restore should fail
        should_fail_restore: Arc<Mutex<bool>>,
        /// Whether retention should fail
        should_fail_retention: Arc<Mutex<bool>>,
        last_time: Arc<Mutex<Option<DateTime<Utc>>>>,
        counter: Arc<Mutex<u64>>,
    }

    impl MockResticOps {
        pub fn new() -> Self {
            Self::default()
        }

        /// Slow down backup and restore so tests can observe them in flight
        pub fn with_delay(self, delay: Duration) -> Self {
            *lock(&self.delay) = delay;
            self
        }

        /// Configure restore to fail
        pub fn with_failing_restore(self) -> Self {
            *lock(&self.should_fail_restore) = true;
            self
        }

        /// Configure retention to fail
        pub fn with_failing_retention(self) -> Self {
            *lock(&self.should_fail_retention) = true;
            self
        }

        /// Make every repository under `location` unreachable (or reachable again)
        pub fn set_offline(&self, location: &Path, offline: bool) {
            let mut set = lock(&self.offline);
            if offline {
                set.insert(location.to_path_buf());
            } else {
                set.remove(location);
            }
        }

        /// Get all recorded calls
        pub fn get_calls(&self) -> Vec<ResticCall> {
            lock(&self.calls).clone()
        }

        pub fn backup_count(&self) -> usize {
            lock(&self.calls)
                .iter()
                .filter(|c| matches!(c, ResticCall::Backup { .. }))
                .count()
        }

        pub fn retention_called(&self) -> bool {
            lock(&self.calls)
                .iter()
                .any(|c| matches!(c, ResticCall::ApplyRetention))
        }

        fn record_call(&self, call: ResticCall) {
            lock(&self.calls).push(call);
        }

        fn delay(&self) -> Duration {
            *lock(&self.delay)
        }

        fn repository(&self, env: &ResticEnv) -> Result<PathBuf> {
            let repository = PathBuf::from(env.repository().context("RESTIC_REPOSITORY not set")?);
            if lock(&self.offline).iter().any(|p| repository.starts_with(p)) {
                anyhow::bail!(
                    "Fatal: unable to open repository at {}: stat {}: host is down",
                    repository.display(),
                    repository.display()
                );
            }
            Ok(repository)
        }

        /// Open an initialized repository and check the password
        fn open(&self, env: &ResticEnv) -> Result<PathBuf> {
            let repository = self.repository(env)?;
            let contents = fs::read_to_string(repository.join("config.json")).map_err(|_| {
                anyhow::anyhow!(
                    "Fatal: unable to open config file: stat {}/config: no such file or directory\nIs there a repository at the following location?\n{}",
                    repository.display(),
                    repository.display()
                )
            })?;
            let config: RepoConfig = serde_json::from_str(&contents)?;
            if Some(config.password.as_str()) != env.password() {
                anyhow::bail!("Fatal: wrong password or no key found");
            }
            Ok(repository)
        }

        fn next_time(&self) -> DateTime<Utc> {
            let mut last = lock(&self.last_time);
            let mut now = Utc::now();
            if let Some(previous) = *last {
                if now.timestamp_millis() <= previous.timestamp_millis() {
                    now = previous + chrono::Duration::milliseconds(1);
                }
            }
            *last = Some(now);
            now
        }

        fn next_id(&self, repository: &Path, time: &DateTime<Utc>) -> String {
            let mut counter = lock(&self.counter);
            *counter += 1;
            let mut hasher = Sha256::new();
            hasher.update(repository.display().to_string());
            hasher.update(time.to_rfc3339());
            hasher.update(counter.to_string());
            format!("{:x}", hasher.finalize())
        }

        fn find_snapshot(repository: &Path, snapshot_id: &str) -> Result<PathBuf> {
            let snapshots = repository.join("snapshots");
            if let Ok(entries) = fs::read_dir(&snapshots) {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name.starts_with(snapshot_id) || snapshot_id.starts_with(&name) {
                        return Ok(entry.path());
                    }
                }
            }
            anyhow::bail!("Fatal: no matching ID found for prefix \"{}\"", snapshot_id)
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tree_path(snapshot_dir: &Path, source: &Path) -> PathBuf {
        snapshot_dir
            .join("tree")
            .join(source.strip_prefix("/").unwrap_or(source))
    }

    fn read_excludes(exclude_file: &Path) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        if let Ok(contents) = fs::read_to_string(exclude_file) {
            for line in contents.lines().map(str::trim) {
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                builder.add(GlobBuilder::new(line).literal_separator(true).build()?);
            }
        }
        Ok(builder.build()?)
    }

    /// Copy a directory tree, skipping excluded paths; returns bytes copied.
    /// Entries that vanish mid-copy are skipped, as restic does.
    fn copy_tree(source: &Path, target: &Path, excludes: Option<&GlobSet>) -> Result<u64> {
        fs::create_dir_all(target)?;
        let entries = match fs::read_dir(source) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut copied = 0;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if excludes.map(|set| set.is_match(&path)).unwrap_or(false) {
                continue;
            }
            let destination = target.join(entry.file_name());
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                copied += copy_tree(&path, &destination, excludes)?;
                continue;
            }
            let result = if file_type.is_symlink() {
                fs::read_link(&path)
                    .and_then(|link| std::os::unix::fs::symlink(link, &destination))
                    .map(|_| 0)
            } else {
                fs::copy(&path, &destination)
            };
            match result {
                Ok(bytes) => copied += bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(copied)
    }

    fn tree_size(path: &Path) -> u64 {
        let Ok(entries) = fs::read_dir(path) else {
            return 0;
        };
        entries
            .flatten()
            .map(|entry| match entry.file_type() {
                Ok(t) if t.is_dir() => tree_size(&entry.path()),
                Ok(t) if t.is_file() => entry.metadata().map(|m| m.len()).unwrap_or(0),
                _ => 0,
            })
            .sum()
    }

    #[async_trait]
    impl ResticOperations for MockResticOps {
        async fn init_repository(&self, env: &ResticEnv) -> Result<()> {
            let repository = self.repository(env)?;
            self.record_call(ResticCall::Init {
                repository: repository.clone(),
            });
            let config = RepoConfig {
                password: env.password().unwrap_or_default().to_string(),
            };
            fs::create_dir_all(repository.join("snapshots"))?;
            fs::write(repository.join("config.json"), serde_json::to_vec(&config)?)?;
            Ok(())
        }

        async fn verify_repository(&self, env: &ResticEnv) -> Result<()> {
            let repository = self.open(env)?;
            self.record_call(ResticCall::Verify { repository });
            Ok(())
        }

        async fn backup(
            &self,
            env: &ResticEnv,
            paths: &[PathBuf],
            exclude_file: &Path,
            on_progress: ProgressSink<'_>,
        ) -> Result<String> {
            self.record_call(ResticCall::Backup {
                paths: paths.to_vec(),
            });
            let repository = self.open(env)?;
            let excludes = read_excludes(exclude_file)?;

            on_progress(ToolProgress::default());
            tokio::time::sleep(self.delay()).await;

            let time = self.next_time();
            let id = self.next_id(&repository, &time);
            let short_id = &id[..8];
            let snapshot_dir = repository.join("snapshots").join(&id);

            let mut total = 0;
            for path in paths {
                total += copy_tree(path, &tree_path(&snapshot_dir, path), Some(&excludes))?;
                on_progress(ToolProgress {
                    percent: 50.0,
                    bytes_done: total,
                    ..Default::default()
                });
            }

            let record = SnapshotRecord {
                id: &id,
                short_id,
                time: time.to_rfc3339_opts(chrono::SecondsFormat::Nanos, false),
                hostname: "homeserver",
                paths: paths.iter().map(|p| p.display().to_string()).collect(),
                summary: SummaryRecord {
                    total_bytes_processed: total,
                },
            };
            fs::write(snapshot_dir.join("snapshot.json"), serde_json::to_vec(&record)?)?;

            on_progress(ToolProgress {
                percent: 100.0,
                bytes_done: total,
                total_bytes: total,
                ..Default::default()
            });
            Ok(id)
        }

        async fn apply_retention(&self, env: &ResticEnv, _retention: &RetentionPolicy) -> Result<()> {
            self.record_call(ResticCall::ApplyRetention);
            self.open(env)?;
            if *lock(&self.should_fail_retention) {
                anyhow::bail!("Mock retention failure");
            }
            Ok(())
        }

        async fn list_snapshots(&self, env: &ResticEnv) -> Result<Vec<Snapshot>> {
            self.record_call(ResticCall::ListSnapshots);
            let repository = self.open(env)?;

            let mut snapshots = Vec::new();
            for entry in fs::read_dir(repository.join("snapshots"))?.flatten() {
                let Ok(contents) = fs::read_to_string(entry.path().join("snapshot.json")) else {
                    continue;
                };
                let mut snapshot: Snapshot = serde_json::from_str(&contents)?;
                if snapshot.summary.is_none() {
                    snapshot.summary = Some(SnapshotSummary::default());
                }
                snapshots.push(snapshot);
            }
            snapshots.sort_by(|a, b| a.time.cmp(&b.time));
            Ok(snapshots)
        }

        async fn list_snapshot_files(
            &self,
            env: &ResticEnv,
            snapshot_id: &str,
            directory: &Path,
        ) -> Result<Vec<String>> {
            self.record_call(ResticCall::ListFiles {
                snapshot_id: snapshot_id.to_string(),
                directory: directory.to_path_buf(),
            });
            let repository = self.open(env)?;
            let snapshot_dir = Self::find_snapshot(&repository, snapshot_id)?;

            let mut names: Vec<String> = match fs::read_dir(tree_path(&snapshot_dir, directory)) {
                Ok(entries) => entries
                    .flatten()
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .collect(),
                Err(_) => Vec::new(),
            };
            names.sort();
            Ok(names)
        }

        async fn restore_snapshot(
            &self,
            env: &ResticEnv,
            snapshot_id: &str,
            source: &Path,
            target: &Path,
            on_progress: ProgressSink<'_>,
        ) -> Result<()> {
            self.record_call(ResticCall::Restore {
                snapshot_id: snapshot_id.to_string(),
                target: target.to_path_buf(),
            });
            let repository = self.open(env)?;
            let snapshot_dir = Self::find_snapshot(&repository, snapshot_id)?;
            let tree = tree_path(&snapshot_dir, source);
            let total = tree_size(&tree);

            on_progress(ToolProgress {
                total_bytes: total,
                ..Default::default()
            });
            tokio::time::sleep(self.delay()).await;

            if *lock(&self.should_fail_restore) {
                fs::create_dir_all(target)?;
                fs::write(target.join("partial"), b"partial")?;
                anyhow::bail!("Mock restore failure");
            }

            let copied = copy_tree(&tree, target, None)?;
            on_progress(ToolProgress {
                percent: 100.0,
                bytes_done: copied,
                total_bytes: total,
                bytes_per_second: Some(copied),
                seconds_remaining: Some(0),
            });
            Ok(())
        }

        async fn mount_snapshot(
            &self,
            env: &ResticEnv,
            snapshot_id: &str,
            source: &Path,
            mountpoint: &Path,
        ) -> Result<PathBuf> {
            self.record_call(ResticCall::Mount {
                snapshot_id: snapshot_id.to_string(),
                mountpoint: mountpoint.to_path_buf(),
            });
            let repository = self.open(env)?;
            let snapshot_dir = Self::find_snapshot(&repository, snapshot_id)?;
            let short_id: String = snapshot_id.chars().take(8).collect();

            let exposed = mountpoint
                .join("ids")
                .join(short_id)
                .join(source.strip_prefix("/").unwrap_or(source));
            copy_tree(&tree_path(&snapshot_dir, source), &exposed, None)?;
            Ok(exposed)
        }

        async fn unmount(&self, mountpoint: &Path) -> Result<()> {
            self.record_call(ResticCall::Unmount {
                mountpoint: mountpoint.to_path_buf(),
            });
            let ids = mountpoint.join("ids");
            if ids.exists() {
                fs::remove_dir_all(ids)?;
            }
            Ok(())
        }

        async fn raw_data_size(&self, env: &ResticEnv) -> Result<u64> {
            self.record_call(ResticCall::Stats);
            let repository = self.open(env)?;
            Ok(tree_size(&repository))
        }
    }
}
