//! Host operations the orchestrator needs beyond restic: free space, bind
//! mounts and rebooting into a restored system.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

const MOUNT_TIMEOUT: Duration = Duration::from_secs(30);

/// Space on the filesystem holding a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub capacity: u64,
    pub available: u64,
}

#[async_trait]
pub trait SystemOperations: Send + Sync {
    async fn disk_usage(&self, path: &Path) -> Result<DiskUsage>;

    /// Make `source` visible at `target` (which must exist)
    async fn bind_mount(&self, source: &Path, target: &Path) -> Result<()>;

    async fn unmount(&self, target: &Path) -> Result<()>;

    async fn reboot(&self) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct RealSystemOps;

impl RealSystemOps {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SystemOperations for RealSystemOps {
    async fn disk_usage(&self, path: &Path) -> Result<DiskUsage> {
        let path = path.to_path_buf();
        let stats = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(&path))
            .await
            .context("statvfs task panicked")?
            .context("Failed to query filesystem usage")?;

        let fragment = stats.fragment_size() as u64;
        Ok(DiskUsage {
            capacity: stats.blocks() as u64 * fragment,
            available: stats.blocks_available() as u64 * fragment,
        })
    }

    async fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        let source = source.display().to_string();
        let target = target.display().to_string();
        super::command::run_command(
            "mount",
            &["--bind", source.as_str(), target.as_str()],
            MOUNT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        let target = target.display().to_string();
        super::command::run_command("umount", &[target.as_str()], MOUNT_TIMEOUT).await?;
        Ok(())
    }

    async fn reboot(&self) -> Result<()> {
        info!("Rebooting system");
        super::command::run_command("reboot", &[], MOUNT_TIMEOUT).await?;
        Ok(())
    }
}

/// Mock implementation for testing
/// Available for use in external test crates
pub mod mock {
    use super::*;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Debug, PartialEq)]
    pub enum SystemCall {
        DiskUsage { path: PathBuf },
        BindMount { source: PathBuf, target: PathBuf },
        Unmount { target: PathBuf },
        Reboot,
    }

    /// Bind mounts become symlinks; disk space is whatever the test says
    #[derive(Clone)]
    pub struct MockSystemOps {
        pub calls: Arc<Mutex<Vec<SystemCall>>>,
        usage: Arc<Mutex<DiskUsage>>,
    }

    impl Default for MockSystemOps {
        fn default() -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                usage: Arc::new(Mutex::new(DiskUsage {
                    capacity: 2u64 << 40,
                    available: 1u64 << 40,
                })),
            }
        }
    }

    impl MockSystemOps {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_available_space(self, available: u64) -> Self {
            self.set_available_space(available);
            self
        }

        pub fn set_available_space(&self, available: u64) {
            lock(&self.usage).available = available;
        }

        pub fn get_calls(&self) -> Vec<SystemCall> {
            lock(&self.calls).clone()
        }

        pub fn reboot_count(&self) -> usize {
            lock(&self.calls)
                .iter()
                .filter(|c| matches!(c, SystemCall::Reboot))
                .count()
        }

        fn record_call(&self, call: SystemCall) {
            lock(&self.calls).push(call);
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[async_trait]
    impl SystemOperations for MockSystemOps {
        async fn disk_usage(&self, path: &Path) -> Result<DiskUsage> {
            self.record_call(SystemCall::DiskUsage {
                path: path.to_path_buf(),
            });
            Ok(*lock(&self.usage))
        }

        async fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
            self.record_call(SystemCall::BindMount {
                source: source.to_path_buf(),
                target: target.to_path_buf(),
            });
            std::fs::remove_dir(target).context("bind target must be an empty directory")?;
            std::os::unix::fs::symlink(source, target)?;
            Ok(())
        }

        async fn unmount(&self, target: &Path) -> Result<()> {
            self.record_call(SystemCall::Unmount {
                target: target.to_path_buf(),
            });
            match std::fs::symlink_metadata(target) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    std::fs::remove_file(target)?;
                    Ok(())
                }
                Ok(_) => anyhow::bail!("umount: {}: not mounted", target.display()),
                Err(e) => {
                    warn!("umount: {}: {}", target.display(), e);
                    Err(e.into())
                }
            }
        }

        async fn reboot(&self) -> Result<()> {
            self.record_call(SystemCall::Reboot);
            Ok(())
        }
    }
}
