//! Locking: in-process guards that keep one backup per repository in flight,
//! and file locks that serialize writers of the persisted state.

use anyhow::{Context, Result};
use fd_lock::RwLock;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Set of repositories with an operation in flight
#[derive(Clone, Default)]
pub struct RepositoryLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl RepositoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a repository; `None` if it is already claimed
    pub fn try_acquire(&self, repository_id: &str) -> Option<RepositoryLock> {
        let mut held = lock_set(&self.held);
        if !held.insert(repository_id.to_string()) {
            return None;
        }

        debug!("Acquired in-flight lock for repository {}", repository_id);
        Some(RepositoryLock {
            held: Arc::clone(&self.held),
            repository_id: repository_id.to_string(),
        })
    }

    pub fn is_held(&self, repository_id: &str) -> bool {
        lock_set(&self.held).contains(repository_id)
    }
}

/// Released on drop
pub struct RepositoryLock {
    held: Arc<Mutex<HashSet<String>>>,
    repository_id: String,
}

impl Drop for RepositoryLock {
    fn drop(&mut self) {
        lock_set(&self.held).remove(&self.repository_id);
        debug!("Released in-flight lock for repository {}", self.repository_id);
    }
}

fn lock_set(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}

/// Run `f` while holding an exclusive lock on `lock_path`, blocking until the
/// lock is free. Other processes writing the same state take the same lock.
pub fn with_exclusive_lock<R>(lock_path: &Path, f: impl FnOnce() -> Result<R>) -> Result<R> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create lock directory")?;
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .context(format!("Failed to open lock file: {:?}", lock_path))?;

    let mut lock = RwLock::new(file);
    let _guard = lock
        .write()
        .context(format!("Failed to lock {:?}", lock_path))?;

    f()
}
