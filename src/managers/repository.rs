//! Persistent registry of backup repositories
//!
//! Each repository is identified by a short hash of its virtual path, so the
//! same location always yields the same id. The registry is a JSON file under
//! `<data>/db/backups/`, rewritten atomically under a file lock.

use crate::error::{BackupError, Result};
use crate::utils::store;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Directory created inside the user-chosen location to hold a repository
pub const REPOSITORY_CONTAINER: &str = "Home Server Backup.backup";

/// A registered repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: String,
    /// Virtual path of the repository container
    pub path: String,
    /// Credential derived from the user's password, never the password itself
    pub password: String,
    /// Milliseconds since the Unix epoch of the last successful backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup: Option<i64>,
}

/// What callers outside the engine get to see of a repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySummary {
    pub id: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_backup: Option<i64>,
}

impl From<&Repository> for RepositorySummary {
    fn from(repository: &Repository) -> Self {
        Self {
            id: repository.id.clone(),
            path: repository.path.clone(),
            last_backup: repository.last_backup,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Registry {
    repositories: Vec<Repository>,
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stable 8 hex character id for a repository path
pub fn repository_id(virtual_path: &str) -> String {
    sha256_hex(virtual_path)[..8].to_string()
}

/// Credential handed to restic for a user password
pub fn derive_password(password: &str) -> String {
    sha256_hex(password)[..16].to_string()
}

pub struct RepositoryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RepositoryStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// All registered repositories in insertion order
    pub async fn list(&self) -> Result<Vec<Repository>> {
        let _guard = self.lock.lock().await;
        let registry: Registry = store::read_json(&self.path).await?;
        Ok(registry.repositories)
    }

    pub async fn get(&self, id: &str) -> Result<Repository> {
        self.list()
            .await?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| BackupError::RepositoryNotFound(id.to_string()))
    }

    /// Add a repository; an existing entry with the same id is left untouched
    pub async fn insert(&self, repository: Repository) -> Result<()> {
        let _guard = self.lock.lock().await;
        let id = repository.id.clone();
        let added = store::update_json(&self.path, move |registry: &mut Registry| {
            if registry.repositories.iter().any(|r| r.id == repository.id) {
                return Ok(false);
            }
            registry.repositories.push(repository);
            Ok(true)
        })
        .await?;

        if added {
            info!("Registered repository {}", id);
        } else {
            debug!("Repository {} already registered", id);
        }
        Ok(())
    }

    /// Remove a repository from the registry
    pub async fn remove(&self, id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let target = id.to_string();
        let removed = store::update_json(&self.path, move |registry: &mut Registry| {
            let before = registry.repositories.len();
            registry.repositories.retain(|r| r.id != target);
            Ok(before != registry.repositories.len())
        })
        .await?;

        if !removed {
            return Err(BackupError::RepositoryNotFound(id.to_string()));
        }
        info!("Forgot repository {}", id);
        Ok(())
    }

    /// Record a successful backup
    pub async fn set_last_backup(&self, id: &str, timestamp_ms: i64) -> Result<()> {
        let _guard = self.lock.lock().await;
        let target = id.to_string();
        let found = store::update_json(&self.path, move |registry: &mut Registry| {
            match registry.repositories.iter_mut().find(|r| r.id == target) {
                Some(repository) => {
                    repository.last_backup = Some(timestamp_ms);
                    Ok(true)
                }
                None => Ok(false),
            }
        })
        .await?;

        if !found {
            return Err(BackupError::RepositoryNotFound(id.to_string()));
        }
        Ok(())
    }
}
