//! Authenticated operation surface over the backup engine
//!
//! Every call takes the caller's token. Most calls require a valid one. A few
//! are also open while no user account exists yet, so a fresh device can be
//! restored from an existing repository during setup.

use crate::config::AuthConfig;
use crate::error::{BackupError, Result};
use crate::managers::backup::{Backup, Backups, RepositorySize};
use crate::managers::progress::{BackupProgress, RestoreStatus, Subscription};
use crate::managers::repository::RepositorySummary;
use crate::managers::restore::RestoreOrchestrator;
use std::sync::Arc;
use tracing::debug;

/// Decides who may call the API
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> bool;

    /// False until the first user account is set up
    fn user_exists(&self) -> bool;
}

/// Single shared token from the `[auth]` config section
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.api_token.clone())
    }
}

impl TokenVerifier for StaticToken {
    fn verify(&self, token: &str) -> bool {
        !self.token.is_empty() && self.token == token
    }

    fn user_exists(&self) -> bool {
        !self.token.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Private,
    /// Private once a user exists
    PublicWhenNoUser,
}

pub struct BackupsApi {
    backups: Arc<Backups>,
    restore: Arc<RestoreOrchestrator>,
    auth: Arc<dyn TokenVerifier>,
}

impl BackupsApi {
    pub fn new(
        backups: Arc<Backups>,
        restore: Arc<RestoreOrchestrator>,
        auth: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self {
            backups,
            restore,
            auth,
        }
    }

    fn authorize(&self, token: Option<&str>, access: Access) -> Result<()> {
        if token.map(|t| self.auth.verify(t)).unwrap_or(false) {
            return Ok(());
        }
        if access == Access::PublicWhenNoUser && !self.auth.user_exists() {
            debug!("Allowing unauthenticated call during setup");
            return Ok(());
        }
        Err(BackupError::InvalidToken)
    }

    pub async fn create_repository(&self, token: Option<&str>, path: &str, password: &str) -> Result<String> {
        self.authorize(token, Access::Private)?;
        self.backups.create_repository(path, password).await
    }

    pub async fn connect_to_existing_repository(
        &self,
        token: Option<&str>,
        path: &str,
        password: &str,
    ) -> Result<String> {
        self.authorize(token, Access::PublicWhenNoUser)?;
        self.backups.connect_to_existing_repository(path, password).await
    }

    pub async fn get_repositories(&self, token: Option<&str>) -> Result<Vec<RepositorySummary>> {
        self.authorize(token, Access::Private)?;
        self.backups.get_repositories().await
    }

    pub async fn forget_repository(&self, token: Option<&str>, repository_id: &str) -> Result<bool> {
        self.authorize(token, Access::Private)?;
        self.backups.forget_repository(repository_id).await?;
        Ok(true)
    }

    pub async fn get_repository_size(&self, token: Option<&str>, repository_id: &str) -> Result<RepositorySize> {
        self.authorize(token, Access::Private)?;
        self.backups.repository_size(repository_id).await
    }

    pub async fn backup(&self, token: Option<&str>, repository_id: &str) -> Result<bool> {
        self.authorize(token, Access::Private)?;
        self.backups.backup(repository_id).await?;
        Ok(true)
    }

    pub fn backup_progress(&self, token: Option<&str>) -> Result<Vec<BackupProgress>> {
        self.authorize(token, Access::Private)?;
        Ok(self.backups.backup_progress())
    }

    pub async fn list_backups(&self, token: Option<&str>, repository_id: &str) -> Result<Vec<Backup>> {
        self.authorize(token, Access::PublicWhenNoUser)?;
        self.backups.list_backups(repository_id).await
    }

    pub async fn list_all_backups(&self, token: Option<&str>) -> Result<Vec<Backup>> {
        self.authorize(token, Access::Private)?;
        self.backups.list_all_backups().await
    }

    pub async fn list_backup_files(
        &self,
        token: Option<&str>,
        backup_id: &str,
        path: Option<&str>,
    ) -> Result<Vec<String>> {
        self.authorize(token, Access::Private)?;
        self.backups.list_backup_files(backup_id, path).await
    }

    pub async fn mount_backup(&self, token: Option<&str>, backup_id: &str) -> Result<String> {
        self.authorize(token, Access::Private)?;
        self.backups.mount_backup(backup_id).await
    }

    pub async fn unmount_backup(&self, token: Option<&str>, directory_name: &str) -> Result<bool> {
        self.authorize(token, Access::Private)?;
        self.backups.unmount_backup(directory_name).await?;
        Ok(true)
    }

    pub async fn get_ignored_paths(&self, token: Option<&str>) -> Result<Vec<String>> {
        self.authorize(token, Access::Private)?;
        self.backups.ignore().ignored_paths().await
    }

    pub async fn add_ignored_path(&self, token: Option<&str>, path: &str) -> Result<bool> {
        self.authorize(token, Access::Private)?;
        self.backups.ignore().add_ignored_path(path).await?;
        Ok(true)
    }

    pub async fn remove_ignored_path(&self, token: Option<&str>, path: &str) -> Result<bool> {
        self.authorize(token, Access::Private)?;
        self.backups.ignore().remove_ignored_path(path).await?;
        Ok(true)
    }

    pub async fn restore_backup(&self, token: Option<&str>, backup_id: &str) -> Result<()> {
        self.authorize(token, Access::PublicWhenNoUser)?;
        self.restore.restore(backup_id).await
    }

    pub fn restore_status(&self, token: Option<&str>) -> Result<RestoreStatus> {
        self.authorize(token, Access::PublicWhenNoUser)?;
        Ok(self.restore.status())
    }

    /// Live progress events
    pub fn subscribe(&self, token: Option<&str>) -> Result<Subscription> {
        self.authorize(token, Access::PublicWhenNoUser)?;
        Ok(self.backups.events().subscribe())
    }
}
