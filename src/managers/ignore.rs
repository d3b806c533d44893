//! Exclusion rules for backup runs
//!
//! Three layers, later layers only add:
//! 1. fixed directories inside the data directory that never hold user data
//! 2. the user's ignore list (virtual paths under `/Home`)
//! 3. per-app globs from each app manifest, relative to the app's data dir

use crate::error::{BackupError, Result};
use crate::utils::layout::{
    normalize_system_path, normalize_virtual_path, DataLayout, APP_STORES_DIR,
    INTERNAL_MOUNTS_DIR, STAGING_DIR, THUMBNAILS_DIR,
};
use crate::utils::store;
use globset::GlobBuilder;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// File inside an app's data directory describing the app
pub const APP_MANIFEST: &str = "manifest.yml";

/// Data directory entries that are never backed up
const FIXED_EXCLUSIONS: &[&str] = &[
    APP_STORES_DIR,
    "external",
    "network",
    THUMBNAILS_DIR,
    STAGING_DIR,
    "import",
    INTERNAL_MOUNTS_DIR,
    "backups",
];

/// The part of an app manifest the backup engine cares about
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppManifest {
    #[serde(default)]
    pub id: String,
    /// Globs relative to the app's data directory
    #[serde(default)]
    pub backup_ignore: Vec<String>,
    /// Leave the whole app out of backups
    #[serde(default)]
    pub backup_exclude: bool,
}

pub struct IgnoreRuleCompiler {
    layout: DataLayout,
    lock: Mutex<()>,
}

impl IgnoreRuleCompiler {
    pub fn new(layout: DataLayout) -> Self {
        Self {
            layout,
            lock: Mutex::new(()),
        }
    }

    /// User ignore list in insertion order
    pub async fn ignored_paths(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        Ok(store::read_json(&self.layout.ignore_list_file()).await?)
    }

    pub async fn add_ignored_path(&self, path: &str) -> Result<()> {
        let path = validate_home_path(path)?;
        let _guard = self.lock.lock().await;
        let entry = path.clone();
        store::update_json(&self.layout.ignore_list_file(), move |list: &mut Vec<String>| {
            if !list.contains(&entry) {
                list.push(entry);
            }
            Ok(())
        })
        .await?;
        info!("Excluding {} from backups", path);
        Ok(())
    }

    pub async fn remove_ignored_path(&self, path: &str) -> Result<()> {
        let path = validate_home_path(path)?;
        let _guard = self.lock.lock().await;
        let entry = path.clone();
        store::update_json(&self.layout.ignore_list_file(), move |list: &mut Vec<String>| {
            list.retain(|p| p != &entry);
            Ok(())
        })
        .await?;
        info!("Including {} in backups again", path);
        Ok(())
    }

    /// Every exclusion for the next run as an absolute system path or glob
    pub async fn compile(&self) -> Result<Vec<String>> {
        let data_dir = self.layout.data_directory();
        let mut rules: Vec<String> = FIXED_EXCLUSIONS
            .iter()
            .map(|name| data_dir.join(name).display().to_string())
            .collect();

        let user_paths = self.ignored_paths().await.unwrap_or_else(|e| {
            error!("Failed to read ignored paths: {}", e);
            Vec::new()
        });
        for path in user_paths {
            match self.layout.virtual_to_system(&path) {
                Ok(system_path) => rules.push(system_path.display().to_string()),
                Err(e) => error!("Failed to get system path for ignored path {}: {}", path, e),
            }
        }

        rules.extend(self.app_rules().await);

        let mut seen = std::collections::HashSet::new();
        rules.retain(|rule| seen.insert(rule.clone()));
        Ok(rules)
    }

    /// Render the rules into the exclude file restic reads for a backup of
    /// `repository_id`. Each repository has its own file, so backups to
    /// different repositories can run side by side.
    pub async fn write_exclude_file(&self, repository_id: &str) -> Result<PathBuf> {
        let rules = self.compile().await?;
        let path = self.layout.exclude_file(repository_id);

        let mut contents = rules.join("\n");
        contents.push('\n');
        store::write_atomic(&path, contents.into_bytes()).await?;

        debug!("Wrote {} exclusion rules to {:?}", rules.len(), path);
        Ok(path)
    }

    async fn app_rules(&self) -> Vec<String> {
        let app_data = self.layout.app_data();
        let mut entries = match tokio::fs::read_dir(&app_data).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("No app data directory at {:?}: {}", app_data, e);
                return Vec::new();
            }
        };

        let mut rules = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to list apps: {}", e);
                    break;
                }
            };
            let app_dir = entry.path();
            let manifest_path = app_dir.join(APP_MANIFEST);
            if !manifest_path.is_file() {
                continue;
            }

            // A broken app must not break the whole backup
            let manifest = match read_manifest(&manifest_path).await {
                Ok(manifest) => manifest,
                Err(e) => {
                    error!("Failed to read manifest {:?}: {}", manifest_path, e);
                    continue;
                }
            };
            let app_id = if manifest.id.is_empty() {
                entry.file_name().to_string_lossy().to_string()
            } else {
                manifest.id.clone()
            };

            if manifest.backup_exclude {
                info!("App {} is excluded from backups", app_id);
                rules.push(app_dir.display().to_string());
                continue;
            }

            for pattern in &manifest.backup_ignore {
                match sanitize_app_pattern(&app_dir, pattern) {
                    Some(rule) => rules.push(rule),
                    None => error!(
                        "Invalid backupIgnore path {} for app {}, skipping",
                        pattern, app_id
                    ),
                }
            }
        }
        rules
    }
}

async fn read_manifest(path: &Path) -> anyhow::Result<AppManifest> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(serde_yaml::from_str(&contents)?)
}

/// Normalize a user path and require it to be `/Home` or below
pub fn validate_home_path(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(BackupError::NotInHome(path.to_string()));
    }
    let normalized = normalize_virtual_path(path);
    if normalized == "/Home" || normalized.starts_with("/Home/") {
        Ok(normalized)
    } else {
        Err(BackupError::NotInHome(path.to_string()))
    }
}

/// Turn an app-relative glob into an absolute one, or `None` if it is unsafe
pub fn sanitize_app_pattern(app_dir: &Path, pattern: &str) -> Option<String> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '/' | '*');
    if pattern.is_empty() || !pattern.chars().all(allowed) {
        return None;
    }

    let joined = normalize_system_path(&app_dir.join(pattern.trim_start_matches('/')));
    if !joined.starts_with(app_dir) || joined == app_dir {
        return None;
    }

    let rule = joined.display().to_string();
    GlobBuilder::new(&rule).literal_separator(true).build().ok()?;
    Some(rule)
}
