//! On-disk layout of the data directory and virtual path resolution
//!
//! Virtual paths (`/Home/Documents`, `/External/SanDisk`) are what users and
//! the API see. They map onto directories under the data directory.

use crate::error::{BackupError, Result};
use std::path::{Component, Path, PathBuf};

/// Top-level virtual directories and the physical directory each maps to
pub const VIRTUAL_ROOTS: &[(&str, &str)] = &[
    ("Home", "home"),
    ("Apps", "app-data"),
    ("Trash", "trash"),
    ("External", "external"),
    ("Network", "network"),
    ("Backups", "backups"),
];

/// Marker written into a staged restore and promoted on next start
pub const FIRST_START_FLAG: &str = ".backup-restore-first-start";

/// Directory names inside the data directory that never hold user data
pub const APP_STORES_DIR: &str = "app-stores";
pub const THUMBNAILS_DIR: &str = "thumbnails";
pub const STAGING_DIR: &str = ".temporary-migration";
pub const IMPORT_DIR: &str = "import";
pub const INTERNAL_MOUNTS_DIR: &str = "backup-mounts";

#[derive(Debug, Clone)]
pub struct DataLayout {
    data_directory: PathBuf,
}

impl DataLayout {
    pub fn new(data_directory: impl Into<PathBuf>) -> Self {
        Self {
            data_directory: data_directory.into(),
        }
    }

    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    /// Physical directory behind a virtual root such as `/Home`
    pub fn base_directory(&self, virtual_root: &str) -> Option<PathBuf> {
        let name = virtual_root.trim_start_matches('/');
        VIRTUAL_ROOTS
            .iter()
            .find(|(root, _)| *root == name)
            .map(|(_, dir)| self.data_directory.join(dir))
    }

    /// Resolve a virtual path to its physical location
    pub fn virtual_to_system(&self, virtual_path: &str) -> Result<PathBuf> {
        if !virtual_path.starts_with('/') || virtual_path.contains('\0') {
            return Err(BackupError::InvalidPath(virtual_path.to_string()));
        }

        let normalized = normalize_virtual_path(virtual_path);
        let mut parts = normalized.trim_start_matches('/').splitn(2, '/');
        let root = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or_default();

        let base = self
            .base_directory(root)
            .ok_or_else(|| BackupError::InvalidPath(virtual_path.to_string()))?;

        if rest.is_empty() {
            Ok(base)
        } else {
            Ok(base.join(rest))
        }
    }

    /// True if the physical path lives on externally attached or network storage
    pub fn is_removable_storage(&self, system_path: &Path) -> bool {
        ["External", "Network"].iter().any(|root| {
            self.base_directory(root)
                .map(|base| system_path.starts_with(&base) && system_path != base)
                .unwrap_or(false)
        })
    }

    pub fn home(&self) -> PathBuf {
        self.data_directory.join("home")
    }

    pub fn app_data(&self) -> PathBuf {
        self.data_directory.join("app-data")
    }

    pub fn backup_root(&self) -> PathBuf {
        self.data_directory.join("backups")
    }

    pub fn internal_mounts(&self) -> PathBuf {
        self.data_directory.join(INTERNAL_MOUNTS_DIR)
    }

    pub fn import_dir(&self) -> PathBuf {
        self.data_directory.join(IMPORT_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_directory.join(STAGING_DIR)
    }

    pub fn first_start_flag(&self) -> PathBuf {
        self.data_directory.join(FIRST_START_FLAG)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_directory.join("db").join("backups")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.state_dir().join("repositories.json")
    }

    pub fn ignore_list_file(&self) -> PathBuf {
        self.state_dir().join("ignored-paths.json")
    }

    /// Exclusion rules handed to restic for backups of one repository
    pub fn exclude_file(&self, repository_id: &str) -> PathBuf {
        self.state_dir().join(format!("exclude-{}.txt", repository_id))
    }

    pub fn notifications_file(&self) -> PathBuf {
        self.data_directory.join("db").join("notifications.json")
    }

    /// Resolve a snapshot-relative path (`/`, `/app-data/foo`) to the absolute
    /// path it was captured from
    pub fn snapshot_path(&self, relative: &str) -> PathBuf {
        let normalized = normalize_virtual_path(relative);
        let trimmed = normalized.trim_start_matches('/');
        if trimmed.is_empty() {
            self.data_directory.clone()
        } else {
            self.data_directory.join(trimmed)
        }
    }
}

/// Lexically normalize an absolute virtual path: collapse `.`, `..`, repeated
/// and trailing separators. `..` never climbs above `/`.
pub fn normalize_virtual_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Lexically normalize a filesystem path without touching the disk
pub fn normalize_system_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
