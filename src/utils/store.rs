//! JSON state files shared by the repository registry, the ignore list and
//! the notification store
//!
//! File locks block, so every entry point hops onto the blocking pool.

use super::locker::with_exclusive_lock;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

async fn blocking<R, F>(f: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("State file task panicked")?
}

/// Read a JSON file, falling back to `T::default()` when it does not exist
pub async fn read_json<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default + Send + 'static,
{
    let path = path.to_path_buf();
    blocking(move || read_file(&path)).await
}

/// Read-modify-write a JSON file under its file lock
pub async fn update_json<T, R, F>(path: &Path, f: F) -> Result<R>
where
    T: Serialize + DeserializeOwned + Default,
    R: Send + 'static,
    F: FnOnce(&mut T) -> Result<R> + Send + 'static,
{
    let path = path.to_path_buf();
    blocking(move || update_file(&path, f)).await
}

/// Replace `path` with `contents` in one rename
pub async fn write_atomic(path: &Path, contents: Vec<u8>) -> Result<()> {
    let path = path.to_path_buf();
    blocking(move || write_file_atomic(&path, &contents)).await
}

fn read_file<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match fs::read_to_string(path) {
        Ok(contents) if contents.trim().is_empty() => Ok(T::default()),
        Ok(contents) => serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

fn update_file<T, R>(path: &Path, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R>
where
    T: Serialize + DeserializeOwned + Default,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    with_exclusive_lock(&lock_path(path), || {
        let mut value: T = read_file(path)?;
        let result = f(&mut value)?;
        let contents = serde_json::to_vec_pretty(&value)?;
        write_file_atomic(path, &contents)?;
        Ok(result)
    })
}

/// Every writer gets its own temporary sibling, so concurrent writers of the
/// same file never rename each other's data away
fn write_file_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temporary file in {}", parent.display()))?;
    temp.write_all(contents)
        .with_context(|| format!("Failed to write {}", temp.path().display()))?;
    temp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}
