//! Test fixtures and sample data
//!
//! Provides pre-built test data and templates for testing.

use homeserver_backups::utils::restic::{Snapshot, SnapshotSummary};
use std::time::Duration;

/// Password used for repositories created in tests
pub const TEST_PASSWORD: &str = "correct horse battery staple";

/// Create a sample snapshot for testing
pub fn sample_snapshot() -> Snapshot {
    Snapshot {
        id: "abc123def456789012345678901234567890abcdabc123def45678901234567".to_string(),
        short_id: "abc123de".to_string(),
        time: "2025-12-28T10:30:00.123456789Z".to_string(),
        hostname: "homeserver".to_string(),
        paths: vec!["/srv/data".to_string()],
        summary: Some(SnapshotSummary {
            total_bytes_processed: 4096,
        }),
    }
}

/// App manifest with the given `backupIgnore` globs
pub fn app_manifest(id: &str, backup_ignore: &[&str]) -> String {
    let mut manifest = format!("id: {}\nname: {}\nversion: 1.0.0\n", id, id);
    if !backup_ignore.is_empty() {
        manifest.push_str("backupIgnore:\n");
        for pattern in backup_ignore {
            manifest.push_str(&format!("  - \"{}\"\n", pattern));
        }
    }
    manifest
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
