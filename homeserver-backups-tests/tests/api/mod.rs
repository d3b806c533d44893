//! Tests for the authenticated operation surface
//!
//! Every test drives [`BackupsApi`] against a throwaway data directory with
//! the mock restic and host operations underneath.

mod backups;
mod ignore;
mod repositories;
mod restore;

use homeserver_backups::BackupsApi;
use test_utils::{token, TestContext, TEST_PASSWORD};

/// A context with one repository on an external drive
pub async fn with_repository() -> (TestContext, BackupsApi, String) {
    let ctx = TestContext::new();
    let api = ctx.api();
    let drive = ctx.create_external_drive("SanDisk");
    let id = api
        .create_repository(token(), &drive, TEST_PASSWORD)
        .await
        .expect("Failed to create repository");
    (ctx, api, id)
}

/// Like [`with_repository`] with one backup taken of some user files
pub async fn with_backup() -> (TestContext, BackupsApi, String, String) {
    let (ctx, api, id) = with_repository().await;
    ctx.write_file("home/Documents/notes.txt", "remember the milk");
    ctx.write_file("app-data/photos/library.db", "photos");
    api.backup(token(), &id).await.expect("Failed to back up");

    let backups = api.list_backups(token(), &id).await.expect("Failed to list backups");
    let backup_id = backups.last().expect("no backup").id.clone();
    (ctx, api, id, backup_id)
}
