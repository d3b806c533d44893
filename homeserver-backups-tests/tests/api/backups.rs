//! Backup runs, browsing and mounting through the API

use std::fs;
use std::time::Duration;
use test_utils::{
    token, wait_until, ConfigBuilder, MockResticOps, MockSystemOps, ResultAssertions,
    TestContext, TEST_PASSWORD,
};

#[tokio::test]
async fn test_backup_creates_listed_snapshot() {
    let before = chrono::Utc::now().timestamp_millis();
    let (ctx, api, id, backup_id) = super::with_backup().await;
    let after = chrono::Utc::now().timestamp_millis();

    let backups = api.list_backups(token(), &id).await.assert_ok();
    assert_eq!(backups.len(), 1);
    let backup = &backups[0];
    assert_eq!(backup.id, backup_id);
    assert!(backup.id.starts_with(&format!("{}:", id)));
    assert!(backup.time >= before - 1000 && backup.time <= after + 1000);
    assert!(backup.size > 0);

    let repository = ctx.backups().get_repository(&id).await.assert_ok();
    assert!(repository.last_backup.unwrap() >= before);
    assert!(ctx.restic.retention_called());
}

#[tokio::test]
async fn test_backup_progress_is_empty_when_idle() {
    let (_ctx, api, _id, _backup) = super::with_backup().await;
    assert!(api.backup_progress(token()).assert_ok().is_empty());
}

#[tokio::test]
async fn test_backup_unknown_repository() {
    let ctx = TestContext::new();
    ctx.api()
        .backup(token(), "deadbeef")
        .await
        .assert_err_contains("[not-found]");
    assert_eq!(ctx.restic.backup_count(), 0);
}

#[tokio::test]
async fn test_retention_failure_does_not_fail_backup() {
    let ctx = TestContext::with_mocks(
        ConfigBuilder::new(),
        MockResticOps::new().with_failing_retention(),
        MockSystemOps::new(),
    );
    let api = ctx.api();
    let drive = ctx.create_external_drive("SanDisk");
    let id = api.create_repository(token(), &drive, TEST_PASSWORD).await.assert_ok();

    assert!(api.backup(token(), &id).await.assert_ok());
    assert!(ctx.restic.retention_called());
    assert_eq!(api.list_backups(token(), &id).await.assert_ok().len(), 1);
}

#[tokio::test]
async fn test_concurrent_backup_of_same_repository_is_rejected() {
    let ctx = TestContext::with_mocks(
        ConfigBuilder::new(),
        MockResticOps::new().with_delay(Duration::from_millis(300)),
        MockSystemOps::new(),
    );
    let backups = ctx.backups();
    let drive = ctx.create_external_drive("SanDisk");
    let id = backups.create_repository(&drive, TEST_PASSWORD).await.assert_ok();

    let running = {
        let backups = ctx.backups();
        let id = id.clone();
        tokio::spawn(async move { backups.backup(&id).await })
    };
    assert!(wait_until(Duration::from_secs(2), || backups.is_backing_up(&id)).await);

    let progress = ctx.api().backup_progress(token()).assert_ok();
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0].repository_id, id);

    backups.backup(&id).await.assert_err_contains("[in-progress]");

    running.await.unwrap().assert_ok();
    assert!(!backups.is_backing_up(&id));
    assert_eq!(ctx.restic.backup_count(), 1);
}

#[tokio::test]
async fn test_list_all_backups_across_repositories() {
    let (ctx, api, first, _backup) = super::with_backup().await;
    let share = ctx.create_network_share("nas", "backups");
    let second = api.create_repository(token(), &share, TEST_PASSWORD).await.assert_ok();
    api.backup(token(), &second).await.assert_ok();
    api.backup(token(), &first).await.assert_ok();

    let all = api.list_all_backups(token()).await.assert_ok();
    assert_eq!(all.len(), 3);
    assert!(all.windows(2).all(|w| w[0].time <= w[1].time));
    assert_eq!(all.iter().filter(|b| b.repository_id() == first).count(), 2);
    assert_eq!(all.iter().filter(|b| b.repository_id() == second).count(), 1);
}

#[tokio::test]
async fn test_list_backups_unknown_repository() {
    let ctx = TestContext::new();
    ctx.api()
        .list_backups(token(), "deadbeef")
        .await
        .assert_err_contains("[not-found]");
}

#[tokio::test]
async fn test_list_backup_files() {
    let (_ctx, api, _id, backup_id) = super::with_backup().await;

    let root = api.list_backup_files(token(), &backup_id, None).await.assert_ok();
    assert_eq!(root, vec!["app-data", "db", "home"]);

    let documents = api
        .list_backup_files(token(), &backup_id, Some("/home/Documents"))
        .await
        .assert_ok();
    assert_eq!(documents, vec!["notes.txt"]);

    let missing = api
        .list_backup_files(token(), &backup_id, Some("/home/nothing-here"))
        .await
        .assert_ok();
    assert!(missing.is_empty());
}

#[tokio::test]
async fn test_list_backup_files_unknown_backup() {
    let (_ctx, api, id, _backup) = super::with_backup().await;

    for backup_id in [format!("{}:ffffffff", id), "no-colon".to_string(), ":abc".to_string()] {
        api.list_backup_files(token(), &backup_id, None)
            .await
            .assert_err_contains("[not-found]");
    }
}

#[tokio::test]
async fn test_ignored_paths_are_left_out() {
    let (ctx, api, id) = super::with_repository().await;
    ctx.write_file("home/Documents/keep.txt", "keep");
    ctx.write_file("home/Downloads/big.iso", "iso");
    api.add_ignored_path(token(), "/Home/Downloads").await.assert_ok();

    api.backup(token(), &id).await.assert_ok();
    let backup_id = api.list_backups(token(), &id).await.assert_ok()[0].id.clone();

    let home = api
        .list_backup_files(token(), &backup_id, Some("/home"))
        .await
        .assert_ok();
    assert_eq!(home, vec!["Documents"]);
}

#[tokio::test]
async fn test_removable_storage_never_backed_up() {
    let (ctx, api, id) = super::with_repository().await;
    ctx.write_file("external/SanDisk/movie.mkv", "movie");
    ctx.create_network_share("nas", "media");

    api.backup(token(), &id).await.assert_ok();
    let backup_id = api.list_backups(token(), &id).await.assert_ok()[0].id.clone();

    let root = api.list_backup_files(token(), &backup_id, None).await.assert_ok();
    assert!(!root.contains(&"external".to_string()));
    assert!(!root.contains(&"network".to_string()));
}

#[tokio::test]
async fn test_mount_and_unmount_backup() {
    let (ctx, api, _id, backup_id) = super::with_backup().await;

    let name = api.mount_backup(token(), &backup_id).await.assert_ok();
    let mounted = ctx.path("backups").join(&name);
    assert_eq!(
        fs::read_to_string(mounted.join("Home/Documents/notes.txt")).unwrap(),
        "remember the milk"
    );
    assert_eq!(
        fs::read_to_string(mounted.join("Apps/photos/library.db")).unwrap(),
        "photos"
    );

    assert!(api.unmount_backup(token(), &name).await.assert_ok());
    assert!(!mounted.exists());
    assert!(!ctx.path("backup-mounts").join(&name).exists());
    // The live data is untouched
    assert_eq!(ctx.read_file("home/Documents/notes.txt").unwrap(), "remember the milk");
}

#[tokio::test]
async fn test_mount_names_are_unique() {
    let (_ctx, api, _id, backup_id) = super::with_backup().await;

    let first = api.mount_backup(token(), &backup_id).await.assert_ok();
    let second = api.mount_backup(token(), &backup_id).await.assert_ok();
    assert_ne!(first, second);
    assert!(chrono::DateTime::parse_from_rfc3339(&first).is_ok());
}

#[tokio::test]
async fn test_mount_unknown_backup() {
    let (_ctx, api, id, _backup) = super::with_backup().await;
    api.mount_backup(token(), &format!("{}:ffffffff", id))
        .await
        .assert_err_contains("[not-found]");
}

#[tokio::test]
async fn test_unmount_rejects_path_names() {
    let (ctx, api, _id, _backup) = super::with_backup().await;
    for name in ["..", "a/b", ""] {
        api.unmount_backup(token(), name)
            .await
            .assert_err_contains("[invalid-path]");
    }
    assert!(ctx.path("home/Documents/notes.txt").exists());
}
