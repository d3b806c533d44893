//! Repositories on storage that comes and goes

use homeserver_backups::error::BackupError;
use test_utils::{ResultAssertions, TestContext};

#[tokio::test]
async fn test_disconnected_share_fails_then_recovers() {
    let ctx = TestContext::new();
    let id = super::repository_on_share(&ctx, "nas.local", "backups").await;
    ctx.write_file("home/file.txt", "x");
    ctx.backups().backup(&id).await.assert_ok();

    ctx.set_offline("/Network/nas.local", true);
    let err = ctx.backups().backup(&id).await.unwrap_err();
    assert!(matches!(err, BackupError::Tool(_)));
    assert!(err.to_string().contains("host is down"), "got: {}", err);
    ctx.backups()
        .list_backups(&id)
        .await
        .assert_err_contains("host is down");

    // No progress entry or lock is left behind
    assert!(ctx.backups().backup_progress().is_empty());
    assert!(!ctx.backups().is_backing_up(&id));

    ctx.set_offline("/Network/nas.local", false);
    ctx.backups().backup(&id).await.assert_ok();
    assert_eq!(ctx.backups().list_backups(&id).await.assert_ok().len(), 2);
}

#[tokio::test]
async fn test_offline_repository_does_not_hide_others() {
    let ctx = TestContext::new();
    let share = super::repository_on_share(&ctx, "nas.local", "backups").await;
    let drive = super::repository_on_drive(&ctx, "SanDisk").await;
    ctx.backups().backup(&share).await.assert_ok();
    ctx.backups().backup(&drive).await.assert_ok();

    ctx.set_offline("/Network/nas.local/backups", true);
    let all = ctx.backups().list_all_backups().await.assert_ok();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].repository_id(), drive);
}

#[tokio::test]
async fn test_failed_backup_keeps_last_backup_time() {
    let ctx = TestContext::new();
    let id = super::repository_on_share(&ctx, "nas.local", "backups").await;
    ctx.backups().backup(&id).await.assert_ok();
    let last = ctx.backups().get_repository(&id).await.assert_ok().last_backup;

    ctx.set_offline("/Network/nas.local", true);
    ctx.backups().backup(&id).await.assert_err();
    assert_eq!(ctx.backups().get_repository(&id).await.assert_ok().last_backup, last);
}
