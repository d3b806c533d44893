//! Staging restores through the API

use homeserver_backups::managers::restore::RestorePhase;
use homeserver_backups::utils::layout::FIRST_START_FLAG;
use std::time::Duration;
use test_utils::{
    token, wait_until, ConfigBuilder, MockResticOps, MockSystemOps, ResticCall, ResultAssertions,
    TestContext, TEST_PASSWORD,
};

#[tokio::test]
async fn test_restore_stages_import() {
    let (ctx, api, _id, backup_id) = super::with_backup().await;
    ctx.write_file("home/Documents/notes.txt", "changed after the backup");

    api.restore_backup(token(), &backup_id).await.assert_ok();

    let status = api.restore_status(token()).assert_ok();
    assert_eq!(status.backup_id.as_deref(), Some(backup_id.as_str()));
    assert!(!status.running);
    assert_eq!(status.progress, 100);
    assert_eq!(status.error, None);

    // Staged, not applied
    assert_eq!(
        ctx.read_file("import/home/Documents/notes.txt").unwrap(),
        "remember the milk"
    );
    assert_eq!(
        ctx.read_file(&format!("import/{}", FIRST_START_FLAG)).unwrap(),
        backup_id
    );
    assert_eq!(
        ctx.read_file("home/Documents/notes.txt").unwrap(),
        "changed after the backup"
    );
    assert!(!ctx.file_exists(".temporary-migration"));
    assert_eq!(ctx.system.reboot_count(), 0);
}

#[tokio::test]
async fn test_restore_reboots_when_configured() {
    let ctx = TestContext::from_builder(ConfigBuilder::new().with_reboot(true));
    let backups = ctx.backups();
    let drive = ctx.create_external_drive("SanDisk");
    let id = backups.create_repository(&drive, TEST_PASSWORD).await.assert_ok();
    backups.backup(&id).await.assert_ok();
    let backup_id = backups.list_backups(&id).await.assert_ok()[0].id.clone();

    let orchestrator = ctx.restore_orchestrator();
    orchestrator.restore(&backup_id).await.assert_ok();

    assert_eq!(orchestrator.phase(), RestorePhase::Staged);
    assert_eq!(ctx.system.reboot_count(), 1);
    // Nothing new may start while the machine goes down
    assert!(!backups.is_running());
    backups.backup(&id).await.assert_err_contains("[shutting-down]");
}

#[tokio::test]
async fn test_restore_refused_without_space() {
    let (ctx, api, _id, backup_id) = super::with_backup().await;
    ctx.system.set_available_space(1024);

    api.restore_backup(token(), &backup_id)
        .await
        .assert_err_contains("[not-enough-space]");

    let status = api.restore_status(token()).assert_ok();
    assert!(!status.running);
    assert_eq!(status.progress, 0);
    assert_eq!(status.backup_id, None);
    assert!(!ctx.file_exists("import"));
    assert!(!ctx
        .restic
        .get_calls()
        .iter()
        .any(|c| matches!(c, ResticCall::Restore { .. })));
}

#[tokio::test]
async fn test_restore_space_check_includes_margin() {
    let builder = ConfigBuilder::new().with_safety_margin_gb(1);
    let ctx = TestContext::from_builder(builder);
    let api = ctx.api();
    let drive = ctx.create_external_drive("SanDisk");
    let id = api.create_repository(token(), &drive, TEST_PASSWORD).await.assert_ok();
    ctx.write_file("home/file.bin", "0123456789");
    api.backup(token(), &id).await.assert_ok();
    let backup = api.list_backups(token(), &id).await.assert_ok().remove(0);
    let margin = 1024 * 1024 * 1024;

    ctx.system.set_available_space(backup.size + margin - 1);
    api.restore_backup(token(), &backup.id)
        .await
        .assert_err_contains("[not-enough-space]");

    ctx.system.set_available_space(backup.size + margin);
    api.restore_backup(token(), &backup.id).await.assert_ok();
}

#[tokio::test]
async fn test_failed_restore_cleans_up() {
    let ctx = TestContext::with_mocks(
        ConfigBuilder::new(),
        MockResticOps::new().with_failing_restore(),
        MockSystemOps::new(),
    );
    let api = ctx.api();
    let drive = ctx.create_external_drive("SanDisk");
    let id = api.create_repository(token(), &drive, TEST_PASSWORD).await.assert_ok();
    api.backup(token(), &id).await.assert_ok();
    let backup_id = api.list_backups(token(), &id).await.assert_ok()[0].id.clone();

    api.restore_backup(token(), &backup_id)
        .await
        .assert_err_contains("Mock restore failure");

    let status = api.restore_status(token()).assert_ok();
    assert!(!status.running);
    assert_eq!(status.error.as_deref(), Some("Mock restore failure"));
    assert!(!ctx.file_exists(".temporary-migration"));
    assert!(!ctx.file_exists("import"));
}

#[tokio::test]
async fn test_restore_unknown_backup() {
    let (ctx, api, id, _backup) = super::with_backup().await;
    api.restore_backup(token(), &format!("{}:ffffffff", id))
        .await
        .assert_err_contains("[not-found]");
    assert!(!ctx.file_exists("import"));
}

#[tokio::test]
async fn test_second_restore_replaces_pending_import() {
    let (ctx, api, id, first) = super::with_backup().await;
    ctx.write_file("home/Documents/notes.txt", "second version");
    api.backup(token(), &id).await.assert_ok();
    let second = api.list_backups(token(), &id).await.assert_ok()[1].id.clone();

    api.restore_backup(token(), &first).await.assert_ok();
    api.restore_backup(token(), &second).await.assert_ok();

    assert_eq!(
        ctx.read_file("import/home/Documents/notes.txt").unwrap(),
        "second version"
    );
    assert_eq!(ctx.read_file(&format!("import/{}", FIRST_START_FLAG)).unwrap(), second);
}

#[tokio::test]
async fn test_only_one_restore_at_a_time() {
    let ctx = TestContext::with_mocks(
        ConfigBuilder::new(),
        MockResticOps::new().with_delay(Duration::from_millis(300)),
        MockSystemOps::new(),
    );
    let backups = ctx.backups();
    let drive = ctx.create_external_drive("SanDisk");
    let id = backups.create_repository(&drive, TEST_PASSWORD).await.assert_ok();
    ctx.write_file("home/Documents/notes.txt", "remember the milk");
    backups.backup(&id).await.assert_ok();
    let backup_id = backups.list_backups(&id).await.assert_ok()[0].id.clone();

    let orchestrator = ctx.restore_orchestrator();
    let (first, second) = tokio::join!(orchestrator.restore(&backup_id), async {
        assert!(wait_until(Duration::from_secs(5), || orchestrator.status().running).await);
        assert_eq!(orchestrator.phase(), RestorePhase::Restoring);
        orchestrator.restore(&backup_id).await
    });

    second.assert_err_contains("[in-progress]");
    first.assert_ok();

    let status = orchestrator.status();
    assert!(!status.running);
    assert_eq!(status.progress, 100);
    assert_eq!(status.error, None);
    assert_eq!(
        ctx.read_file("import/home/Documents/notes.txt").unwrap(),
        "remember the milk"
    );
    let restores = ctx
        .restic
        .get_calls()
        .iter()
        .filter(|c| matches!(c, ResticCall::Restore { .. }))
        .count();
    assert_eq!(restores, 1);
}
