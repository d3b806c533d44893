//! Full backup and restore cycles

use homeserver_backups::managers::restore::{apply_pending_restore, is_restore_first_start};
use homeserver_backups::utils::layout::FIRST_START_FLAG;
use std::collections::HashSet;
use std::fs;
use test_utils::{app_manifest, token, ResultAssertions, TestContext};

#[tokio::test]
async fn test_backup_and_restore_to_external_drive() {
    let mut ctx = TestContext::new();
    let id = super::repository_on_drive(&ctx, "SanDisk").await;

    let before = ctx.backups().get_repositories().await.assert_ok();
    assert_eq!(before[0].last_backup, None);

    ctx.write_file("home/Documents/thesis.md", "chapter one");
    ctx.write_file("app-data/notes/data.db", "v1");
    ctx.backups().backup(&id).await.assert_ok();
    assert!(ctx.backups().get_repository(&id).await.assert_ok().last_backup.is_some());

    // Lose and change data after the backup
    fs::remove_file(ctx.path("home/Documents/thesis.md")).unwrap();
    ctx.write_file("home/Documents/new.md", "written later");
    ctx.write_file("app-data/notes/data.db", "v2");

    let backup_id = super::latest_backup(&ctx, &id).await;
    let orchestrator = ctx.restore_orchestrator();
    orchestrator.restore(&backup_id).await.assert_ok();

    let status = orchestrator.status();
    assert!(!status.running);
    assert_eq!(status.progress, 100);
    assert_eq!(status.error, None);

    // Nothing changes until the next start
    assert!(!ctx.file_exists("home/Documents/thesis.md"));
    assert!(!is_restore_first_start(&ctx.layout()));

    assert!(ctx.restart().await.assert_ok());

    assert_eq!(ctx.read_file("home/Documents/thesis.md").unwrap(), "chapter one");
    assert!(!ctx.file_exists("home/Documents/new.md"));
    assert_eq!(ctx.read_file("app-data/notes/data.db").unwrap(), "v1");
    assert!(is_restore_first_start(&ctx.layout()));
    assert_eq!(ctx.read_file(FIRST_START_FLAG).unwrap(), backup_id);
    assert!(!ctx.file_exists("import"));

    // The repository on the drive is still there and still registered
    let backups = ctx.backups().list_backups(&id).await.assert_ok();
    assert_eq!(backups.len(), 1);

    // Applying again is a no-op
    assert!(!ctx.restart().await.assert_ok());
}

#[tokio::test]
async fn test_restore_never_replaces_removable_media() {
    let mut ctx = TestContext::new();
    let id = super::repository_on_drive(&ctx, "SanDisk").await;
    ctx.write_file("home/a.txt", "a");
    ctx.backups().backup(&id).await.assert_ok();

    // Attached after the backup
    ctx.write_file("external/WD/photos/1.jpg", "jpeg");
    ctx.write_file("network/nas/share/doc.txt", "doc");

    let backup_id = super::latest_backup(&ctx, &id).await;
    ctx.restore_orchestrator().restore(&backup_id).await.assert_ok();
    ctx.restart().await.assert_ok();

    assert_eq!(ctx.read_file("external/WD/photos/1.jpg").unwrap(), "jpeg");
    assert_eq!(ctx.read_file("network/nas/share/doc.txt").unwrap(), "doc");
    assert_eq!(ctx.read_file("home/a.txt").unwrap(), "a");
}

#[test]
fn test_apply_pending_restore_completes_interrupted_apply() {
    let ctx = TestContext::new();
    // An apply that stopped after moving `home`: only `db`, a stray
    // `external` and the flag are left in the import
    ctx.write_file("home/restored.txt", "already moved");
    ctx.write_file("db/old.json", "live");
    ctx.write_file("import/db/restored.json", "restored");
    ctx.write_file("import/external/ghost/file", "never applied");
    ctx.write_file(&format!("import/{}", FIRST_START_FLAG), "repo:snap");
    ctx.write_file("external/SanDisk/keep", "keep");

    assert!(apply_pending_restore(&ctx.layout()).assert_ok());

    assert_eq!(ctx.read_file("home/restored.txt").unwrap(), "already moved");
    assert_eq!(ctx.read_file("db/restored.json").unwrap(), "restored");
    assert!(!ctx.file_exists("db/old.json"));
    assert_eq!(ctx.read_file("external/SanDisk/keep").unwrap(), "keep");
    assert!(!ctx.file_exists("external/ghost"));
    assert!(ctx.file_exists(FIRST_START_FLAG));
    assert!(!ctx.file_exists("import"));

    assert!(!apply_pending_restore(&ctx.layout()).assert_ok());
}

#[tokio::test]
async fn test_each_backup_is_a_new_snapshot() {
    let ctx = TestContext::new();
    let id = super::repository_on_drive(&ctx, "SanDisk").await;
    ctx.write_file("home/file.txt", "x");

    for _ in 0..3 {
        ctx.backups().backup(&id).await.assert_ok();
    }

    let backups = ctx.backups().list_backups(&id).await.assert_ok();
    assert_eq!(backups.len(), 3);
    let ids: HashSet<_> = backups.iter().map(|b| b.id.clone()).collect();
    let times: HashSet<_> = backups.iter().map(|b| b.time).collect();
    assert_eq!(ids.len(), 3);
    assert_eq!(times.len(), 3);
    assert!(backups.windows(2).all(|w| w[0].time < w[1].time));
}

#[tokio::test]
async fn test_ignored_path_hidden_until_removed() {
    let ctx = TestContext::new();
    let api = ctx.api();
    let id = super::repository_on_drive(&ctx, "SanDisk").await;
    ctx.write_file("home/Movies/film.mkv", "film");
    ctx.write_file("home/Music/song.flac", "song");

    api.add_ignored_path(token(), "/Home/Movies").await.assert_ok();
    ctx.backups().backup(&id).await.assert_ok();
    let first = super::latest_backup(&ctx, &id).await;
    assert_eq!(
        ctx.backups().list_backup_files(&first, Some("/home")).await.assert_ok(),
        vec!["Music"]
    );

    api.remove_ignored_path(token(), "/Home/Movies").await.assert_ok();
    ctx.backups().backup(&id).await.assert_ok();
    let second = super::latest_backup(&ctx, &id).await;
    assert_eq!(
        ctx.backups().list_backup_files(&second, Some("/home")).await.assert_ok(),
        vec!["Movies", "Music"]
    );
}

#[tokio::test]
async fn test_app_backup_ignore_keeps_directory_and_siblings() {
    let ctx = TestContext::new();
    let id = super::repository_on_drive(&ctx, "SanDisk").await;
    ctx.install_app("wiki", &app_manifest("wiki", &["logs/*"]));
    ctx.write_file("app-data/wiki/logs/access.log", "GET /");
    ctx.write_file("app-data/wiki/logs/error.log", "oops");
    ctx.write_file("app-data/wiki/pages/index.md", "# Wiki");

    ctx.backups().backup(&id).await.assert_ok();
    let backup_id = super::latest_backup(&ctx, &id).await;

    let app = ctx
        .backups()
        .list_backup_files(&backup_id, Some("/app-data/wiki"))
        .await
        .assert_ok();
    assert_eq!(app, vec!["logs", "manifest.yml", "pages"]);

    let logs = ctx
        .backups()
        .list_backup_files(&backup_id, Some("/app-data/wiki/logs"))
        .await
        .assert_ok();
    assert!(logs.is_empty());
}
