//! Repository registration through the API

use homeserver_backups::managers::repository::{repository_id, REPOSITORY_CONTAINER};
use test_utils::{token, ResultAssertions, TestContext, TEST_PASSWORD};

#[tokio::test]
async fn test_create_repository_on_external_drive() {
    let ctx = TestContext::new();
    let api = ctx.api();
    let drive = ctx.create_external_drive("SanDisk");

    let id = api.create_repository(token(), &drive, TEST_PASSWORD).await.assert_ok();

    let expected_path = format!("/External/SanDisk/{}", REPOSITORY_CONTAINER);
    assert_eq!(id, repository_id(&expected_path));
    assert!(ctx.file_exists(&format!("external/SanDisk/{}", REPOSITORY_CONTAINER)));

    let repositories = api.get_repositories(token()).await.assert_ok();
    assert_eq!(repositories.len(), 1);
    assert_eq!(repositories[0].id, id);
    assert_eq!(repositories[0].path, expected_path);
    assert_eq!(repositories[0].last_backup, None);
}

#[tokio::test]
async fn test_create_repository_on_network_share() {
    let ctx = TestContext::new();
    let api = ctx.api();
    let share = ctx.create_network_share("nas.local", "backups");

    let id = api.create_repository(token(), &share, TEST_PASSWORD).await.assert_ok();
    let repository = ctx.backups().get_repository(&id).await.assert_ok();
    assert!(repository.path.starts_with("/Network/nas.local/backups/"));
}

#[tokio::test]
async fn test_create_repository_twice_fails() {
    let (_ctx, api, _id) = super::with_repository().await;
    api.create_repository(token(), "/External/SanDisk", TEST_PASSWORD)
        .await
        .assert_err_contains("[already-exists]");
    assert_eq!(api.get_repositories(token()).await.assert_ok().len(), 1);
}

#[tokio::test]
async fn test_create_repository_outside_removable_storage_fails() {
    let ctx = TestContext::new();
    let api = ctx.api();

    for path in ["/Home/Backups", "/External", "/Network", "/Apps/x", "/etc", "relative"] {
        api.create_repository(token(), path, TEST_PASSWORD)
            .await
            .assert_err_contains("[invalid-path]");
    }
    // A drive that is not attached
    api.create_repository(token(), "/External/Missing", TEST_PASSWORD)
        .await
        .assert_err_contains("[invalid-path]");

    assert!(api.get_repositories(token()).await.assert_ok().is_empty());
    assert!(ctx.restic.get_calls().is_empty());
}

#[tokio::test]
async fn test_reconnect_after_forget() {
    let (ctx, api, id) = super::with_repository().await;

    assert!(api.forget_repository(token(), &id).await.assert_ok());
    assert!(api.get_repositories(token()).await.assert_ok().is_empty());
    // Forgetting keeps the data on the drive
    assert!(ctx.file_exists(&format!("external/SanDisk/{}/config.json", REPOSITORY_CONTAINER)));

    let reconnected = api
        .connect_to_existing_repository(token(), "/External/SanDisk", TEST_PASSWORD)
        .await
        .assert_ok();
    assert_eq!(reconnected, id);
    assert_eq!(api.get_repositories(token()).await.assert_ok().len(), 1);
}

#[tokio::test]
async fn test_connect_with_wrong_password() {
    let (_ctx, api, id) = super::with_repository().await;
    api.forget_repository(token(), &id).await.assert_ok();

    api.connect_to_existing_repository(token(), "/External/SanDisk", "not the password")
        .await
        .assert_err_contains("[invalid-password]");
    assert!(api.get_repositories(token()).await.assert_ok().is_empty());
}

#[tokio::test]
async fn test_connect_without_repository_fails() {
    let ctx = TestContext::new();
    let api = ctx.api();
    let drive = ctx.create_external_drive("Empty");

    api.connect_to_existing_repository(token(), &drive, TEST_PASSWORD)
        .await
        .assert_err();
    assert!(api.get_repositories(token()).await.assert_ok().is_empty());
}

#[tokio::test]
async fn test_connect_already_registered_keeps_entry() {
    let (_ctx, api, id) = super::with_repository().await;

    api.connect_to_existing_repository(token(), "/External/SanDisk", "not the password")
        .await
        .assert_err_contains("[invalid-password]");
    let repositories = api.get_repositories(token()).await.assert_ok();
    assert_eq!(repositories.len(), 1);
    assert_eq!(repositories[0].id, id);
}

#[tokio::test]
async fn test_forget_unknown_repository() {
    let ctx = TestContext::new();
    ctx.api()
        .forget_repository(token(), "deadbeef")
        .await
        .assert_err_contains("[not-found]");
}

#[tokio::test]
async fn test_repository_size() {
    let (_ctx, api, id, _backup) = super::with_backup().await;
    let size = api.get_repository_size(token(), &id).await.assert_ok();

    assert!(size.used > 0);
    assert_eq!(size.capacity, 2u64 << 40);
    assert_eq!(size.available, 1u64 << 40);
}
