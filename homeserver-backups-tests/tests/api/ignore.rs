//! Ignore list management through the API

use test_utils::{token, ResultAssertions, TestContext};

#[tokio::test]
async fn test_add_list_remove_ignored_paths() {
    let ctx = TestContext::new();
    let api = ctx.api();
    assert!(api.get_ignored_paths(token()).await.assert_ok().is_empty());

    assert!(api.add_ignored_path(token(), "/Home/Downloads").await.assert_ok());
    assert!(api.add_ignored_path(token(), "/Home/Videos/Raw/").await.assert_ok());
    assert!(api.add_ignored_path(token(), "/Home/Downloads").await.assert_ok());
    assert_eq!(
        api.get_ignored_paths(token()).await.assert_ok(),
        vec!["/Home/Downloads", "/Home/Videos/Raw"]
    );

    assert!(api.remove_ignored_path(token(), "/Home/Downloads").await.assert_ok());
    assert_eq!(
        api.get_ignored_paths(token()).await.assert_ok(),
        vec!["/Home/Videos/Raw"]
    );
}

#[tokio::test]
async fn test_ignored_paths_must_be_in_home() {
    let ctx = TestContext::new();
    let api = ctx.api();

    for path in ["/Apps/nextcloud", "/External/SanDisk", "/Home/../Apps", "/"] {
        api.add_ignored_path(token(), path)
            .await
            .assert_err_contains("Path to exclude must be in /Home");
    }
    api.remove_ignored_path(token(), "/Apps/nextcloud")
        .await
        .assert_err_contains("[invalid-path]");
    assert!(api.get_ignored_paths(token()).await.assert_ok().is_empty());
}

#[tokio::test]
async fn test_ignore_list_survives_engine_restart() {
    let mut ctx = TestContext::new();
    ctx.api()
        .add_ignored_path(token(), "/Home/Downloads")
        .await
        .assert_ok();

    ctx.restart().await.assert_ok();
    assert_eq!(
        ctx.api().get_ignored_paths(token()).await.assert_ok(),
        vec!["/Home/Downloads"]
    );
}
