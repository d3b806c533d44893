//! Progress events seen by subscribers

use homeserver_backups::{BackupEvent, EventKind};
use test_utils::{token, ConfigBuilder, MockResticOps, MockSystemOps, ResultAssertions, TestContext};

#[tokio::test]
async fn test_backup_progress_events() {
    let ctx = TestContext::new();
    let id = super::repository_on_drive(&ctx, "SanDisk").await;
    ctx.write_file("home/a.txt", "a");

    let mut subscription = ctx.backups().events().subscribe_to(EventKind::BackupProgress);
    ctx.backups().backup(&id).await.assert_ok();

    let snapshots: Vec<_> = subscription
        .drain()
        .into_iter()
        .map(|event| match event {
            BackupEvent::BackupProgress(entries) => entries,
            other => panic!("unexpected event {:?}", other),
        })
        .collect();

    assert!(snapshots.len() >= 2);
    assert_eq!(snapshots[0].len(), 1);
    assert_eq!(snapshots[0][0].repository_id, id);
    assert_eq!(snapshots[0][0].percent, 0.0);
    assert!(snapshots.last().unwrap().is_empty());

    let percents: Vec<f64> = snapshots
        .iter()
        .filter_map(|entries| entries.first().map(|e| e.percent))
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
    assert_eq!(percents.last(), Some(&100.0));
}

#[tokio::test]
async fn test_restore_progress_events() {
    let ctx = TestContext::new();
    let id = super::repository_on_drive(&ctx, "SanDisk").await;
    ctx.write_file("home/a.txt", "a");
    ctx.backups().backup(&id).await.assert_ok();
    let backup_id = super::latest_backup(&ctx, &id).await;

    let api = ctx.api();
    let mut subscription = api.subscribe(token()).assert_ok();
    api.restore_backup(token(), &backup_id).await.assert_ok();

    let statuses: Vec<_> = subscription
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            BackupEvent::RestoreProgress(status) => Some(status),
            _ => None,
        })
        .collect();

    let first = statuses.first().unwrap();
    assert!(first.running);
    assert_eq!(first.progress, 0);
    assert_eq!(first.backup_id.as_deref(), Some(backup_id.as_str()));

    let last = statuses.last().unwrap();
    assert!(!last.running);
    assert_eq!(last.progress, 100);
    assert_eq!(last.error, None);

    assert!(statuses.windows(2).all(|w| w[0].progress <= w[1].progress));
    assert!(statuses[..statuses.len() - 1].iter().all(|s| s.progress < 100));

    let json = serde_json::to_value(BackupEvent::RestoreProgress(last.clone())).unwrap();
    assert_eq!(json["event"], "backups:restore-progress");
    assert_eq!(json["data"]["error"], false);
    assert_eq!(json["data"]["progress"], 100);
    assert_eq!(json["data"]["running"], false);
}

#[tokio::test]
async fn test_failed_restore_reports_error_event() {
    let ctx = TestContext::with_mocks(
        ConfigBuilder::new(),
        MockResticOps::new().with_failing_restore(),
        MockSystemOps::new(),
    );
    let id = super::repository_on_drive(&ctx, "SanDisk").await;
    ctx.backups().backup(&id).await.assert_ok();
    let backup_id = super::latest_backup(&ctx, &id).await;

    let mut subscription = ctx.backups().events().subscribe_to(EventKind::RestoreProgress);
    ctx.restore_orchestrator().restore(&backup_id).await.assert_err();

    let events = subscription.drain();
    let Some(BackupEvent::RestoreProgress(last)) = events.last() else {
        panic!("no restore event");
    };
    assert!(!last.running);
    assert_eq!(last.error.as_deref(), Some("Mock restore failure"));

    let json = serde_json::to_value(&events[events.len() - 1]).unwrap();
    assert_eq!(json["data"]["error"], "Mock restore failure");
}

#[tokio::test]
async fn test_no_replay_and_unsubscribe() {
    let ctx = TestContext::new();
    let id = super::repository_on_drive(&ctx, "SanDisk").await;
    let events = ctx.backups().events().clone();

    ctx.backups().backup(&id).await.assert_ok();

    let mut late = events.subscribe();
    assert!(late.try_recv().is_none());

    let count = events.subscriber_count();
    let other = events.subscribe_to(EventKind::RestoreProgress);
    assert_eq!(events.subscriber_count(), count + 1);
    other.unsubscribe();
    assert_eq!(events.subscriber_count(), count);

    ctx.backups().backup(&id).await.assert_ok();
    assert!(!late.drain().is_empty());
}

#[tokio::test]
async fn test_filtered_subscription_ignores_other_kinds() {
    let ctx = TestContext::new();
    let id = super::repository_on_drive(&ctx, "SanDisk").await;

    let mut restores = ctx.backups().events().subscribe_to(EventKind::RestoreProgress);
    ctx.backups().backup(&id).await.assert_ok();
    assert!(restores.drain().is_empty());
}
