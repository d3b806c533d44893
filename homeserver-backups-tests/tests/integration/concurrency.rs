//! Backups to different repositories running side by side

use std::sync::Arc;
use test_utils::{ResultAssertions, TestContext};
use tokio::task::JoinSet;

const REPOSITORIES: usize = 8;
const ROUNDS: usize = 5;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_backups_to_different_repositories() {
    let ctx = TestContext::new();
    ctx.write_file("home/Documents/notes.txt", "remember the milk");
    ctx.backups()
        .ignore()
        .add_ignored_path("/Home/Downloads")
        .await
        .assert_ok();

    let mut ids = Vec::new();
    for i in 0..REPOSITORIES {
        ids.push(super::repository_on_drive(&ctx, &format!("Drive{}", i)).await);
    }

    let backups = ctx.backups();
    for round in 0..ROUNDS {
        let mut tasks = JoinSet::new();
        for id in &ids {
            let backups = Arc::clone(&backups);
            let id = id.clone();
            tasks.spawn(async move {
                let result = backups.backup(&id).await;
                (id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (id, result) = joined.expect("backup task panicked");
            result.assert_ok_msg(&format!("round {} backup of {}", round, id));
        }
    }

    for id in &ids {
        assert_eq!(backups.list_backups(id).await.assert_ok().len(), ROUNDS);
        let rules = std::fs::read_to_string(backups.layout().exclude_file(id)).unwrap();
        assert!(rules.lines().any(|l| l.ends_with("home/Downloads")));
    }
    assert!(backups.backup_progress().is_empty());
}
