//! Unit tests for the repository registry and error codes

use homeserver_backups::error::BackupError;
use homeserver_backups::managers::repository::{
    derive_password, repository_id, Repository, RepositoryStore,
};
use rstest::rstest;
use tempfile::TempDir;
use test_utils::{ResultAssertions, TEST_PASSWORD};

fn repository(path: &str) -> Repository {
    Repository {
        id: repository_id(path),
        path: path.to_string(),
        password: derive_password(TEST_PASSWORD),
        last_backup: None,
    }
}

#[test]
fn test_repository_id_is_stable_and_short() {
    let path = "/External/SanDisk/Home Server Backup.backup";
    assert_eq!(repository_id(path), repository_id(path));
    assert_eq!(repository_id(path).len(), 8);
    assert!(repository_id(path).chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(
        repository_id(path),
        repository_id("/External/WD/Home Server Backup.backup")
    );
}

#[test]
fn test_derived_password_hides_the_original() {
    let derived = derive_password(TEST_PASSWORD);
    assert_eq!(derived, derive_password(TEST_PASSWORD));
    assert_ne!(derived, TEST_PASSWORD);
    assert!(!derived.contains("horse"));
}

#[tokio::test]
async fn test_registry_persists_across_instances() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("db/backups/repositories.json");

    let store = RepositoryStore::new(file.clone());
    store.insert(repository("/External/a/repo")).await.unwrap();
    store.insert(repository("/Network/nas/b/repo")).await.unwrap();

    let reopened = RepositoryStore::new(file);
    let ids: Vec<String> = reopened.list().await.unwrap().into_iter().map(|r| r.id).collect();
    assert_eq!(
        ids,
        vec![repository_id("/External/a/repo"), repository_id("/Network/nas/b/repo")]
    );
}

#[tokio::test]
async fn test_registry_insert_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let store = RepositoryStore::new(temp_dir.path().join("repositories.json"));
    store.insert(repository("/External/a/repo")).await.unwrap();
    store.insert(repository("/External/a/repo")).await.unwrap();
    assert_eq!(store.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_registry_last_backup_and_remove() {
    let temp_dir = TempDir::new().unwrap();
    let store = RepositoryStore::new(temp_dir.path().join("repositories.json"));
    let repo = repository("/External/a/repo");
    store.insert(repo.clone()).await.unwrap();

    store.set_last_backup(&repo.id, 1_700_000_000_000).await.unwrap();
    assert_eq!(store.get(&repo.id).await.unwrap().last_backup, Some(1_700_000_000_000));

    store.remove(&repo.id).await.unwrap();
    store.get(&repo.id).await.assert_err_contains("[not-found]");
    store.remove(&repo.id).await.assert_err_contains("[not-found]");
    store.set_last_backup(&repo.id, 1).await.assert_err();
}

#[rstest]
#[case(BackupError::InvalidPath("/x".into()), "invalid-path")]
#[case(BackupError::NotInHome("/Apps".into()), "invalid-path")]
#[case(BackupError::AlreadyExists("/External/a".into()), "already-exists")]
#[case(BackupError::RepositoryNotFound("abcd1234".into()), "not-found")]
#[case(BackupError::BackupNotFound("abcd1234:ff".into()), "not-found")]
#[case(BackupError::InvalidPassword, "invalid-password")]
#[case(BackupError::NotEnoughSpace { needed: 2, available: 1 }, "not-enough-space")]
#[case(BackupError::InProgress("busy".into()), "in-progress")]
fn test_error_messages_carry_their_code(#[case] error: BackupError, #[case] code: &str) {
    assert_eq!(error.code(), code);
    assert!(error.to_string().starts_with(&format!("[{}]", code)));
}
