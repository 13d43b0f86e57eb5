//! UserRepository interface tests.
//!
//! These tests verify the contract of the UserRepository trait.
//! Each storage implementation should run these tests.

use chrono::{DateTime, TimeZone, Utc};

use chatsync::storage::{Applied, UserRecord, UserRepository};

fn at_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).unwrap()
}

fn record(id: &str, name: &str, created_millis: i64, version: i64) -> UserRecord {
    UserRecord {
        id: id.to_string(),
        email: format!("{}@example.com", id),
        display_name: name.to_string(),
        created_at: at_millis(created_millis),
        updated_at: at_millis(version),
        source_version: version,
    }
}

// =============================================================================
// UserRepository::get_by_id tests
// =============================================================================

pub async fn test_get_nonexistent<R: UserRepository>(repo: &R) {
    let result = repo
        .get_by_id("test_missing")
        .await
        .expect("get_by_id should succeed");
    assert!(result.is_none(), "nonexistent user should be None");
}

// =============================================================================
// UserRepository::upsert_if_newer tests
// =============================================================================

pub async fn test_create_and_get<R: UserRepository>(repo: &R) {
    let user = record("test_create", "Ann", 1_704_067_200_000, 1_704_067_200_123);

    let applied = repo.upsert_if_newer(&user).await.expect("upsert should succeed");
    assert_eq!(applied, Applied::Created);

    let stored = repo
        .get_by_id("test_create")
        .await
        .expect("get_by_id should succeed")
        .expect("user should exist");
    assert_eq!(stored, user, "stored record should round-trip");
}

pub async fn test_newer_fact_updates<R: UserRepository>(repo: &R) {
    repo.upsert_if_newer(&record("test_update", "Ann", 1_000, 1_000))
        .await
        .unwrap();

    let applied = repo
        .upsert_if_newer(&record("test_update", "Annie", 1_000, 2_000))
        .await
        .unwrap();

    assert_eq!(applied, Applied::Updated);
    let stored = repo.get_by_id("test_update").await.unwrap().unwrap();
    assert_eq!(stored.display_name, "Annie");
    assert_eq!(stored.source_version, 2_000);
}

pub async fn test_older_fact_is_stale<R: UserRepository>(repo: &R) {
    repo.upsert_if_newer(&record("test_stale", "New", 1_000, 5_000))
        .await
        .unwrap();

    let applied = repo
        .upsert_if_newer(&record("test_stale", "Old", 1_000, 4_999))
        .await
        .unwrap();

    assert_eq!(applied, Applied::Stale);
    let stored = repo.get_by_id("test_stale").await.unwrap().unwrap();
    assert_eq!(stored.display_name, "New", "older fact must not overwrite");
}

pub async fn test_reapply_is_idempotent<R: UserRepository>(repo: &R) {
    let user = record("test_idem", "Ann", 1_000, 3_000);

    repo.upsert_if_newer(&user).await.unwrap();
    let first = repo.get_by_id("test_idem").await.unwrap().unwrap();
    let applied = repo.upsert_if_newer(&user).await.unwrap();
    let second = repo.get_by_id("test_idem").await.unwrap().unwrap();

    assert_eq!(applied, Applied::Unchanged);
    assert_eq!(first, second, "re-application should leave state unchanged");
}

pub async fn test_equal_version_different_fields_updates<R: UserRepository>(repo: &R) {
    repo.upsert_if_newer(&record("test_tie", "A", 1_000, 3_000))
        .await
        .unwrap();

    let applied = repo
        .upsert_if_newer(&record("test_tie", "B", 1_000, 3_000))
        .await
        .unwrap();

    assert_eq!(applied, Applied::Updated);
    let stored = repo.get_by_id("test_tie").await.unwrap().unwrap();
    assert_eq!(stored.display_name, "B");
}

// =============================================================================
// Concurrent writers
// =============================================================================

pub async fn test_concurrent_upserts_all_succeed<R: UserRepository>(repo: &R) {
    let users: Vec<UserRecord> = (0..32)
        .map(|i| record(&format!("test_conc_{}", i), "Ann", 1_000, 1_000 + i))
        .collect();

    let results =
        futures::future::join_all(users.iter().map(|user| repo.upsert_if_newer(user))).await;

    for (user, result) in users.iter().zip(results) {
        assert_eq!(
            result.expect("concurrent upsert should succeed"),
            Applied::Created,
            "{} should be created",
            user.id
        );
        assert_eq!(repo.get_by_id(&user.id).await.unwrap().as_ref(), Some(user));
    }
}

pub async fn test_concurrent_versions_converge_on_newest<R: UserRepository>(repo: &R) {
    let versions: Vec<UserRecord> = (1..=16)
        .map(|v| record("test_race", &format!("v{}", v), 1_000, v * 100))
        .collect();

    let results =
        futures::future::join_all(versions.iter().map(|user| repo.upsert_if_newer(user))).await;

    for result in results {
        result.expect("contending upsert should succeed");
    }
    let stored = repo.get_by_id("test_race").await.unwrap().unwrap();
    assert_eq!(stored.display_name, "v16");
    assert_eq!(stored.source_version, 1_600);
}

// =============================================================================
// UserRepository::list tests
// =============================================================================

pub async fn test_list_newest_first<R: UserRepository>(repo: &R) {
    repo.upsert_if_newer(&record("test_list_a", "A", 10_000, 1))
        .await
        .unwrap();
    repo.upsert_if_newer(&record("test_list_c", "C", 30_000, 1))
        .await
        .unwrap();
    repo.upsert_if_newer(&record("test_list_b", "B", 20_000, 1))
        .await
        .unwrap();

    let ids: Vec<String> = repo
        .list()
        .await
        .expect("list should succeed")
        .into_iter()
        .map(|r| r.id)
        .filter(|id| id.starts_with("test_list_"))
        .collect();

    assert_eq!(ids, ["test_list_c", "test_list_b", "test_list_a"]);
}

/// Run every UserRepository contract test against `$repo`.
#[macro_export]
macro_rules! run_user_repository_tests {
    ($repo:expr) => {
        storage::user_repository_tests::test_get_nonexistent($repo).await;
        println!("  test_get_nonexistent: PASSED");
        storage::user_repository_tests::test_create_and_get($repo).await;
        println!("  test_create_and_get: PASSED");
        storage::user_repository_tests::test_newer_fact_updates($repo).await;
        println!("  test_newer_fact_updates: PASSED");
        storage::user_repository_tests::test_older_fact_is_stale($repo).await;
        println!("  test_older_fact_is_stale: PASSED");
        storage::user_repository_tests::test_reapply_is_idempotent($repo).await;
        println!("  test_reapply_is_idempotent: PASSED");
        storage::user_repository_tests::test_equal_version_different_fields_updates($repo).await;
        println!("  test_equal_version_different_fields_updates: PASSED");
        storage::user_repository_tests::test_concurrent_upserts_all_succeed($repo).await;
        println!("  test_concurrent_upserts_all_succeed: PASSED");
        storage::user_repository_tests::test_concurrent_versions_converge_on_newest($repo).await;
        println!("  test_concurrent_versions_converge_on_newest: PASSED");
        storage::user_repository_tests::test_list_newest_first($repo).await;
        println!("  test_list_newest_first: PASSED");
    };
}
