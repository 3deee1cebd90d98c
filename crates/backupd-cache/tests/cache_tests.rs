//! Integration tests for SqliteFileCache
//!
//! These tests verify the IFileCache methods using an in-memory SQLite
//! database (or a temp-dir file where persistence matters). Each test
//! creates a fresh database to ensure test isolation.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;

use backupd_cache::{CacheError, DatabasePool, SqliteFileCache};
use backupd_core::domain::{LocalIdentity, RemoteFileRecord, RemoteId, RemotePath};
use backupd_core::ports::IFileCache;

// ============================================================================
// Test helpers
// ============================================================================

/// Create a fresh in-memory cache for each test
async fn setup() -> SqliteFileCache {
    let pool = DatabasePool::in_memory()
        .await
        .expect("Failed to create in-memory database");
    SqliteFileCache::new(pool)
}

fn id(s: &str) -> RemoteId {
    RemoteId::new(s.to_string()).unwrap()
}

fn path(s: &str) -> RemotePath {
    RemotePath::new(s.to_string()).unwrap()
}

fn file(remote_id: &str, name: &str, parents: &[&str]) -> RemoteFileRecord {
    RemoteFileRecord::new(id(remote_id), name)
        .with_parents(parents.iter().map(|p| id(p)).collect())
        .with_content(16, Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap())
}

fn folder(remote_id: &str, name: &str, parents: &[&str]) -> RemoteFileRecord {
    RemoteFileRecord::folder(id(remote_id), name, parents.iter().map(|p| id(p)).collect())
}

/// Builds a finished listing from the given elements
fn listing(items: Vec<anyhow::Result<RemoteFileRecord>>) -> mpsc::Receiver<anyhow::Result<RemoteFileRecord>> {
    let (tx, rx) = mpsc::channel(items.len().max(1));
    for item in items {
        tx.try_send(item).unwrap();
    }
    rx
}

async fn all_paths(cache: &SqliteFileCache) -> Vec<(String, String)> {
    let mut seen = Vec::new();
    cache
        .for_each_path(&mut |p: &str, id: &RemoteId| seen.push((p.to_string(), id.to_string())))
        .await
        .unwrap();
    seen
}

// ============================================================================
// Emptiness and population
// ============================================================================

#[tokio::test]
async fn test_new_cache_is_empty() {
    let cache = setup().await;
    assert!(cache.is_empty().await.unwrap());
    assert_eq!(cache.record_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_insert_marks_cache_populated() {
    let cache = setup().await;
    cache.insert_or_update(&file("r1", "doc.txt", &[])).await.unwrap();
    assert!(!cache.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_bootstrap_single_record() {
    let cache = setup().await;

    let count = cache
        .bootstrap(listing(vec![Ok(file("r1", "doc.txt", &[]))]))
        .await
        .unwrap();

    assert_eq!(count, 1);
    assert!(!cache.is_empty().await.unwrap());
    let found = cache.find_by_path(&path("/doc.txt")).await.unwrap().unwrap();
    assert_eq!(found.remote_id, id("r1"));
}

#[tokio::test]
async fn test_bootstrap_resolves_children_listed_before_parents() {
    let cache = setup().await;

    cache
        .bootstrap(listing(vec![
            Ok(file("f1", "file1", &["p1", "p2"])),
            Ok(folder("p1", "parent1", &[])),
            Ok(folder("p2", "parent2", &["gp"])),
            Ok(folder("gp", "grand", &[])),
        ]))
        .await
        .unwrap();

    assert_eq!(
        cache.paths_of(&id("f1")).await.unwrap(),
        vec!["/grand/parent2/file1", "/parent1/file1"]
    );
    assert_eq!(cache.record_count().await.unwrap(), 4);
}

#[tokio::test]
async fn test_bootstrap_rolls_back_on_listing_error() {
    let cache = setup().await;

    let result = cache
        .bootstrap(listing(vec![
            Ok(file("r1", "a.txt", &[])),
            Ok(file("r2", "b.txt", &[])),
            Err(anyhow::anyhow!("connection reset")),
        ]))
        .await;

    let err = result.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CacheError>(),
        Some(CacheError::Bootstrap(msg)) if msg.contains("connection reset")
    ));
    assert!(cache.is_empty().await.unwrap());
    assert_eq!(cache.record_count().await.unwrap(), 0);
    assert!(all_paths(&cache).await.is_empty());
}

#[tokio::test]
async fn test_bootstrap_empty_listing_marks_populated() {
    let cache = setup().await;
    assert_eq!(cache.bootstrap(listing(Vec::new())).await.unwrap(), 0);
    assert!(!cache.is_empty().await.unwrap());
}

// ============================================================================
// Lookups
// ============================================================================

#[tokio::test]
async fn test_find_by_path_returns_inserted_record_for_every_path() {
    let cache = setup().await;
    cache.insert_or_update(&folder("p1", "parent1", &[])).await.unwrap();
    cache.insert_or_update(&folder("p2", "parent2", &[])).await.unwrap();

    let record = file("f1", "file1", &["p1", "p2"]);
    let paths = cache.insert_or_update(&record).await.unwrap();
    assert_eq!(paths.len(), 2);

    for p in &paths {
        let found = cache.find_by_path(&path(p)).await.unwrap().unwrap();
        assert_eq!(found, record);
    }
}

#[tokio::test]
async fn test_insert_is_idempotent() {
    let cache = setup().await;
    let record = file("r1", "doc.txt", &[]);

    cache.insert_or_update(&record).await.unwrap();
    cache.insert_or_update(&record).await.unwrap();

    assert_eq!(cache.record_count().await.unwrap(), 1);
    assert_eq!(all_paths(&cache).await, vec![("/doc.txt".to_string(), "r1".to_string())]);
}

#[tokio::test]
async fn test_find_by_id_and_unknown_lookups() {
    let cache = setup().await;
    let record = file("r1", "doc.txt", &[]);
    cache.insert_or_update(&record).await.unwrap();

    assert_eq!(cache.find_by_id(&id("r1")).await.unwrap(), Some(record));
    assert_eq!(cache.find_by_id(&id("nope")).await.unwrap(), None);
    assert_eq!(cache.find_by_path(&path("/nope")).await.unwrap(), None);
}

#[tokio::test]
async fn test_find_by_local_identity() {
    let cache = setup().await;
    let identity = LocalIdentity::new("00000000000000ab", 42, 16);
    let record = file("r1", "doc.txt", &[]).with_local_id(identity.id());
    cache.insert_or_update(&record).await.unwrap();
    cache.insert_or_update(&file("r2", "other.txt", &[])).await.unwrap();

    let found = cache.find_by_local_id(&identity).await.unwrap().unwrap();
    assert_eq!(found.remote_id, id("r1"));

    let stranger = LocalIdentity::new("00000000000000ab", 43, 16);
    assert!(cache.find_by_local_id(&stranger).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unknown_parent_anchors_at_root() {
    let cache = setup().await;
    let paths = cache
        .insert_or_update(&file("f1", "file1", &["missing"]))
        .await
        .unwrap();
    assert_eq!(paths, vec!["/file1"]);
}

// ============================================================================
// Path maintenance
// ============================================================================

#[tokio::test]
async fn test_move_prunes_stale_path() {
    let cache = setup().await;
    cache.insert_or_update(&folder("a", "A", &[])).await.unwrap();
    cache.insert_or_update(&folder("b", "B", &[])).await.unwrap();
    cache.insert_or_update(&file("f1", "file1", &["a"])).await.unwrap();
    assert!(cache.find_by_path(&path("/A/file1")).await.unwrap().is_some());

    let paths = cache
        .insert_or_update(&file("f1", "renamed", &["b"]))
        .await
        .unwrap();

    assert_eq!(paths, vec!["/B/renamed"]);
    assert!(cache.find_by_path(&path("/A/file1")).await.unwrap().is_none());
    assert_eq!(cache.paths_of(&id("f1")).await.unwrap(), vec!["/B/renamed"]);
}

#[tokio::test]
async fn test_folder_rename_refreshes_subtree() {
    let cache = setup().await;
    cache.insert_or_update(&folder("top", "Top", &[])).await.unwrap();
    cache.insert_or_update(&folder("sub", "Sub", &["top"])).await.unwrap();
    cache.insert_or_update(&file("f1", "file1", &["sub"])).await.unwrap();
    assert_eq!(cache.paths_of(&id("f1")).await.unwrap(), vec!["/Top/Sub/file1"]);

    cache.insert_or_update(&folder("top", "Renamed", &[])).await.unwrap();

    assert_eq!(cache.paths_of(&id("sub")).await.unwrap(), vec!["/Renamed/Sub"]);
    assert_eq!(cache.paths_of(&id("f1")).await.unwrap(), vec!["/Renamed/Sub/file1"]);
    assert!(cache.find_by_path(&path("/Top/Sub/file1")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_moving_path_holder_reanchors_shadowed_record() {
    let cache = setup().await;
    cache.insert_or_update(&file("older", "a.txt", &[])).await.unwrap();
    cache.insert_or_update(&file("newer", "a.txt", &[])).await.unwrap();

    let mut moved = cache.find_by_id(&id("newer")).await.unwrap().unwrap();
    moved.name = "b.txt".to_string();
    cache.insert_or_update(&moved).await.unwrap();

    let a = cache.find_by_path(&path("/a.txt")).await.unwrap().unwrap();
    assert_eq!(a.remote_id, id("older"));
    let b = cache.find_by_path(&path("/b.txt")).await.unwrap().unwrap();
    assert_eq!(b.remote_id, id("newer"));
}

#[tokio::test]
async fn test_late_parent_reanchors_child() {
    let cache = setup().await;
    cache.insert_or_update(&file("f1", "file1", &["p"])).await.unwrap();
    assert_eq!(cache.paths_of(&id("f1")).await.unwrap(), vec!["/file1"]);

    cache.insert_or_update(&folder("p", "parent", &[])).await.unwrap();

    assert_eq!(cache.paths_of(&id("f1")).await.unwrap(), vec!["/parent/file1"]);
    assert!(cache.find_by_path(&path("/file1")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cyclic_parents_do_not_hang() {
    let cache = setup().await;
    cache.insert_or_update(&folder("a", "A", &["b"])).await.unwrap();
    cache.insert_or_update(&folder("b", "B", &["a"])).await.unwrap();

    let paths = tokio::time::timeout(
        Duration::from_secs(5),
        cache.insert_or_update(&file("f1", "file1", &["a"])),
    )
    .await
    .expect("path resolution must terminate")
    .unwrap();

    assert_eq!(paths, vec!["/B/A/file1"]);
}

// ============================================================================
// Removal
// ============================================================================

#[tokio::test]
async fn test_remove_deletes_subtree() {
    let cache = setup().await;
    cache.insert_or_update(&folder("top", "Top", &[])).await.unwrap();
    cache.insert_or_update(&file("f1", "a.txt", &["top"])).await.unwrap();
    cache.insert_or_update(&file("f2", "b.txt", &["top"])).await.unwrap();
    cache.insert_or_update(&file("keep", "c.txt", &[])).await.unwrap();

    assert_eq!(cache.remove(&id("top")).await.unwrap(), 3);

    assert_eq!(cache.record_count().await.unwrap(), 1);
    assert_eq!(all_paths(&cache).await, vec![("/c.txt".to_string(), "keep".to_string())]);
}

#[tokio::test]
async fn test_remove_keeps_child_with_other_parent() {
    let cache = setup().await;
    cache.insert_or_update(&folder("a", "A", &[])).await.unwrap();
    cache.insert_or_update(&folder("b", "B", &[])).await.unwrap();
    cache.insert_or_update(&file("f1", "shared", &["a", "b"])).await.unwrap();

    assert_eq!(cache.remove(&id("a")).await.unwrap(), 1);

    assert!(cache.find_by_id(&id("f1")).await.unwrap().is_some());
    assert_eq!(cache.paths_of(&id("f1")).await.unwrap(), vec!["/B/shared"]);
}

#[tokio::test]
async fn test_remove_unknown_id() {
    let cache = setup().await;
    assert_eq!(cache.remove(&id("ghost")).await.unwrap(), 0);
}

#[tokio::test]
async fn test_last_writer_holds_contested_path() {
    let cache = setup().await;
    cache.insert_or_update(&file("older", "a.txt", &[])).await.unwrap();
    cache.insert_or_update(&file("newer", "a.txt", &[])).await.unwrap();

    let found = cache.find_by_path(&path("/a.txt")).await.unwrap().unwrap();
    assert_eq!(found.remote_id, id("newer"));
    assert_eq!(all_paths(&cache).await.len(), 1);
}

#[tokio::test]
async fn test_removing_path_holder_reanchors_shadowed_record() {
    let cache = setup().await;
    cache.insert_or_update(&file("older", "a.txt", &[])).await.unwrap();
    cache.insert_or_update(&file("newer", "a.txt", &[])).await.unwrap();

    assert_eq!(cache.remove(&id("newer")).await.unwrap(), 1);

    let found = cache.find_by_path(&path("/a.txt")).await.unwrap().unwrap();
    assert_eq!(found.remote_id, id("older"));
    assert_eq!(cache.paths_of(&id("older")).await.unwrap(), vec!["/a.txt"]);
}

#[tokio::test]
async fn test_removing_folder_reanchors_shadowed_children() {
    let cache = setup().await;
    cache.insert_or_update(&folder("old", "Docs", &[])).await.unwrap();
    cache.insert_or_update(&file("old-f", "n.txt", &["old"])).await.unwrap();
    cache.insert_or_update(&folder("new", "Docs", &[])).await.unwrap();
    cache.insert_or_update(&file("new-f", "n.txt", &["new"])).await.unwrap();

    cache.remove(&id("new")).await.unwrap();

    let docs = cache.find_by_path(&path("/Docs")).await.unwrap().unwrap();
    assert_eq!(docs.remote_id, id("old"));
    let child = cache.find_by_path(&path("/Docs/n.txt")).await.unwrap().unwrap();
    assert_eq!(child.remote_id, id("old-f"));
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_cache_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let db_path = dir.path().join("offsite.db");

    {
        let cache = SqliteFileCache::new(DatabasePool::new(&db_path).await.unwrap());
        cache
            .bootstrap(listing(vec![Ok(file("r1", "doc.txt", &[]))]))
            .await
            .unwrap();
    }

    let cache = SqliteFileCache::new(DatabasePool::new(&db_path).await.unwrap());
    assert!(!cache.is_empty().await.unwrap());
    assert!(cache.find_by_path(&path("/doc.txt")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_second_process_is_locked_out() {
    let dir = tempfile::TempDir::new().unwrap();
    let db_path = dir.path().join("offsite.db");

    let _owner = SqliteFileCache::new(DatabasePool::new(&db_path).await.unwrap());
    let contender = DatabasePool::open(&db_path, Duration::from_millis(100)).await;

    assert!(matches!(contender, Err(CacheError::Locked(_))));
}
