//! SQLite implementation of IFileCache
//!
//! This module provides the concrete SQLite-based implementation of the
//! file cache port defined in backupd-core.
//!
//! ## Type Mapping
//!
//! | Domain Type        | SQL Type | Strategy                                   |
//! |--------------------|----------|--------------------------------------------|
//! | RemoteId           | TEXT     | String via `.as_str()` / `RemoteId::new()` |
//! | RemoteFileRecord   | TEXT     | serde_json serialization                   |
//! | resolved path      | TEXT     | `/`-separated absolute path                |
//! | parent_ids         | rows     | one `file_parents` row per position        |
//!
//! ## Path index maintenance
//!
//! `files_by_path` is a projection of `files_by_id`. Whenever a record is
//! written, the paths of the record and of every descendant (found through
//! `file_parents`) are deleted and resolved again, inside the same
//! transaction. A descendant inserted before its parent was therefore
//! re-anchored under the parent once the parent arrives.
//!
//! Two records may resolve to the same path. The last one written holds
//! the path; the other is shadowed. When the holder moves away or is
//! removed, the freed path is handed back to the shadowed record.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use sqlx::SqliteConnection;

use backupd_core::domain::{resolve_paths, LocalIdentity, RemoteFileRecord, RemoteId, RemotePath};
use backupd_core::ports::{FileListing, IFileCache};

use crate::{CacheError, DatabasePool};

/// Key of the marker row written by every successful population
const POPULATED_KEY: &str = "populated_at";

/// SQLite-based implementation of the file cache port
///
/// Owns its [`DatabasePool`], so the cache lock is held for as long as the
/// cache is alive.
pub struct SqliteFileCache {
    db: DatabasePool,
}

impl SqliteFileCache {
    /// Creates a new cache on top of the given pool
    pub fn new(db: DatabasePool) -> Self {
        Self { db }
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

fn decode_record(json: &str) -> Result<RemoteFileRecord, CacheError> {
    serde_json::from_str(json)
        .map_err(|e| CacheError::SerializationError(format!("Invalid cached record: {e}")))
}

fn encode_record(record: &RemoteFileRecord) -> Result<String, CacheError> {
    serde_json::to_string(record).map_err(|e| {
        CacheError::SerializationError(format!(
            "Failed to serialize record {}: {e}",
            record.remote_id
        ))
    })
}

fn decode_id(id: String) -> Result<RemoteId, CacheError> {
    RemoteId::new(id).map_err(|e| CacheError::SerializationError(e.to_string()))
}

// ============================================================================
// Statements shared by the port operations
// ============================================================================

async fn load_record(
    conn: &mut SqliteConnection,
    id: &RemoteId,
) -> Result<Option<RemoteFileRecord>, CacheError> {
    let json: Option<String> =
        sqlx::query_scalar("SELECT record FROM files_by_id WHERE remote_id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut *conn)
            .await?;

    json.as_deref().map(decode_record).transpose()
}

/// Upserts a record into `files_by_id` and rewrites its parent edges
async fn write_record(
    conn: &mut SqliteConnection,
    record: &RemoteFileRecord,
) -> Result<(), CacheError> {
    let json = encode_record(record)?;

    sqlx::query("INSERT OR REPLACE INTO files_by_id (remote_id, local_id, record) VALUES (?, ?, ?)")
        .bind(record.remote_id.as_str())
        .bind(record.local_id.as_deref())
        .bind(&json)
        .execute(&mut *conn)
        .await?;

    sqlx::query("DELETE FROM file_parents WHERE child_id = ?")
        .bind(record.remote_id.as_str())
        .execute(&mut *conn)
        .await?;

    for (position, parent_id) in record.parent_ids.iter().enumerate() {
        sqlx::query("INSERT INTO file_parents (child_id, parent_id, position) VALUES (?, ?, ?)")
            .bind(record.remote_id.as_str())
            .bind(parent_id.as_str())
            .bind(position as i64)
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}

async fn children_of(conn: &mut SqliteConnection, id: &RemoteId) -> Result<Vec<RemoteId>, CacheError> {
    let ids: Vec<String> =
        sqlx::query_scalar("SELECT DISTINCT child_id FROM file_parents WHERE parent_id = ?")
            .bind(id.as_str())
            .fetch_all(&mut *conn)
            .await?;

    ids.into_iter().map(decode_id).collect()
}

async fn parents_of(conn: &mut SqliteConnection, id: &RemoteId) -> Result<Vec<RemoteId>, CacheError> {
    let ids: Vec<String> =
        sqlx::query_scalar("SELECT parent_id FROM file_parents WHERE child_id = ? ORDER BY position")
            .bind(id.as_str())
            .fetch_all(&mut *conn)
            .await?;

    ids.into_iter().map(decode_id).collect()
}

/// `root` followed by all its descendants, breadth first, each once
async fn subtree(conn: &mut SqliteConnection, root: &RemoteId) -> Result<Vec<RemoteId>, CacheError> {
    let mut seen = HashSet::from([root.clone()]);
    let mut order = vec![root.clone()];
    let mut queue = VecDeque::from([root.clone()]);

    while let Some(id) = queue.pop_front() {
        for child in children_of(conn, &id).await? {
            if seen.insert(child.clone()) {
                order.push(child.clone());
                queue.push_back(child);
            }
        }
    }

    Ok(order)
}

/// Loads every known ancestor of `record`, each once
async fn load_ancestors(
    conn: &mut SqliteConnection,
    record: &RemoteFileRecord,
) -> Result<HashMap<RemoteId, RemoteFileRecord>, CacheError> {
    let mut known = HashMap::new();
    let mut missing = HashSet::new();
    let mut queue: VecDeque<RemoteId> = record.parent_ids.iter().cloned().collect();

    while let Some(id) = queue.pop_front() {
        if known.contains_key(&id) || missing.contains(&id) {
            continue;
        }
        match load_record(conn, &id).await? {
            Some(ancestor) => {
                queue.extend(ancestor.parent_ids.iter().cloned());
                known.insert(id, ancestor);
            }
            None => {
                missing.insert(id);
            }
        }
    }

    Ok(known)
}

/// Resolves the paths of `record` against the records stored so far
async fn resolve(
    conn: &mut SqliteConnection,
    record: &RemoteFileRecord,
) -> Result<Vec<String>, CacheError> {
    let known = load_ancestors(conn, record).await?;
    Ok(resolve_paths(record, |id| known.get(id)))
}

async fn write_paths(
    conn: &mut SqliteConnection,
    id: &RemoteId,
    paths: &[String],
) -> Result<(), CacheError> {
    for path in paths {
        sqlx::query("INSERT OR REPLACE INTO files_by_path (path, remote_id) VALUES (?, ?)")
            .bind(path)
            .bind(id.as_str())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Deletes the paths of `id`, returning them
async fn clear_paths(conn: &mut SqliteConnection, id: &RemoteId) -> Result<Vec<String>, CacheError> {
    let paths: Vec<String> =
        sqlx::query_scalar("DELETE FROM files_by_path WHERE remote_id = ? RETURNING path")
            .bind(id.as_str())
            .fetch_all(&mut *conn)
            .await?;
    Ok(paths)
}

/// Hands paths no longer held by anyone to the records resolving to them
///
/// Candidates are the records named like the last component of a freed
/// path. A path taken again in the meantime is left alone.
async fn reanchor(conn: &mut SqliteConnection, freed: &HashSet<String>) -> Result<(), CacheError> {
    let names: HashSet<&str> = freed.iter().filter_map(|p| p.rsplit('/').next()).collect();

    for name in names {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT remote_id FROM files_by_id WHERE json_extract(record, '$.name') = ?",
        )
        .bind(name)
        .fetch_all(&mut *conn)
        .await?;

        for id in ids {
            let id = decode_id(id)?;
            let Some(record) = load_record(conn, &id).await? else {
                continue;
            };
            for path in resolve(conn, &record).await? {
                if !freed.contains(&path) {
                    continue;
                }
                let result =
                    sqlx::query("INSERT OR IGNORE INTO files_by_path (path, remote_id) VALUES (?, ?)")
                        .bind(&path)
                        .bind(id.as_str())
                        .execute(&mut *conn)
                        .await?;
                if result.rows_affected() > 0 {
                    tracing::debug!(remote_id = %id, %path, "Shadowed record re-anchored");
                }
            }
        }
    }

    Ok(())
}

/// Drops and re-resolves the paths of `root` and all its descendants
///
/// Returns the paths resolved for `root` itself.
async fn refresh_subtree(
    conn: &mut SqliteConnection,
    root: &RemoteId,
) -> Result<Vec<String>, CacheError> {
    let ids = subtree(conn, root).await?;
    let mut freed = HashSet::new();
    for id in &ids {
        freed.extend(clear_paths(conn, id).await?);
    }

    let mut root_paths = Vec::new();
    for id in &ids {
        // Edges may point at children that are not cached (yet)
        let Some(record) = load_record(conn, id).await? else {
            continue;
        };
        let paths = resolve(conn, &record).await?;
        write_paths(conn, id, &paths).await?;
        if id == root {
            root_paths = paths;
        }
    }

    if !freed.is_empty() {
        reanchor(conn, &freed).await?;
    }

    Ok(root_paths)
}

async fn mark_populated(conn: &mut SqliteConnection) -> Result<(), CacheError> {
    sqlx::query("INSERT OR REPLACE INTO cache_meta (key, value) VALUES (?, ?)")
        .bind(POPULATED_KEY)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ============================================================================
// IFileCache implementation
// ============================================================================

#[async_trait::async_trait]
impl IFileCache for SqliteFileCache {
    async fn is_empty(&self) -> anyhow::Result<bool> {
        let marker: Option<String> =
            sqlx::query_scalar("SELECT value FROM cache_meta WHERE key = ?")
                .bind(POPULATED_KEY)
                .fetch_optional(self.db.pool())
                .await?;

        Ok(marker.is_none())
    }

    async fn find_by_path(&self, path: &RemotePath) -> anyhow::Result<Option<RemoteFileRecord>> {
        let json: Option<String> = sqlx::query_scalar(
            "SELECT f.record FROM files_by_path p \
             JOIN files_by_id f ON f.remote_id = p.remote_id \
             WHERE p.path = ?",
        )
        .bind(path.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        Ok(json.as_deref().map(decode_record).transpose()?)
    }

    async fn find_by_id(&self, id: &RemoteId) -> anyhow::Result<Option<RemoteFileRecord>> {
        let mut conn = self.db.pool().acquire().await?;
        Ok(load_record(&mut conn, id).await?)
    }

    async fn find_by_local_id(
        &self,
        identity: &LocalIdentity,
    ) -> anyhow::Result<Option<RemoteFileRecord>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT record FROM files_by_id WHERE local_id = ? LIMIT 1")
                .bind(identity.id())
                .fetch_optional(self.db.pool())
                .await?;

        Ok(json.as_deref().map(decode_record).transpose()?)
    }

    async fn insert_or_update(&self, record: &RemoteFileRecord) -> anyhow::Result<Vec<String>> {
        let mut tx = self.db.pool().begin().await?;

        write_record(&mut tx, record).await?;
        let paths = refresh_subtree(&mut tx, &record.remote_id).await?;
        mark_populated(&mut tx).await?;

        tx.commit().await?;

        tracing::trace!(remote_id = %record.remote_id, ?paths, "Cached remote record");
        Ok(paths)
    }

    async fn remove(&self, id: &RemoteId) -> anyhow::Result<usize> {
        let mut tx = self.db.pool().begin().await?;
        let conn: &mut SqliteConnection = &mut tx;

        // A descendant survives if it still has a parent outside the removed set
        let descendants = subtree(conn, id).await?;
        let mut removed: HashSet<RemoteId> = descendants.iter().cloned().collect();
        loop {
            let mut changed = false;
            for child in descendants.iter().skip(1) {
                if !removed.contains(child) {
                    continue;
                }
                let parents = parents_of(conn, child).await?;
                if parents.iter().any(|p| !removed.contains(p)) {
                    removed.remove(child);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let mut count = 0;
        let mut freed = HashSet::new();
        for victim in descendants.iter().filter(|d| removed.contains(*d)) {
            freed.extend(clear_paths(conn, victim).await?);
            let result = sqlx::query("DELETE FROM files_by_id WHERE remote_id = ?")
                .bind(victim.as_str())
                .execute(&mut *conn)
                .await?;
            sqlx::query("DELETE FROM file_parents WHERE child_id = ?")
                .bind(victim.as_str())
                .execute(&mut *conn)
                .await?;
            count += result.rows_affected() as usize;
        }

        for survivor in descendants.iter().filter(|d| !removed.contains(*d)) {
            if let Some(mut record) = load_record(conn, survivor).await? {
                record.parent_ids.retain(|p| !removed.contains(p));
                write_record(conn, &record).await?;
            }
            refresh_subtree(conn, survivor).await?;
        }
        reanchor(conn, &freed).await?;

        tx.commit().await?;

        tracing::debug!(remote_id = %id, removed = count, "Removed cached records");
        Ok(count)
    }

    async fn paths_of(&self, id: &RemoteId) -> anyhow::Result<Vec<String>> {
        let paths: Vec<String> =
            sqlx::query_scalar("SELECT path FROM files_by_path WHERE remote_id = ? ORDER BY path")
                .bind(id.as_str())
                .fetch_all(self.db.pool())
                .await?;

        Ok(paths)
    }

    async fn for_each_path(
        &self,
        visit: &mut (dyn for<'v> FnMut(&'v str, &'v RemoteId) + Send),
    ) -> anyhow::Result<()> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT path, remote_id FROM files_by_path ORDER BY path")
                .fetch_all(self.db.pool())
                .await?;

        for (path, id) in rows {
            visit(&path, &decode_id(id)?);
        }
        Ok(())
    }

    async fn bootstrap(&self, mut listing: FileListing) -> anyhow::Result<usize> {
        let mut tx = self.db.pool().begin().await?;
        let mut inserted = Vec::new();

        while let Some(item) = listing.recv().await {
            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    // Dropping `tx` rolls back every record written so far
                    tracing::error!(
                        received = inserted.len(),
                        error = %e,
                        "Remote listing failed, cache left empty"
                    );
                    return Err(CacheError::Bootstrap(format!("{e:#}")).into());
                }
            };
            write_record(&mut tx, &record).await?;
            inserted.push(record);
        }

        // Paths are resolved once every record is known
        for record in &inserted {
            let paths = resolve(&mut tx, record).await?;
            clear_paths(&mut tx, &record.remote_id).await?;
            write_paths(&mut tx, &record.remote_id, &paths).await?;
        }
        mark_populated(&mut tx).await?;

        tx.commit().await?;

        tracing::info!(records = inserted.len(), "Cache populated from remote listing");
        Ok(inserted.len())
    }

    async fn record_count(&self) -> anyhow::Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files_by_id")
            .fetch_one(self.db.pool())
            .await?;

        Ok(count as u64)
    }
}
