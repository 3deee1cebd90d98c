//! backupd Cache - Persistent remote file cache
//!
//! SQLite-based cache of what is already known to exist on a backend:
//! - Remote file records by remote id (`byID`)
//! - Resolved remote paths by path (`byPath`)
//! - Child/parent edges used to refresh the paths of a subtree
//!
//! ## Architecture
//!
//! This crate implements the `IFileCache` port from `backupd-core` using
//! SQLite as the storage backend. It is a driven (secondary) adapter in the
//! hexagonal architecture. One database file is used per backend, and the
//! file is held exclusively by one process at a time.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool with migration support and the
//!   exclusive lock file
//! - [`SqliteFileCache`] - Full `IFileCache` implementation
//! - [`CacheError`] - Error types for cache operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use std::time::Duration;
//! use backupd_cache::{DatabasePool, SqliteFileCache};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = DatabasePool::open(
//!     Path::new("/home/user/.local/share/backupd/offsite.db"),
//!     Duration::from_secs(1),
//! )
//! .await?;
//! let cache = SqliteFileCache::new(pool);
//! // Use cache as IFileCache...
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;

pub mod pool;
pub mod repository;

pub use pool::DatabasePool;
pub use repository::SqliteFileCache;

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Another process holds the cache
    #[error("Cache is locked by another process: {}", .0.display())]
    Locked(PathBuf),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Serialization or deserialization of domain types failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The remote listing used to populate the cache failed
    #[error("Bootstrap aborted: {0}")]
    Bootstrap(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}
