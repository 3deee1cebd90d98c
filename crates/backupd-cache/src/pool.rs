//! Database connection pool management
//!
//! Provides a wrapper around SQLx's SqlitePool with:
//! - Automatic directory creation for database files
//! - An exclusive lock file so only one process uses a cache at a time
//! - WAL journal mode for concurrent reads
//! - Automatic schema migration on first connection
//! - In-memory mode for testing

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::CacheError;

/// Default time to wait for another process to release the lock file
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Interval between two attempts to take the lock file
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Manages a pool of SQLite connections for one backend's cache
///
/// The pool is configured with:
/// - WAL journal mode for concurrent read access
/// - 5 max connections for file-based databases
/// - 1 connection for in-memory databases (required for data persistence)
/// - 5-second busy timeout to handle write contention
///
/// A file-based pool holds an advisory `flock` on `<db>.lock` for as long as
/// it is alive.
pub struct DatabasePool {
    pool: SqlitePool,
    _lock: Option<LockFile>,
}

impl DatabasePool {
    /// Creates a pool for `db_path` using [`DEFAULT_LOCK_TIMEOUT`]
    ///
    /// # Errors
    ///
    /// See [`DatabasePool::open`].
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        Self::open(db_path, DEFAULT_LOCK_TIMEOUT).await
    }

    /// Creates a new database pool connected to the specified file
    ///
    /// This will:
    /// 1. Create parent directories if they don't exist
    /// 2. Take the exclusive lock file, waiting at most `lock_timeout`
    /// 3. Create the database file if it doesn't exist
    /// 4. Enable WAL journal mode
    /// 5. Run schema migrations
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Locked` if another process keeps the lock for
    /// longer than `lock_timeout`, `CacheError::ConnectionFailed` if the
    /// connection cannot be established, or `CacheError::MigrationFailed` if
    /// schema migrations fail.
    pub async fn open(db_path: &Path, lock_timeout: Duration) -> Result<Self, CacheError> {
        // Create parent directory if needed
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let lock = LockFile::acquire(&lock_path(db_path), lock_timeout).await?;

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "Failed to connect to database at {}: {}",
                    db_path.display(),
                    e
                ))
            })?;

        // Run migrations
        Self::run_migrations(&pool).await?;

        tracing::info!(
            path = %db_path.display(),
            "Database pool initialized"
        );

        Ok(Self {
            pool,
            _lock: Some(lock),
        })
    }

    /// Creates an in-memory database pool for testing
    ///
    /// Uses a single connection to ensure data persistence across queries
    /// (SQLite in-memory databases are per-connection). No lock file is taken.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::ConnectionFailed` if the connection cannot be established,
    /// or `CacheError::MigrationFailed` if schema migrations fail.
    pub async fn in_memory() -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!("Failed to create in-memory database: {}", e))
            })?;

        Self::run_migrations(&pool).await?;

        tracing::debug!("In-memory database pool initialized");

        Ok(Self { pool, _lock: None })
    }

    /// Returns a reference to the underlying SQLite connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs the initial schema migration
    async fn run_migrations(pool: &SqlitePool) -> Result<(), CacheError> {
        let migration_sql = include_str!("migrations/20260214_initial.sql");
        sqlx::raw_sql(migration_sql)
            .execute(pool)
            .await
            .map_err(|e| {
                CacheError::MigrationFailed(format!("Failed to run initial migration: {}", e))
            })?;

        tracing::debug!("Database migrations completed");
        Ok(())
    }
}

/// Path of the lock file guarding `db_path`
fn lock_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Exclusive advisory lock, released when the file is closed
struct LockFile {
    _file: File,
}

impl LockFile {
    async fn acquire(path: &Path, timeout: Duration) -> Result<Self, CacheError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "Failed to open lock file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let deadline = Instant::now() + timeout;
        loop {
            // SAFETY: the descriptor belongs to `file`, which outlives the call
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc == 0 {
                tracing::debug!(path = %path.display(), "Cache lock acquired");
                return Ok(Self { _file: file });
            }

            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EWOULDBLOCK) {
                return Err(CacheError::ConnectionFailed(format!(
                    "Failed to lock {}: {}",
                    path.display(),
                    err
                )));
            }
            if Instant::now() >= deadline {
                return Err(CacheError::Locked(path.to_path_buf()));
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }
}
