//! backupd Sync - Synchronization engine
//!
//! Provides:
//! - The per-backend action queue and dispatch loop
//! - Destinations mapping local roots onto remote folders
//! - Startup reconciliation against the persistent cache
//! - Bootstrap of empty caches from a full remote listing
//!
//! ## Modules
//!
//! - [`queue`] - FIFO of pending actions (many producers, one consumer)
//! - [`destination`] - Local/remote path mapping and event intake
//! - [`backend`] - Dispatch loop applying actions through a remote service
//! - [`connect`] - Service registry and wiring from configuration
//! - [`folder`] - Built-in service mirroring into a local directory tree
//! - [`watcher`] - Filesystem change notifications (notify)
//! - [`walker`] - Startup scan of destination roots
//!
//! ## Data flow
//!
//! ```text
//! FileWatcher / walker
//!       │
//!       ▼
//!  Destination ──→ ActionQueue ──→ Backend::run ──→ IRemoteService
//!                                        │
//!                                        ▼
//!                                    IFileCache
//! ```

pub mod backend;
pub mod connect;
pub mod destination;
pub mod folder;
pub mod queue;
pub mod walker;
pub mod watcher;

pub use backend::{Backend, RetryPolicy};
pub use connect::{connect, Connection, ServiceContext, ServiceFactory, ServiceRegistry};
pub use destination::Destination;
pub use queue::ActionQueue;

use thiserror::Error;

/// Errors that can occur while wiring or running the engine
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error occurred during file operations
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// No service factory is registered for a backend's type
    #[error("Unknown backend type '{kind}' for backend '{backend}'")]
    UnknownBackendType {
        /// Name of the backend in the configuration
        backend: String,
        /// Type tag that could not be resolved
        kind: String,
    },

    /// A source refers to a backend that is not configured
    #[error("Backend not configured: {0}")]
    UnknownBackend(String),

    /// A domain-level error propagated from backupd-core
    #[error("Domain error: {0}")]
    DomainError(#[from] backupd_core::domain::DomainError),

    /// The cache of a backend could not be opened or populated
    #[error("Cache error: {0}")]
    CacheError(#[from] backupd_cache::CacheError),
}
