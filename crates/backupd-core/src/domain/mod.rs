//! Domain entities and business logic
//!
//! This module contains the core domain types for backupd:
//! - Newtypes for remote identifiers and paths
//! - Local file identity (filesystem id + inode)
//! - Cached remote file records
//! - Queued file actions
//! - Multi-parent path resolution
//! - Domain-specific error types

pub mod errors;
pub mod identity;
pub mod message;
pub mod newtypes;
pub mod path_graph;
pub mod remote_file;

// Re-export commonly used types
pub use errors::{DomainError, IdentityError};
pub use identity::LocalIdentity;
pub use message::{Action, Message};
pub use newtypes::{RemoteId, RemotePath};
pub use path_graph::resolve_paths;
pub use remote_file::RemoteFileRecord;
