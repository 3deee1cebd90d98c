//! Remote service port (driven/secondary port)
//!
//! This module defines the interface to the remote storage a backend writes
//! to. One implementation exists per backend type (e.g. the built-in local
//! folder mirror); the dispatch loop only talks to this trait.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because errors at port boundaries are adapter-specific.
//! - Uses `#[async_trait]` for async trait methods.
//! - Every mutating call returns the backend's view of the entry afterwards,
//!   which the caller stores in the cache as is.

use std::path::Path;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::domain::{RemoteFileRecord, RemoteId};

/// One-shot stream of remote records produced by [`IRemoteService::load_files`]
///
/// The producer closes the channel when the listing is complete. An `Err`
/// element means the listing failed; nothing after it is meaningful.
pub type FileListing = mpsc::Receiver<anyhow::Result<RemoteFileRecord>>;

/// Metadata sent along with a create, upload or move
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMetadata {
    /// Target entry name
    pub name: String,
    /// Target parent folders; empty means the remote root
    pub parent_ids: Vec<RemoteId>,
    /// Identity of the local file the entry mirrors
    pub local_id: Option<String>,
    /// Local modification time to record remotely
    pub modified: Option<DateTime<Utc>>,
}

impl RemoteMetadata {
    /// Creates metadata for an entry with the given name and parent
    #[must_use]
    pub fn new(name: impl Into<String>, parent: Option<RemoteId>) -> Self {
        Self {
            name: name.into(),
            parent_ids: parent.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Sets the local identity
    #[must_use]
    pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
        self.local_id = Some(local_id.into());
        self
    }

    /// Sets the modification time
    #[must_use]
    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }
}

/// Remote storage operations for one backend
#[async_trait::async_trait]
pub trait IRemoteService: Send + Sync {
    /// Lists every file and folder on the remote side
    ///
    /// Only used to bootstrap an empty cache. Implementations spawn the
    /// producer and return the receiving end immediately.
    async fn load_files(&self) -> anyhow::Result<FileListing>;

    /// Creates a folder
    async fn create_folder(&self, metadata: &RemoteMetadata) -> anyhow::Result<RemoteFileRecord>;

    /// Uploads the content of `local_path` as a new remote file
    async fn upload(
        &self,
        local_path: &Path,
        metadata: &RemoteMetadata,
    ) -> anyhow::Result<RemoteFileRecord>;

    /// Replaces the content of an existing remote file
    async fn update_content(
        &self,
        local_path: &Path,
        remote_id: &RemoteId,
    ) -> anyhow::Result<RemoteFileRecord>;

    /// Renames and/or reparents an existing remote entry
    async fn move_file(
        &self,
        remote_id: &RemoteId,
        metadata: &RemoteMetadata,
    ) -> anyhow::Result<RemoteFileRecord>;

    /// Moves a remote entry to the trash
    async fn trash(&self, remote_id: &RemoteId) -> anyhow::Result<()>;
}
