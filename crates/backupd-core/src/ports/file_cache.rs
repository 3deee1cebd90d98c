//! File cache port (driven/secondary port)
//!
//! The cache is the durable record of what is already known to exist on a
//! backend. It keeps two indices over one store:
//!
//! - `byID`: remote id -> [`RemoteFileRecord`] (authoritative)
//! - `byPath`: resolved remote path -> remote id, a projection of `byID`
//!   through [`resolve_paths`](crate::domain::resolve_paths)
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific.
//! - Every mutating operation is atomic: either all index changes are
//!   committed or none are.
//! - Mutation happens only from the bootstrap phase and from the backend's
//!   single dispatch loop; lookups may run concurrently with it.

use crate::domain::{LocalIdentity, RemoteFileRecord, RemoteId, RemotePath};

use super::remote_service::FileListing;

/// Persistent cache of remote file records for one backend
#[async_trait::async_trait]
pub trait IFileCache: Send + Sync {
    /// Returns true if the cache has never been populated
    ///
    /// Used at connect time to decide whether a bootstrap is required.
    async fn is_empty(&self) -> anyhow::Result<bool>;

    /// Looks up the record a resolved remote path points at
    async fn find_by_path(&self, path: &RemotePath) -> anyhow::Result<Option<RemoteFileRecord>>;

    /// Looks up a record by its remote id
    async fn find_by_id(&self, id: &RemoteId) -> anyhow::Result<Option<RemoteFileRecord>>;

    /// Looks up the record that was uploaded from the given local file
    async fn find_by_local_id(
        &self,
        identity: &LocalIdentity,
    ) -> anyhow::Result<Option<RemoteFileRecord>>;

    /// Inserts or replaces a record and rewrites the paths of its subtree
    ///
    /// Paths previously resolved for the record and its descendants are
    /// removed before the new ones are written. Returns the paths now
    /// resolved for `record` itself.
    async fn insert_or_update(&self, record: &RemoteFileRecord) -> anyhow::Result<Vec<String>>;

    /// Removes a record, its descendants and all their paths
    ///
    /// Returns the number of records removed (0 if the id was unknown).
    async fn remove(&self, id: &RemoteId) -> anyhow::Result<usize>;

    /// Returns every path currently resolved for `id`
    async fn paths_of(&self, id: &RemoteId) -> anyhow::Result<Vec<String>>;

    /// Calls `visit` for every `(path, remote id)` entry of the path index
    async fn for_each_path(
        &self,
        visit: &mut (dyn for<'v> FnMut(&'v str, &'v RemoteId) + Send),
    ) -> anyhow::Result<()>;

    /// Populates the cache from a full remote listing
    ///
    /// The listing is drained inside one transaction. An element carrying an
    /// error aborts the whole population and leaves the cache untouched.
    /// Returns the number of records inserted.
    async fn bootstrap(&self, listing: FileListing) -> anyhow::Result<usize>;

    /// Number of records in the `byID` index
    async fn record_count(&self) -> anyhow::Result<u64>;
}
