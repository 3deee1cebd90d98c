//! Destinations: one local root mapped onto one remote folder
//!
//! A [`Destination`] translates local paths into remote paths and turns
//! file events into queued messages for its backend. It never talks to the
//! remote service itself.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use backupd_core::domain::{Action, DomainError, Message, RemotePath};

use crate::backend::Backend;

/// Mapping from a local root directory to a remote root folder
pub struct Destination {
    backend: Arc<Backend>,
    local_root: PathBuf,
    remote_root: RemotePath,
    encrypt: bool,
}

impl Destination {
    /// Creates a destination
    ///
    /// `remote_folder` is relative to the backend's root; leading and
    /// trailing slashes are ignored.
    ///
    /// # Errors
    /// Returns an error if `remote_folder` is not a valid remote path
    pub fn new(
        backend: Arc<Backend>,
        local_root: PathBuf,
        remote_folder: &str,
        encrypt: bool,
    ) -> Result<Self, DomainError> {
        let remote_root = RemotePath::new(format!("/{}", remote_folder.trim_matches('/')))?;

        if encrypt {
            warn!(
                local_root = %local_root.display(),
                "Encryption requested but not supported; files are stored as is"
            );
        }

        Ok(Self {
            backend,
            local_root,
            remote_root,
            encrypt,
        })
    }

    /// Backend this destination feeds
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Local root directory
    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    /// Remote root folder
    pub fn remote_root(&self) -> &RemotePath {
        &self.remote_root
    }

    /// Whether encryption was requested
    pub fn encrypt(&self) -> bool {
        self.encrypt
    }

    /// Returns true if `local` lies within the local root
    pub fn contains(&self, local: &Path) -> bool {
        local.starts_with(&self.local_root)
    }

    // ------------------------------------------------------------------------
    // Path translation
    // ------------------------------------------------------------------------

    /// Maps a local path under the local root to its remote path
    ///
    /// # Errors
    /// Returns `PathNotInSyncRoot` if `local` is outside the local root, or
    /// `InvalidRemotePath` for names that cannot be represented remotely
    pub fn remote_path(&self, local: &Path) -> Result<RemotePath, DomainError> {
        let relative = local
            .strip_prefix(&self.local_root)
            .map_err(|_| DomainError::PathNotInSyncRoot(local.display().to_string()))?;

        let mut remote = self.remote_root.clone();
        for component in relative.components() {
            let Component::Normal(name) = component else {
                return Err(DomainError::InvalidRemotePath(format!(
                    "Unsupported path component in {}",
                    local.display()
                )));
            };
            let name = name.to_str().ok_or_else(|| {
                DomainError::InvalidRemotePath(format!("Non UTF-8 name in {}", local.display()))
            })?;
            remote = remote.join(name)?;
        }

        Ok(remote)
    }

    /// Maps a remote path under the remote root back to its local path
    ///
    /// # Errors
    /// Returns `PathNotInSyncRoot` if `remote` is outside the remote root
    pub fn local_path(&self, remote: &RemotePath) -> Result<PathBuf, DomainError> {
        let root = self.remote_root.as_str();
        let relative = if self.remote_root.is_root() {
            Some(remote.as_str().trim_start_matches('/'))
        } else if remote.as_str() == root {
            Some("")
        } else {
            remote
                .as_str()
                .strip_prefix(root)
                .and_then(|rest| rest.strip_prefix('/'))
        };

        let relative =
            relative.ok_or_else(|| DomainError::PathNotInSyncRoot(remote.to_string()))?;

        if relative.is_empty() {
            Ok(self.local_root.clone())
        } else {
            Ok(self.local_root.join(relative))
        }
    }

    // ------------------------------------------------------------------------
    // Event intake
    // ------------------------------------------------------------------------

    /// Startup reconciliation of one local file against the cache
    ///
    /// Enqueues `Store` when the remote path is unknown and `Update` when the
    /// size differs or the local file is newer (to the second) than the
    /// cached record. Returns the enqueued action, if any.
    ///
    /// # Errors
    /// Returns an error if the path is outside the local root or the cache
    /// lookup fails. Local stat failures are logged and skipped.
    pub async fn init(&self, local: &Path) -> anyhow::Result<Option<Action>> {
        let remote = self.remote_path(local)?;

        let Some(record) = self.backend.cache().find_by_path(&remote).await? else {
            self.push(local, remote, Action::Store);
            return Ok(Some(Action::Store));
        };

        let metadata = match tokio::fs::metadata(local).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %local.display(), "File vanished during startup scan");
                return Ok(None);
            }
            Err(e) => {
                warn!(path = %local.display(), error = %e, "Cannot stat file, skipping");
                return Ok(None);
            }
        };

        let local_secs = metadata
            .modified()
            .map(|t| DateTime::<Utc>::from(t).timestamp())
            .unwrap_or(0);
        let remote_secs = record.modified_time().map(|t| t.timestamp()).unwrap_or(0);

        if metadata.len() != record.size || local_secs > remote_secs {
            debug!(
                path = %local.display(),
                local_size = metadata.len(),
                remote_size = record.size,
                local_secs,
                remote_secs,
                "Local file differs from backup"
            );
            self.push(local, remote, Action::Update);
            return Ok(Some(Action::Update));
        }

        Ok(None)
    }

    /// A new file appeared
    pub fn add(&self, local: &Path) -> Result<(), DomainError> {
        self.enqueue(local, Action::Store)
    }

    /// A file's content changed
    pub fn update(&self, local: &Path) -> Result<(), DomainError> {
        self.enqueue(local, Action::Update)
    }

    /// A file was removed
    pub fn delete(&self, local: &Path) -> Result<(), DomainError> {
        self.enqueue(local, Action::Trash)
    }

    /// A file was renamed from `old` to `new`, both under the local root
    ///
    /// Enqueues `Rename` when only the name changed and `Move` when the
    /// parent directory changed.
    pub fn rename(&self, old: &Path, new: &Path) -> Result<(), DomainError> {
        if !self.contains(old) {
            return Err(DomainError::PathNotInSyncRoot(old.display().to_string()));
        }
        let action = if old.parent() == new.parent() {
            Action::Rename
        } else {
            Action::Move
        };
        self.enqueue(new, action)
    }

    fn enqueue(&self, local: &Path, action: Action) -> Result<(), DomainError> {
        let remote = self.remote_path(local)?;
        self.push(local, remote, action);
        Ok(())
    }

    fn push(&self, local: &Path, remote: RemotePath, action: Action) {
        debug!(path = %local.display(), remote = %remote, %action, "Queued");
        let message = Message::new(local.to_path_buf(), remote, action)
            .with_local_root(self.local_root.clone());
        self.backend.queue().add(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    use backupd_cache::{DatabasePool, SqliteFileCache};
    use backupd_core::domain::{RemoteFileRecord, RemoteId};
    use backupd_core::ports::IFileCache;

    use crate::backend::RetryPolicy;
    use crate::folder::FolderService;

    async fn backend() -> Arc<Backend> {
        let cache = SqliteFileCache::new(DatabasePool::in_memory().await.unwrap());
        Arc::new(Backend::new(
            "test",
            Arc::new(cache),
            Arc::new(FolderService::new(std::env::temp_dir().join("backupd-unused"))),
            RetryPolicy::none(),
        ))
    }

    fn remote(s: &str) -> RemotePath {
        RemotePath::new(s.to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_remote_root_normalised() {
        let b = backend().await;
        let dest = Destination::new(b.clone(), "/src".into(), "Backups/me/", false).unwrap();
        assert_eq!(dest.remote_root().as_str(), "/Backups/me");

        let dest = Destination::new(b, "/src".into(), "", false).unwrap();
        assert!(dest.remote_root().is_root());
    }

    #[tokio::test]
    async fn test_path_translation() {
        let dest = Destination::new(backend().await, "/home/me/docs".into(), "Backups", false).unwrap();

        let mapped = dest.remote_path(Path::new("/home/me/docs/a/b.txt")).unwrap();
        assert_eq!(mapped, remote("/Backups/a/b.txt"));
        assert_eq!(dest.local_path(&mapped).unwrap(), PathBuf::from("/home/me/docs/a/b.txt"));

        assert_eq!(dest.remote_path(Path::new("/home/me/docs")).unwrap(), remote("/Backups"));
        assert_eq!(dest.local_path(&remote("/Backups")).unwrap(), PathBuf::from("/home/me/docs"));
    }

    #[tokio::test]
    async fn test_paths_outside_roots_rejected() {
        let dest = Destination::new(backend().await, "/home/me/docs".into(), "Backups", false).unwrap();

        assert!(matches!(
            dest.remote_path(Path::new("/home/me/docsx/file")),
            Err(DomainError::PathNotInSyncRoot(_))
        ));
        assert!(matches!(
            dest.local_path(&remote("/BackupsOld/file")),
            Err(DomainError::PathNotInSyncRoot(_))
        ));
        assert!(dest.add(Path::new("/etc/passwd")).is_err());
        assert!(dest.backend().queue().is_empty());
    }

    #[tokio::test]
    async fn test_local_path_with_root_remote() {
        let dest = Destination::new(backend().await, "/data".into(), "/", false).unwrap();
        assert_eq!(dest.local_path(&remote("/x/y")).unwrap(), PathBuf::from("/data/x/y"));
        assert_eq!(dest.remote_path(Path::new("/data/x/y")).unwrap(), remote("/x/y"));
    }

    #[tokio::test]
    async fn test_event_intake_actions() {
        let dest = Destination::new(backend().await, "/src".into(), "dst", false).unwrap();
        let queue = dest.backend().queue();

        dest.add(Path::new("/src/a")).unwrap();
        dest.update(Path::new("/src/a")).unwrap();
        dest.delete(Path::new("/src/a")).unwrap();
        dest.rename(Path::new("/src/a"), Path::new("/src/b")).unwrap();
        dest.rename(Path::new("/src/b"), Path::new("/src/sub/b")).unwrap();

        let actions: Vec<(Action, String)> = std::iter::from_fn(|| queue.try_get())
            .map(|m| (m.action(), m.remote_path().to_string()))
            .collect();
        assert_eq!(
            actions,
            vec![
                (Action::Store, "/dst/a".to_string()),
                (Action::Update, "/dst/a".to_string()),
                (Action::Trash, "/dst/a".to_string()),
                (Action::Rename, "/dst/b".to_string()),
                (Action::Move, "/dst/sub/b".to_string()),
            ]
        );
    }

    // ------------------------------------------------------------------
    // init decision table
    // ------------------------------------------------------------------

    /// Writes a 16-byte local file, caches a record for it whose
    /// modification time is the local one shifted by `offset_secs`, and
    /// returns the queue length after `init`.
    async fn init_with(record_size: u64, offset_secs: i64, cached: bool) -> usize {
        let dir = tempfile::TempDir::new().unwrap();
        let local = dir.path().join("file.txt");
        std::fs::write(&local, b"0123456789abcdef").unwrap();

        // Whole seconds so the comparison is exact
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        std::fs::File::options()
            .write(true)
            .open(&local)
            .unwrap()
            .set_modified(mtime)
            .unwrap();

        let dest = Destination::new(backend().await, dir.path().to_path_buf(), "dst", false).unwrap();

        if cached {
            let remote_time = DateTime::<Utc>::from(mtime) + chrono::Duration::seconds(offset_secs);
            let record = RemoteFileRecord::new(RemoteId::new("r1".to_string()).unwrap(), "file.txt")
                .with_parents(vec![RemoteId::new("dst-id".to_string()).unwrap()])
                .with_content(record_size, remote_time);
            let folder = RemoteFileRecord::folder(RemoteId::new("dst-id".to_string()).unwrap(), "dst", vec![]);
            dest.backend().cache().insert_or_update(&folder).await.unwrap();
            dest.backend().cache().insert_or_update(&record).await.unwrap();
        }

        dest.init(&local).await.unwrap();
        dest.backend().queue().len()
    }

    #[tokio::test]
    async fn test_init_uncached_file_is_stored() {
        assert_eq!(init_with(16, 0, false).await, 1);
    }

    #[tokio::test]
    async fn test_init_same_size_and_time_is_skipped() {
        assert_eq!(init_with(16, 0, true).await, 0);
    }

    #[tokio::test]
    async fn test_init_older_remote_record_triggers_update() {
        assert_eq!(init_with(16, -1, true).await, 1);
    }

    #[tokio::test]
    async fn test_init_newer_remote_record_is_skipped() {
        assert_eq!(init_with(16, 1, true).await, 0);
    }

    #[tokio::test]
    async fn test_init_size_mismatch_triggers_update() {
        assert_eq!(init_with(17, 0, true).await, 1);
    }

    #[tokio::test]
    async fn test_init_vanished_file_is_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let dest = Destination::new(backend().await, dir.path().to_path_buf(), "", false).unwrap();
        let record = RemoteFileRecord::new(RemoteId::new("r1".to_string()).unwrap(), "gone.txt");
        dest.backend().cache().insert_or_update(&record).await.unwrap();

        let action = dest.init(&dir.path().join("gone.txt")).await.unwrap();

        assert_eq!(action, None);
        assert!(dest.backend().queue().is_empty());
    }
}
