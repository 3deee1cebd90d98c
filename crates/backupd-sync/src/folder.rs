//! Folder service - a remote service backed by a local directory tree
//!
//! Mirrors a backup into a directory (another disk, a network mount). It is
//! registered under the backend type `folder` and needs one parameter,
//! `root`, the mirror directory.
//!
//! ## Remote model
//!
//! - **Ids**: the inode of the mirrored entry, as 16 hex digits. Content
//!   updates rewrite the file in place so the id is stable.
//! - **Parents**: an entry directly under the mirror root has no parent;
//!   every other entry has exactly one.
//! - **Metadata**: `.backupd/` at the mirror root holds the trash and a
//!   JSON sidecar with the local identities attached to remote entries.
//!   It is never listed.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, Metadata};
use std::io::{ErrorKind, Read};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use backupd_core::domain::{RemoteFileRecord, RemoteId};
use backupd_core::ports::{FileListing, IRemoteService, RemoteMetadata};

/// Name of the metadata directory at the mirror root
pub const METADATA_DIR: &str = ".backupd";

const TRASH_DIR: &str = "trash";
const LOCAL_IDS_FILE: &str = "local_ids.json";
const TMP_SUFFIX: &str = ".backupd-tmp";
const LISTING_CHANNEL_CAPACITY: usize = 64;

/// Remote service storing files in a local directory tree
#[derive(Clone)]
pub struct FolderService {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// Last known location of every id handed out
    index: HashMap<RemoteId, PathBuf>,
    /// Local identities by remote id, loaded on first use
    local_ids: Option<BTreeMap<String, String>>,
}

impl FolderService {
    /// Creates a service mirroring into `root`
    ///
    /// The directory is created on first write.
    pub fn new(root: PathBuf) -> Self {
        Self {
            inner: Arc::new(Inner {
                root,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Mirror root directory
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .context("Folder service task panicked")?
    }
}

#[async_trait]
impl IRemoteService for FolderService {
    #[instrument(skip(self), fields(root = %self.inner.root.display()))]
    async fn load_files(&self) -> Result<FileListing> {
        let (tx, rx) = mpsc::channel(LISTING_CHANNEL_CAPACITY);
        let inner = Arc::clone(&self.inner);

        tokio::task::spawn_blocking(move || {
            let mut count = 0usize;
            let result = inner.walk(&mut |path, metadata| {
                let record = inner.describe(path, metadata)?;
                count += 1;
                // A closed receiver means the consumer gave up
                tx.blocking_send(Ok(record))
                    .map_err(|_| anyhow::anyhow!("Listing receiver dropped"))
            });
            match result {
                Ok(()) => debug!(count, "Listing complete"),
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                }
            }
        });

        Ok(rx)
    }

    #[instrument(skip(self, metadata), fields(name = %metadata.name))]
    async fn create_folder(&self, metadata: &RemoteMetadata) -> Result<RemoteFileRecord> {
        let metadata = metadata.clone();
        self.blocking(move |inner| inner.create_folder(&metadata)).await
    }

    #[instrument(skip(self, metadata), fields(local = %local.display(), name = %metadata.name))]
    async fn upload(&self, local: &Path, metadata: &RemoteMetadata) -> Result<RemoteFileRecord> {
        let (local, metadata) = (local.to_path_buf(), metadata.clone());
        self.blocking(move |inner| inner.upload(&local, &metadata)).await
    }

    #[instrument(skip(self), fields(local = %local.display()))]
    async fn update_content(&self, local: &Path, remote_id: &RemoteId) -> Result<RemoteFileRecord> {
        let (local, remote_id) = (local.to_path_buf(), remote_id.clone());
        self.blocking(move |inner| inner.update_content(&local, &remote_id)).await
    }

    #[instrument(skip(self, metadata), fields(name = %metadata.name))]
    async fn move_file(&self, remote_id: &RemoteId, metadata: &RemoteMetadata) -> Result<RemoteFileRecord> {
        let (remote_id, metadata) = (remote_id.clone(), metadata.clone());
        self.blocking(move |inner| inner.move_file(&remote_id, &metadata)).await
    }

    #[instrument(skip(self))]
    async fn trash(&self, remote_id: &RemoteId) -> Result<()> {
        let remote_id = remote_id.clone();
        self.blocking(move |inner| inner.trash(&remote_id)).await
    }
}

// ============================================================================
// Blocking implementation
// ============================================================================

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn metadata_dir(&self) -> PathBuf {
        self.root.join(METADATA_DIR)
    }

    fn create_folder(&self, metadata: &RemoteMetadata) -> Result<RemoteFileRecord> {
        let target = self.target_path(metadata)?;

        match fs::create_dir(&target) {
            Ok(()) => info!(path = %target.display(), "Created folder"),
            Err(e) if e.kind() == ErrorKind::AlreadyExists && target.is_dir() => {
                debug!(path = %target.display(), "Folder already exists");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot create folder {}", target.display()))
            }
        }

        self.finish(&target, metadata.local_id.as_deref())
    }

    fn upload(&self, local: &Path, metadata: &RemoteMetadata) -> Result<RemoteFileRecord> {
        let target = self.target_path(metadata)?;

        let tmp = {
            let mut p = target.as_os_str().to_owned();
            p.push(TMP_SUFFIX);
            PathBuf::from(p)
        };

        fs::copy(local, &tmp)
            .with_context(|| format!("Cannot copy {} to {}", local.display(), tmp.display()))?;
        if let Some(modified) = metadata.modified {
            set_modified(&tmp, modified)?;
        }
        fs::rename(&tmp, &target)
            .with_context(|| format!("Cannot rename {} to {}", tmp.display(), target.display()))?;

        debug!(path = %target.display(), "Stored file");
        self.finish(&target, metadata.local_id.as_deref())
    }

    fn update_content(&self, local: &Path, remote_id: &RemoteId) -> Result<RemoteFileRecord> {
        let target = self.locate(remote_id)?;
        if target.is_dir() {
            bail!("Cannot replace the content of folder {remote_id}");
        }

        // Copying onto the existing file keeps its inode, hence its id
        fs::copy(local, &target)
            .with_context(|| format!("Cannot copy {} to {}", local.display(), target.display()))?;
        if let Ok(modified) = fs::metadata(local).and_then(|m| m.modified()) {
            set_modified(&target, DateTime::<Utc>::from(modified))?;
        }

        self.finish(&target, None)
    }

    fn move_file(&self, remote_id: &RemoteId, metadata: &RemoteMetadata) -> Result<RemoteFileRecord> {
        let source = self.locate(remote_id)?;
        let target = self.target_path(metadata)?;

        if source != target {
            if target.starts_with(&source) {
                bail!("Cannot move {} into itself", source.display());
            }
            fs::rename(&source, &target).with_context(|| {
                format!("Cannot move {} to {}", source.display(), target.display())
            })?;
            // Descendants keep their ids but their indexed paths are stale
            self.state().index.retain(|_, p| !p.starts_with(&source));
            debug!(from = %source.display(), to = %target.display(), "Moved entry");
        }

        if let (Some(modified), true) = (metadata.modified, target.is_file()) {
            set_modified(&target, modified)?;
        }

        self.finish(&target, metadata.local_id.as_deref())
    }

    fn trash(&self, remote_id: &RemoteId) -> Result<()> {
        let source = self.locate(remote_id)?;
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let trash_dir = self.metadata_dir().join(TRASH_DIR);
        fs::create_dir_all(&trash_dir)
            .with_context(|| format!("Cannot create {}", trash_dir.display()))?;

        let target = trash_dir.join(format!("{remote_id}-{name}"));
        match fs::symlink_metadata(&target) {
            Ok(m) if m.is_dir() => fs::remove_dir_all(&target)?,
            Ok(_) => fs::remove_file(&target)?,
            Err(_) => {}
        }

        fs::rename(&source, &target)
            .with_context(|| format!("Cannot move {} to the trash", source.display()))?;

        let mut state = self.state();
        state.index.retain(|_, p| !p.starts_with(&source));
        drop(state);
        self.store_local_id(remote_id, None)?;

        info!(remote_id = %remote_id, path = %source.display(), "Moved to trash");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Path an entry described by `metadata` is written to
    fn target_path(&self, metadata: &RemoteMetadata) -> Result<PathBuf> {
        let name = metadata.name.as_str();
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            bail!("Invalid entry name: {name:?}");
        }

        let parent = match metadata.parent_ids.first() {
            Some(parent_id) => {
                let parent = self.locate(parent_id)?;
                if !parent.is_dir() {
                    bail!("Parent {parent_id} is not a folder");
                }
                parent
            }
            None => {
                if name == METADATA_DIR {
                    bail!("Reserved entry name: {name}");
                }
                fs::create_dir_all(&self.root)
                    .with_context(|| format!("Cannot create mirror root {}", self.root.display()))?;
                self.root.clone()
            }
        };

        Ok(parent.join(name))
    }

    /// Records the local identity of `path` (if given) and describes it
    fn finish(&self, path: &Path, local_id: Option<&str>) -> Result<RemoteFileRecord> {
        let metadata = fs::metadata(path).with_context(|| format!("Cannot stat {}", path.display()))?;
        if let Some(local_id) = local_id {
            self.store_local_id(&remote_id_of(&metadata)?, Some(local_id))?;
        }
        self.describe(path, &metadata)
    }

    /// Builds the record of the entry at `path` and indexes its id
    fn describe(&self, path: &Path, metadata: &Metadata) -> Result<RemoteFileRecord> {
        let remote_id = remote_id_of(metadata)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let parent_ids = match path.parent() {
            Some(parent) if parent != self.root => {
                let parent_meta = fs::metadata(parent)
                    .with_context(|| format!("Cannot stat {}", parent.display()))?;
                vec![remote_id_of(&parent_meta)?]
            }
            _ => Vec::new(),
        };

        let mut record = if metadata.is_dir() {
            RemoteFileRecord::folder(remote_id.clone(), name, parent_ids)
        } else {
            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let mut record = RemoteFileRecord::new(remote_id.clone(), name)
                .with_parents(parent_ids)
                .with_content(metadata.len(), modified);
            record.checksum = Some(checksum(path)?);
            record
        };

        let mut state = self.state();
        state.index.insert(remote_id.clone(), path.to_path_buf());
        let local_ids = self.local_ids(&mut state)?;
        record.local_id = local_ids.get(remote_id.as_str()).cloned();

        Ok(record)
    }

    /// Current path of `remote_id`, rebuilding the index on a miss
    fn locate(&self, remote_id: &RemoteId) -> Result<PathBuf> {
        let indexed = self.state().index.get(remote_id).cloned();
        if let Some(path) = indexed {
            let still_there = fs::symlink_metadata(&path)
                .ok()
                .and_then(|m| remote_id_of(&m).ok())
                .is_some_and(|id| &id == remote_id);
            if still_there {
                return Ok(path);
            }
        }

        debug!(remote_id = %remote_id, "Index miss, rescanning mirror");
        let mut index = HashMap::new();
        self.walk(&mut |path, metadata| {
            index.insert(remote_id_of(metadata)?, path.to_path_buf());
            Ok(())
        })?;

        let found = index.get(remote_id).cloned();
        self.state().index = index;
        found.with_context(|| format!("Remote file not found: {remote_id}"))
    }

    /// Visits every entry of the mirror, parents before children
    fn walk(&self, visit: &mut dyn FnMut(&Path, &Metadata) -> Result<()>) -> Result<()> {
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound && dir == self.root => return Ok(()),
                Err(e) => return Err(e).with_context(|| format!("Cannot list {}", dir.display())),
            };

            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                let name = entry.file_name();
                if dir == self.root && name == METADATA_DIR {
                    continue;
                }
                if name.to_string_lossy().ends_with(TMP_SUFFIX) {
                    continue;
                }

                let metadata = entry.metadata()?;
                if metadata.file_type().is_symlink() {
                    warn!(path = %path.display(), "Skipping symlink in mirror");
                    continue;
                }

                visit(&path, &metadata)?;
                if metadata.is_dir() {
                    pending.push(path);
                }
            }
        }

        Ok(())
    }

    fn local_ids<'a>(&self, state: &'a mut State) -> Result<&'a mut BTreeMap<String, String>> {
        if state.local_ids.is_none() {
            let path = self.metadata_dir().join(LOCAL_IDS_FILE);
            let loaded = match fs::read(&path) {
                Ok(bytes) => serde_json::from_slice(&bytes)
                    .with_context(|| format!("Corrupt sidecar {}", path.display()))?,
                Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
                Err(e) => return Err(e).with_context(|| format!("Cannot read {}", path.display())),
            };
            state.local_ids = Some(loaded);
        }
        Ok(state.local_ids.get_or_insert_with(BTreeMap::new))
    }

    /// Attaches (or with `None` detaches) a local identity and persists it
    fn store_local_id(&self, remote_id: &RemoteId, local_id: Option<&str>) -> Result<()> {
        let mut state = self.state();
        let local_ids = self.local_ids(&mut state)?;

        let changed = match local_id {
            Some(local_id) => {
                local_ids.insert(remote_id.to_string(), local_id.to_string())
                    != Some(local_id.to_string())
            }
            None => local_ids.remove(remote_id.as_str()).is_some(),
        };
        if !changed {
            return Ok(());
        }

        let dir = self.metadata_dir();
        fs::create_dir_all(&dir).with_context(|| format!("Cannot create {}", dir.display()))?;
        let target = dir.join(LOCAL_IDS_FILE);
        let tmp = dir.join(format!("{LOCAL_IDS_FILE}{TMP_SUFFIX}"));
        fs::write(&tmp, serde_json::to_vec_pretty(&*local_ids)?)
            .with_context(|| format!("Cannot write {}", tmp.display()))?;
        fs::rename(&tmp, &target).with_context(|| format!("Cannot write {}", target.display()))?;
        Ok(())
    }
}

fn remote_id_of(metadata: &Metadata) -> Result<RemoteId> {
    Ok(RemoteId::new(format!("{:016x}", metadata.ino()))?)
}

fn set_modified(path: &Path, modified: DateTime<Utc>) -> Result<()> {
    File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(modified.into()))
        .with_context(|| format!("Cannot set modification time of {}", path.display()))
}

/// SHA-256 of a file's content, lowercase hex
fn checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
