//! Startup scan of destination roots
//!
//! Files changed while the daemon was not running never produce a watcher
//! event. The walk visits every regular file under a destination's local
//! root and lets [`Destination::init`] compare it with the cache. Cached
//! files whose local copy disappeared are only counted: deletions made
//! while the daemon was stopped never reach the remote side.

use std::io::ErrorKind;
use std::path::PathBuf;

use backupd_core::domain::{Action, RemoteId, RemotePath};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::destination::Destination;

/// Outcome of one walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    /// Regular files visited
    pub files: usize,
    /// Files queued for upload
    pub stored: usize,
    /// Files queued for a content update
    pub updated: usize,
    /// Directories or files that could not be read
    pub skipped: usize,
    /// Cached entries under the remote root with no local counterpart
    pub missing: usize,
}

/// Walks the local root of `destination`, reconciling every regular file
///
/// Symlinks are not followed. Stops early when `cancel` fires.
pub async fn walk(destination: &Destination, cancel: &CancellationToken) -> WalkSummary {
    let root = destination.local_root();
    let mut summary = WalkSummary::default();
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

    info!(root = %root.display(), "Scanning for changes since last run");

    while let Some(dir) = pending.pop() {
        if cancel.is_cancelled() {
            debug!(root = %root.display(), "Scan cancelled");
            break;
        }

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Cannot read directory, skipping");
                summary.skipped += 1;
                continue;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Directory listing interrupted");
                    summary.skipped += 1;
                    break;
                }
            };

            let path = entry.path();
            let file_type = match entry.file_type().await {
                Ok(file_type) => file_type,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot stat entry, skipping");
                    summary.skipped += 1;
                    continue;
                }
            };

            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            summary.files += 1;
            match destination.init(&path).await {
                Ok(Some(Action::Store)) => summary.stored += 1,
                Ok(Some(_)) => summary.updated += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %format!("{e:#}"), "Cannot reconcile file");
                    summary.skipped += 1;
                }
            }
        }
    }

    if !cancel.is_cancelled() {
        summary.missing = count_missing(destination).await;
    }

    info!(
        root = %root.display(),
        files = summary.files,
        stored = summary.stored,
        updated = summary.updated,
        skipped = summary.skipped,
        missing = summary.missing,
        "Scan complete"
    );
    summary
}

/// Counts cached paths under the remote root whose local path is gone
async fn count_missing(destination: &Destination) -> usize {
    let mut cached = Vec::new();
    let listed = destination
        .backend()
        .cache()
        .for_each_path(&mut |path: &str, _: &RemoteId| cached.push(path.to_string()))
        .await;
    if let Err(e) = listed {
        warn!(error = %format!("{e:#}"), "Cannot list cached paths");
        return 0;
    }

    let mut missing = 0;
    for path in cached {
        let Ok(remote) = RemotePath::new(path) else {
            continue;
        };
        let Ok(local) = destination.local_path(&remote) else {
            continue;
        };
        if let Err(e) = tokio::fs::symlink_metadata(&local).await {
            if e.kind() == ErrorKind::NotFound {
                debug!(path = %local.display(), remote = %remote, "Backed up but missing locally");
                missing += 1;
            }
        }
    }
    missing
}
