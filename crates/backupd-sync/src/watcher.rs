//! File watching and event routing
//!
//! Provides a [`FileWatcher`] that wraps the `notify` crate to monitor the
//! destination roots, converting raw OS events into [`ChangeEvent`] values.
//! [`forward`] then routes every event to the destination owning its path.
//!
//! ## Architecture
//!
//! ```text
//! inotify
//!    │
//!    ▼
//! FileWatcher ──→ mpsc::channel ──→ forward ──→ Destination ──→ ActionQueue
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::destination::Destination;

// ============================================================================
// ChangeEvent
// ============================================================================

/// A filesystem change, decoupled from `notify`'s raw event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A new file or directory appeared
    Created(PathBuf),
    /// File content or metadata changed
    Modified(PathBuf),
    /// A file or directory disappeared
    Deleted(PathBuf),
    /// A file or directory was renamed or moved
    Renamed {
        /// Path before the rename
        old: PathBuf,
        /// Path after the rename
        new: PathBuf,
    },
}

impl ChangeEvent {
    /// Primary path of the event; the new path for renames
    pub fn path(&self) -> &Path {
        match self {
            ChangeEvent::Created(p) | ChangeEvent::Modified(p) | ChangeEvent::Deleted(p) => p,
            ChangeEvent::Renamed { new, .. } => new,
        }
    }
}

// ============================================================================
// FileWatcher
// ============================================================================

/// Recursive watcher over one or more directories
pub struct FileWatcher {
    watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Creates a watcher and the receiver its events are delivered to
    ///
    /// # Errors
    /// Returns an error if the underlying OS watcher cannot be created
    pub fn new() -> Result<(Self, mpsc::Receiver<ChangeEvent>)> {
        let (tx, rx) = mpsc::channel::<ChangeEvent>(1024);
        let mut renames = RenamePairing::default();

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(change) = renames.map(&event) {
                        if let Err(e) = tx.blocking_send(change) {
                            warn!(error = %e, "Failed to send change event (receiver dropped)");
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "File watcher error");
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        Ok((Self { watcher }, rx))
    }

    /// Starts watching `path` recursively
    ///
    /// # Errors
    /// Returns an error if the path cannot be watched (missing, permission
    /// denied, inotify watch limit reached)
    pub fn watch(&mut self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "Starting recursive watch");
        self.watcher
            .watch(path, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch path: {}", path.display()))
    }
}

/// Drops the `Name(To)` half of renames that `notify` also reports as
/// `Name(Both)`
///
/// inotify delivers a rename within the watched roots as `From`, `To` and
/// then `Both`, all carrying the same tracker. `Both` follows exactly when
/// the tracker of `To` matches the latest `From`, so that `To` is skipped.
/// A `To` without a matching `From` comes from outside the roots and is
/// reported as a creation.
///
/// A `From` never followed by its `To` left every watched root. The file
/// still exists elsewhere, so it is not reported and its backup is kept.
#[derive(Debug, Default)]
struct RenamePairing {
    last_from: Option<usize>,
}

impl RenamePairing {
    fn map(&mut self, event: &notify::Event) -> Option<ChangeEvent> {
        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                if let Some(tracker) = event.attrs.tracker() {
                    self.last_from = Some(tracker);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                if let (Some(tracker), Some(from)) = (event.attrs.tracker(), self.last_from) {
                    if tracker == from {
                        self.last_from = None;
                        debug!(paths = ?event.paths, "Rename target, waiting for the paired event");
                        return None;
                    }
                }
            }
            _ => {}
        }
        map_notify_event(event)
    }
}

/// Converts a `notify::Event` into a [`ChangeEvent`]
///
/// - `Create(*)` and `Modify(Name(To))` -> `Created`
/// - `Modify(Name(Both))` with two paths -> `Renamed`
/// - `Modify(Data | Metadata | Any | Other)` -> `Modified`
/// - `Remove(*)` -> `Deleted`
///
/// `Name(From)` is ignored, see [`RenamePairing`].
fn map_notify_event(event: &notify::Event) -> Option<ChangeEvent> {
    let paths = &event.paths;

    match &event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            let path = paths.first()?;
            Some(ChangeEvent::Created(path.clone()))
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match paths.as_slice() {
            [old, new, ..] => Some(ChangeEvent::Renamed {
                old: old.clone(),
                new: new.clone(),
            }),
            _ => {
                debug!(paths = ?paths, "Rename without both paths, ignoring");
                None
            }
        },

        EventKind::Modify(ModifyKind::Name(_)) => {
            debug!(kind = ?event.kind, "Ignoring partial rename event");
            None
        }

        EventKind::Modify(_) => {
            let path = paths.first()?;
            Some(ChangeEvent::Modified(path.clone()))
        }

        EventKind::Remove(_) => {
            let path = paths.first()?;
            Some(ChangeEvent::Deleted(path.clone()))
        }

        _ => None,
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Destination whose local root is the longest prefix of `path`
fn owner<'a>(destinations: &'a [Arc<Destination>], path: &Path) -> Option<&'a Arc<Destination>> {
    destinations
        .iter()
        .filter(|d| d.contains(path))
        .max_by_key(|d| d.local_root().components().count())
}

/// Hands one change event to the destination owning its path
///
/// A rename across destinations becomes a delete in the old one and an add
/// in the new one. Events outside every destination are ignored.
pub fn route_event(destinations: &[Arc<Destination>], event: &ChangeEvent) {
    let result = match event {
        ChangeEvent::Created(path) => owner(destinations, path).map(|d| d.add(path)),
        ChangeEvent::Modified(path) => owner(destinations, path).map(|d| d.update(path)),
        ChangeEvent::Deleted(path) => owner(destinations, path).map(|d| d.delete(path)),
        ChangeEvent::Renamed { old, new } => {
            match (owner(destinations, old), owner(destinations, new)) {
                (Some(from), Some(to)) if Arc::ptr_eq(from, to) => Some(to.rename(old, new)),
                (from, to) => {
                    let deleted = from.map(|d| d.delete(old)).transpose();
                    let added = to.map(|d| d.add(new)).transpose();
                    match (deleted, added) {
                        (Ok(None), Ok(None)) => None,
                        (Err(e), _) | (_, Err(e)) => Some(Err(e)),
                        _ => Some(Ok(())),
                    }
                }
            }
        }
    };

    match result {
        Some(Err(e)) => warn!(event = ?event, error = %e, "Cannot queue change"),
        None => debug!(path = %event.path().display(), "Change outside every destination"),
        Some(Ok(())) => {}
    }
}

/// Routes events from `events` until the channel closes or `cancel` fires
pub async fn forward(
    mut events: mpsc::Receiver<ChangeEvent>,
    destinations: Vec<Arc<Destination>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => route_event(&destinations, &event),
                None => break,
            },
        }
    }
    debug!("Event forwarding stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use backupd_cache::{DatabasePool, SqliteFileCache};
    use backupd_core::domain::{Action, Message};

    use crate::backend::{Backend, RetryPolicy};
    use crate::folder::FolderService;

    // ------------------------------------------------------------------
    // Event mapping
    // ------------------------------------------------------------------

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        notify::Event {
            kind,
            paths: paths.iter().map(PathBuf::from).collect(),
            attrs: Default::default(),
        }
    }

    #[test]
    fn test_change_event_path() {
        let renamed = ChangeEvent::Renamed {
            old: PathBuf::from("/old.txt"),
            new: PathBuf::from("/new.txt"),
        };
        assert_eq!(renamed.path(), Path::new("/new.txt"));
        assert_eq!(ChangeEvent::Deleted(PathBuf::from("/a")).path(), Path::new("/a"));
    }

    #[test]
    fn test_map_create_event() {
        let mapped = map_notify_event(&event(
            EventKind::Create(notify::event::CreateKind::File),
            &["/a.txt"],
        ));
        assert_eq!(mapped, Some(ChangeEvent::Created(PathBuf::from("/a.txt"))));
    }

    #[test]
    fn test_map_modify_events() {
        let data = map_notify_event(&event(
            EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Content)),
            &["/a.txt"],
        ));
        let metadata = map_notify_event(&event(
            EventKind::Modify(ModifyKind::Metadata(notify::event::MetadataKind::WriteTime)),
            &["/a.txt"],
        ));
        assert_eq!(data, Some(ChangeEvent::Modified(PathBuf::from("/a.txt"))));
        assert_eq!(metadata, data);
    }

    #[test]
    fn test_map_rename_events() {
        let both = map_notify_event(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/old.txt", "/new.txt"],
        ));
        assert_eq!(
            both,
            Some(ChangeEvent::Renamed {
                old: PathBuf::from("/old.txt"),
                new: PathBuf::from("/new.txt"),
            })
        );

        let to = map_notify_event(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            &["/moved-in.txt"],
        ));
        assert_eq!(to, Some(ChangeEvent::Created(PathBuf::from("/moved-in.txt"))));

        let from = map_notify_event(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &["/moved-out.txt"],
        ));
        assert_eq!(from, None);
    }

    fn rename_half(mode: RenameMode, path: &str, tracker: usize) -> notify::Event {
        notify::Event::new(EventKind::Modify(ModifyKind::Name(mode)))
            .add_path(PathBuf::from(path))
            .set_tracker(tracker)
    }

    #[test]
    fn test_paired_rename_is_reported_once() {
        let mut renames = RenamePairing::default();
        let both = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/r/b.txt"))
            .add_path(PathBuf::from("/r/a.txt"))
            .set_tracker(7);

        let mapped: Vec<_> = [
            rename_half(RenameMode::From, "/r/b.txt", 7),
            rename_half(RenameMode::To, "/r/a.txt", 7),
            both,
        ]
        .iter()
        .filter_map(|e| renames.map(e))
        .collect();

        assert_eq!(
            mapped,
            vec![ChangeEvent::Renamed {
                old: PathBuf::from("/r/b.txt"),
                new: PathBuf::from("/r/a.txt"),
            }]
        );
    }

    #[test]
    fn test_unpaired_rename_halves() {
        let mut renames = RenamePairing::default();

        // Moved out of every root: nothing is reported
        assert_eq!(renames.map(&rename_half(RenameMode::From, "/r/gone.txt", 1)), None);

        // Moved in from elsewhere: a creation
        assert_eq!(
            renames.map(&rename_half(RenameMode::To, "/r/new.txt", 2)),
            Some(ChangeEvent::Created(PathBuf::from("/r/new.txt")))
        );

        // A stale From does not swallow a later unrelated To
        assert_eq!(
            renames.map(&rename_half(RenameMode::To, "/r/other.txt", 3)),
            Some(ChangeEvent::Created(PathBuf::from("/r/other.txt")))
        );
    }

    #[test]
    fn test_map_remove_event() {
        let mapped = map_notify_event(&event(
            EventKind::Remove(notify::event::RemoveKind::File),
            &["/a.txt"],
        ));
        assert_eq!(mapped, Some(ChangeEvent::Deleted(PathBuf::from("/a.txt"))));
    }

    #[test]
    fn test_map_access_event_ignored() {
        let mapped = map_notify_event(&event(
            EventKind::Access(notify::event::AccessKind::Read),
            &["/a.txt"],
        ));
        assert_eq!(mapped, None);
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    async fn destination(local_root: &str, remote: &str) -> Arc<Destination> {
        let cache = SqliteFileCache::new(DatabasePool::in_memory().await.unwrap());
        let backend = Arc::new(Backend::new(
            "test",
            Arc::new(cache),
            Arc::new(FolderService::new(std::env::temp_dir().join("backupd-unused"))),
            RetryPolicy::none(),
        ));
        Arc::new(Destination::new(backend, local_root.into(), remote, false).unwrap())
    }

    fn drain(dest: &Destination) -> Vec<Message> {
        std::iter::from_fn(|| dest.backend().queue().try_get()).collect()
    }

    #[tokio::test]
    async fn test_route_to_owning_destination() {
        let docs = destination("/home/me/docs", "docs").await;
        let music = destination("/home/me/music", "music").await;
        let all = vec![docs.clone(), music.clone()];

        route_event(&all, &ChangeEvent::Created(PathBuf::from("/home/me/music/a.mp3")));
        route_event(&all, &ChangeEvent::Modified(PathBuf::from("/tmp/elsewhere")));

        assert!(drain(&docs).is_empty());
        let queued = drain(&music);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].action(), Action::Store);
        assert_eq!(queued[0].remote_path().as_str(), "/music/a.mp3");
    }

    #[tokio::test]
    async fn test_nested_roots_prefer_longest() {
        let home = destination("/home/me", "home").await;
        let docs = destination("/home/me/docs", "docs").await;
        let all = vec![home.clone(), docs.clone()];

        route_event(&all, &ChangeEvent::Deleted(PathBuf::from("/home/me/docs/x")));

        assert!(drain(&home).is_empty());
        assert_eq!(drain(&docs)[0].action(), Action::Trash);
    }

    #[tokio::test]
    async fn test_rename_within_destination() {
        let docs = destination("/docs", "docs").await;
        let all = vec![docs.clone()];

        route_event(
            &all,
            &ChangeEvent::Renamed {
                old: PathBuf::from("/docs/a"),
                new: PathBuf::from("/docs/sub/a"),
            },
        );

        let queued = drain(&docs);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].action(), Action::Move);
        assert_eq!(queued[0].remote_path().as_str(), "/docs/sub/a");
    }

    #[tokio::test]
    async fn test_rename_across_destinations() {
        let docs = destination("/docs", "docs").await;
        let music = destination("/music", "music").await;
        let all = vec![docs.clone(), music.clone()];

        route_event(
            &all,
            &ChangeEvent::Renamed {
                old: PathBuf::from("/docs/a.mp3"),
                new: PathBuf::from("/music/a.mp3"),
            },
        );
        route_event(
            &all,
            &ChangeEvent::Renamed {
                old: PathBuf::from("/tmp/b.mp3"),
                new: PathBuf::from("/music/b.mp3"),
            },
        );

        let from_docs = drain(&docs);
        assert_eq!(from_docs.len(), 1);
        assert_eq!(from_docs[0].action(), Action::Trash);

        let into_music: Vec<_> = drain(&music).iter().map(|m| m.action()).collect();
        assert_eq!(into_music, vec![Action::Store, Action::Store]);
    }

    #[tokio::test]
    async fn test_forward_stops_on_cancel() {
        let docs = destination("/docs", "docs").await;
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward(rx, vec![docs.clone()], cancel.clone()));

        tx.send(ChangeEvent::Created(PathBuf::from("/docs/a"))).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while docs.backend().queue().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(docs.backend().queue().len(), 1);
    }

    #[tokio::test]
    async fn test_watcher_reports_new_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let (mut watcher, mut rx) = FileWatcher::new().unwrap();
        watcher.watch(dir.path()).unwrap();

        let file = dir.path().join("new.txt");
        std::fs::write(&file, b"hello").unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = rx.recv().await {
                if event.path() == file {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(seen);
    }
}
