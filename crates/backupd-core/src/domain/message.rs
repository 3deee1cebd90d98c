//! Queued file actions

use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::newtypes::RemotePath;

/// What the backend must do for a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Upload a file not yet known remotely (or recognise a moved one)
    Store,
    /// Replace the content of a known remote file
    Update,
    /// Move the remote file to the trash
    Trash,
    /// The local file changed parent directory
    Move,
    /// The local file changed name within the same directory
    Rename,
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Store => "store",
            Self::Update => "update",
            Self::Trash => "trash",
            Self::Move => "move",
            Self::Rename => "rename",
        };
        write!(f, "{name}")
    }
}

/// A pending action for one file
///
/// Created by a destination and consumed exactly once by its backend's
/// dispatch loop. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    local_path: PathBuf,
    remote_path: RemotePath,
    action: Action,
    local_root: Option<PathBuf>,
}

impl Message {
    /// Creates a new message
    #[must_use]
    pub fn new(local_path: PathBuf, remote_path: RemotePath, action: Action) -> Self {
        Self {
            local_path,
            remote_path,
            action,
            local_root: None,
        }
    }

    /// Sets the local directory the remote destination folder mirrors
    #[must_use]
    pub fn with_local_root(mut self, root: PathBuf) -> Self {
        self.local_root = Some(root);
        self
    }

    /// Local file path
    #[must_use]
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Remote path the file maps to
    #[must_use]
    pub fn remote_path(&self) -> &RemotePath {
        &self.remote_path
    }

    /// Action to perform
    #[must_use]
    pub fn action(&self) -> Action {
        self.action
    }

    /// Local directory mirrored by the destination folder, if known
    ///
    /// Folders above it have no local counterpart.
    #[must_use]
    pub fn local_root(&self) -> Option<&Path> {
        self.local_root.as_deref()
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.action,
            self.local_path.display(),
            self.remote_path
        )
    }
}
