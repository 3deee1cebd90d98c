//! Cached description of a remote file or folder

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::RemoteId;

/// MIME type the remote side uses for folders
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// A file or folder known to exist on the remote backend
///
/// `parent_ids` models a DAG rather than a tree: an entry may live in more
/// than one folder at once, or in none (a root-level entry). `local_id` is
/// the [`LocalIdentity::id`](super::LocalIdentity::id) of the local file the
/// entry was uploaded from, when known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileRecord {
    /// Identifier assigned by the remote backend
    pub remote_id: RemoteId,
    /// Entry name (last path component)
    pub name: String,
    /// MIME type reported by the backend
    pub mime_type: String,
    /// Size in bytes
    pub size: u64,
    /// Content checksum, when the backend provides one
    pub checksum: Option<String>,
    /// Parent folder ids, in the order the backend reports them
    pub parent_ids: Vec<RemoteId>,
    /// Last modification time as an RFC 3339 string
    pub last_modified: String,
    /// Identity of the local file this entry mirrors
    pub local_id: Option<String>,
}

impl RemoteFileRecord {
    /// Creates a root-level file record with no content information
    #[must_use]
    pub fn new(remote_id: RemoteId, name: impl Into<String>) -> Self {
        Self {
            remote_id,
            name: name.into(),
            mime_type: "application/octet-stream".to_string(),
            size: 0,
            checksum: None,
            parent_ids: Vec::new(),
            last_modified: Utc::now().to_rfc3339(),
            local_id: None,
        }
    }

    /// Creates a folder record under the given parents
    #[must_use]
    pub fn folder(remote_id: RemoteId, name: impl Into<String>, parent_ids: Vec<RemoteId>) -> Self {
        Self {
            mime_type: FOLDER_MIME_TYPE.to_string(),
            parent_ids,
            ..Self::new(remote_id, name)
        }
    }

    /// Sets the parent ids
    #[must_use]
    pub fn with_parents(mut self, parent_ids: Vec<RemoteId>) -> Self {
        self.parent_ids = parent_ids;
        self
    }

    /// Sets the size and modification time
    #[must_use]
    pub fn with_content(mut self, size: u64, last_modified: DateTime<Utc>) -> Self {
        self.size = size;
        self.last_modified = last_modified.to_rfc3339();
        self
    }

    /// Sets the local identity
    #[must_use]
    pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
        self.local_id = Some(local_id.into());
        self
    }

    /// Returns true if the entry is a folder
    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    /// Parses `last_modified`; `None` if it is not valid RFC 3339
    #[must_use]
    pub fn modified_time(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.last_modified)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}
