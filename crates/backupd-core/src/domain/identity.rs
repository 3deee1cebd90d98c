//! Local file identity
//!
//! A [`LocalIdentity`] recognises a local file independently of its current
//! path: it is keyed on the filesystem the file lives on and its inode, so a
//! file that is renamed or moved within the same filesystem keeps its
//! identity and can be matched against the remote copy that was uploaded
//! under its previous name.

use std::ffi::CString;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::errors::IdentityError;

/// Identity of a local file: filesystem id, inode and size
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalIdentity {
    filesystem_id: String,
    inode: u64,
    size: u64,
}

impl LocalIdentity {
    /// Builds an identity from already known parts
    #[must_use]
    pub fn new(filesystem_id: impl Into<String>, inode: u64, size: u64) -> Self {
        Self {
            filesystem_id: filesystem_id.into(),
            inode,
            size,
        }
    }

    /// Stats `path` and computes its identity
    ///
    /// # Errors
    /// Returns [`IdentityError::Stat`] if either the file or its filesystem
    /// cannot be stat'ed. A file that vanished reports `is_not_found()`.
    pub fn identify(path: &Path) -> Result<Self, IdentityError> {
        let stat_error = |source: io::Error| IdentityError::Stat {
            path: path.to_path_buf(),
            source,
        };

        let metadata = std::fs::metadata(path).map_err(stat_error)?;
        let fsid = filesystem_id(path).map_err(stat_error)?;

        Ok(Self {
            filesystem_id: format!("{fsid:016x}"),
            inode: metadata.ino(),
            size: metadata.size(),
        })
    }

    /// Cache key for this file: `"<filesystem id>-<16 hex digit inode>"`
    ///
    /// The size is not part of the key.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}-{:016x}", self.filesystem_id, self.inode)
    }

    /// Filesystem identifier
    #[must_use]
    pub fn filesystem_id(&self) -> &str {
        &self.filesystem_id
    }

    /// Inode number
    #[must_use]
    pub fn inode(&self) -> u64 {
        self.inode
    }

    /// Size in bytes at the time of the stat
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Display for LocalIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Returns the `f_fsid` of the filesystem holding `path`
fn filesystem_id(path: &Path) -> io::Result<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut buf = MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: c_path is a valid NUL-terminated string and buf is writable
    // memory of the right size; statvfs initialises it on success.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), buf.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: statvfs returned 0
    let stat = unsafe { buf.assume_init() };

    #[allow(clippy::unnecessary_cast)]
    Ok(stat.f_fsid as u64)
}
