//! Domain error types
//!
//! This module defines error types specific to domain operations:
//! validation failures of remote identifiers and paths, local paths that fall
//! outside a destination root, and failures to identify a local file.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Path is not within the local root of a destination
    #[error("Path not within sync root: {0}")]
    PathNotInSyncRoot(String),

    /// Invalid remote path format
    #[error("Invalid remote path: {0}")]
    InvalidRemotePath(String),

    /// Invalid remote ID format
    #[error("Invalid remote ID: {0}")]
    InvalidRemoteId(String),

    /// Configuration is inconsistent (e.g. a source refers to a missing backend)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failure to compute the identity of a local file
///
/// The most common cause is the file vanishing between the change
/// notification and its processing; callers use [`IdentityError::is_not_found`]
/// to tolerate that race.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The file (or its filesystem) could not be stat'ed
    #[error("Cannot stat {path}: {source}")]
    Stat {
        /// Path that was being identified
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },
}

impl IdentityError {
    /// Returns true when the file no longer exists
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Stat { source, .. } => source.kind() == io::ErrorKind::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::PathNotInSyncRoot("/etc/passwd".to_string());
        assert_eq!(err.to_string(), "Path not within sync root: /etc/passwd");

        let err = DomainError::InvalidRemoteId("".to_string());
        assert_eq!(err.to_string(), "Invalid remote ID: ");
    }

    #[test]
    fn test_identity_error_not_found() {
        let err = IdentityError::Stat {
            path: PathBuf::from("/gone"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(err.is_not_found());
        assert!(err.to_string().starts_with("Cannot stat /gone"));

        let err = IdentityError::Stat {
            path: PathBuf::from("/secret"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert!(!err.is_not_found());
    }
}
