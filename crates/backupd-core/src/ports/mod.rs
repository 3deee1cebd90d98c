//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the domain core
//! depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IFileCache`] - Persistent cache of known remote files (by id and by path)
//! - [`IRemoteService`] - Remote storage operations for one backend type

pub mod file_cache;
pub mod remote_service;

pub use file_cache::IFileCache;
pub use remote_service::{FileListing, IRemoteService, RemoteMetadata};
