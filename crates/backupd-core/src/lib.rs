//! backupd Core - Domain logic for the synchronization engine
//!
//! This crate contains:
//! - **Domain types** - `LocalIdentity`, `RemoteFileRecord`, `Message`/`Action`,
//!   remote path and id newtypes
//! - **Path resolution** - expansion of a record's parent graph into every
//!   absolute remote path it is reachable by
//! - **Port definitions** - traits for adapters: `FileCache`, `RemoteService`
//! - **Configuration** - the YAML configuration file
//!
//! # Architecture
//!
//! The domain module has no I/O apart from `LocalIdentity::identify`, which
//! stats a local file. Ports define the trait interfaces that the cache and
//! service adapter crates implement.

pub mod config;
pub mod domain;
pub mod ports;
