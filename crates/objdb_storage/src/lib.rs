//! # ObjDB Storage
//!
//! Byte-level storage backends for ObjDB.
//!
//! This crate provides the lowest-level storage abstraction in the
//! workspace. Backends are **opaque byte stores**: they read, append,
//! truncate, and sync raw bytes. The record-log format, offset indexes,
//! and packing all live a layer up, in `objdb_core` - backends never
//! interpret the data they hold.
//!
//! ## Available backends
//!
//! - [`FileBackend`] - persistent storage over OS file APIs, with an
//!   optional exclusive advisory lock for single-writer stores and a
//!   read-only open for inspection tools
//! - [`InMemoryBackend`] - for tests and ephemeral stores
//!
//! ## Example
//!
//! ```rust
//! use objdb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"record bytes").unwrap();
//! let data = backend.read_at(offset, 12).unwrap();
//! assert_eq!(&data, b"record bytes");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
