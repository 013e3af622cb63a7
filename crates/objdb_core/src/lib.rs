//! # ObjDB Core
//!
//! Single-threaded persistent object engine for ObjDB.
//!
//! This crate provides:
//! - Persistent objects with a ghost / unsaved / saved lifecycle
//! - Append-only file storage with checksummed commit blocks
//! - Optimistic concurrency through per-connection invalidation sets
//! - Incremental packing that drops unreachable records
//! - A persistent B-tree and read-only history connections
//!
//! ## Object Lifecycle
//!
//! Objects live behind [`Persistent<T>`] handles and load their state
//! lazily: a handle obtained from a [`Connection`] starts as a ghost
//! and materializes on first read. Modifications mark the object dirty;
//! [`Connection::commit`] serializes every dirty object, walks into
//! fresh objects discovered through references, and writes them all as
//! one atomic block.
//!
//! ## Concurrency Model
//!
//! There are no locks around objects. Each connection tracks the OIDs
//! other writers have committed; commit fails with a write conflict
//! while any are pending, and [`Connection::abort`] resynchronizes by
//! ghosting the stale objects.
//!
//! ## Example
//!
//! ```rust
//! use objdb_core::{BTree, Connection, MemoryStorage, Persistent};
//!
//! let conn = Connection::new(MemoryStorage::new());
//! let tree: Persistent<BTree<u64, String>> = Persistent::new(BTree::new());
//! conn.set_root(&tree).unwrap();
//! tree.insert(1, "one".to_string()).unwrap();
//! conn.commit().unwrap();
//! assert_eq!(tree.get(&1).unwrap().as_deref(), Some("one"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod btree;
mod cache;
mod connection;
mod error;
mod history;
mod persistent;
mod serial;
mod storage;
mod types;

pub use btree::{BTree, TreeIter, TreeKey, TreeValue, DEFAULT_DEGREE, MAX_DEGREE, MIN_DEGREE};
pub use cache::{ObjectCache, DEFAULT_CACHE_TARGET};
pub use connection::Connection;
pub use error::{CoreError, CoreResult};
pub use history::{HistoryConnection, HistoryStorage};
pub use persistent::{ErasedObject, ObjectMeta, Persistent, PersistentState};
pub use serial::{Decode, Encode, Record, StateReader, StateWriter};
pub use storage::{FileStorage, MemoryStorage, SharedStorage, Storage};
pub use types::{ObjectStatus, Oid};
