//! # ObjDB Client
//!
//! Blocking client for a remote ObjDB storage server.
//!
//! [`RemoteStorage`] speaks the objdb_proto exchange over a TCP or
//! Unix-domain socket and implements the engine's `Storage` trait, so
//! a `Connection` works against a server exactly as it does against a
//! local file:
//!
//! - OIDs are allocated in batches and handed out from a local pool
//! - `load` fetches one record and surfaces server-side invalidation
//!   as a read conflict
//! - the commit exchange delivers pending invalidations first, turning
//!   a stale transaction into a write conflict before any data moves
//!
//! One socket serves one connection; the client is not thread-safe.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod remote;

pub use remote::{RemoteStorage, OID_BATCH_SIZE};
