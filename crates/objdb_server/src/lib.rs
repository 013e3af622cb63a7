//! # ObjDB Server
//!
//! Remote storage server multiplexing many client sessions over one
//! append-only storage file.
//!
//! All sessions run cooperatively on a single-threaded runtime, so the
//! storage is never locked: commands execute one at a time and every
//! commit is one atomic begin/end bracket. The server tracks a
//! pending-invalidation set per session; a commit fans the written
//! OIDs out to every other session, which sees them as read or write
//! conflicts until it resynchronizes. Packing runs on the same thread
//! as a background task, one bounded step between client commands, so
//! it never starves the sessions.
//!
//! ```rust,no_run
//! use objdb_core::FileStorage;
//! use objdb_server::{ServerConfig, StorageServer};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = FileStorage::open("objects.odb")?;
//! let server = StorageServer::bind(storage, ServerConfig::default())?;
//! server.run()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Serve-path code must report errors, not panic.
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod server;

pub use config::{BindAddr, ServerConfig, DEFAULT_PORT};
pub use error::{ServerError, ServerResult};
pub use server::{ShutdownHandle, StorageServer};
