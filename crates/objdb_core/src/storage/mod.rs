//! Storage abstraction and the bundled implementations.
//!
//! A [`Storage`] hands out OIDs, loads encoded records, accepts
//! transactions as begin/store/end sequences, reports invalidations
//! from other writers, and packs itself. Implementations here:
//!
//! - [`FileStorage`] - the durable append-only log, exclusive to one
//!   process
//! - [`MemoryStorage`] - a throwaway heap store for tests and scratch
//!   work
//! - [`SharedStorage`] - sessions over one underlying store within a
//!   process, with conflict detection between them
//!
//! The client crate adds a fourth implementation that speaks the wire
//! protocol to a server.

mod file;
pub(crate) mod log;
mod memory;
mod shared;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use shared::SharedStorage;

use crate::error::CoreResult;
use crate::types::Oid;

/// A store of encoded records, addressed by OID.
///
/// Records pass through as opaque bytes; the engine encodes and decodes
/// them above this seam. A transaction is `begin`, any number of
/// `store` calls, then `end`, which makes the batch durable atomically
/// or fails without applying any of it. A failed or abandoned batch is
/// discarded by the next `begin`.
pub trait Storage {
    /// Allocates an OID never handed out before by this store.
    ///
    /// # Errors
    ///
    /// Implementation-specific; remote stores can fail on I/O.
    fn new_oid(&mut self) -> CoreResult<Oid>;

    /// Loads the current record bytes for `oid`.
    ///
    /// # Errors
    ///
    /// [`crate::CoreError::NotFound`] if no record exists;
    /// [`crate::CoreError::ReadConflict`] if the OID has a pending
    /// invalidation this session has not synchronized.
    fn load(&mut self, oid: Oid) -> CoreResult<Vec<u8>>;

    /// Opens a transaction, discarding any abandoned batch.
    ///
    /// # Errors
    ///
    /// Implementation-specific.
    fn begin(&mut self) -> CoreResult<()>;

    /// Adds one encoded record to the open transaction.
    ///
    /// # Errors
    ///
    /// Fails if no transaction is open.
    fn store(&mut self, oid: Oid, record: Vec<u8>) -> CoreResult<()>;

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// [`crate::CoreError::WriteConflict`] if another session
    /// invalidated this one since its last sync; the batch is then not
    /// applied. I/O errors otherwise.
    fn end(&mut self) -> CoreResult<()>;

    /// Drains the OIDs other sessions have committed since the last
    /// call.
    ///
    /// # Errors
    ///
    /// Implementation-specific; remote stores can fail on I/O.
    fn sync(&mut self) -> CoreResult<Vec<Oid>>;

    /// Visits every current record in ascending OID order.
    ///
    /// # Errors
    ///
    /// Propagates the first error from `f` or from reading a record.
    fn each_record(
        &mut self,
        f: &mut dyn FnMut(Oid, &[u8]) -> CoreResult<()>,
    ) -> CoreResult<()>;

    /// Compacts the store down to records reachable from the root.
    ///
    /// # Errors
    ///
    /// Implementation-specific.
    fn pack(&mut self) -> CoreResult<()>;
}

impl Storage for Box<dyn Storage> {
    fn new_oid(&mut self) -> CoreResult<Oid> {
        (**self).new_oid()
    }

    fn load(&mut self, oid: Oid) -> CoreResult<Vec<u8>> {
        (**self).load(oid)
    }

    fn begin(&mut self) -> CoreResult<()> {
        (**self).begin()
    }

    fn store(&mut self, oid: Oid, record: Vec<u8>) -> CoreResult<()> {
        (**self).store(oid, record)
    }

    fn end(&mut self) -> CoreResult<()> {
        (**self).end()
    }

    fn sync(&mut self) -> CoreResult<Vec<Oid>> {
        (**self).sync()
    }

    fn each_record(
        &mut self,
        f: &mut dyn FnMut(Oid, &[u8]) -> CoreResult<()>,
    ) -> CoreResult<()> {
        (**self).each_record(f)
    }

    fn pack(&mut self) -> CoreResult<()> {
        (**self).pack()
    }
}
