//! Read-only time travel over a database file.
//!
//! The append-only file keeps every committed version of every record,
//! so any past state can be reconstructed by replaying a prefix of its
//! commit blocks. [`HistoryStorage`] scans the blocks once and then
//! steps a cursor across them; [`HistoryConnection`] layers the usual
//! object surface on top, ghosting whatever a step invalidates so the
//! next access reloads the state visible at the cursor.
//!
//! All mutation paths are rejected. A history connection can open a
//! file that a live writer holds locked, since it never takes the
//! lock itself and never writes.

use crate::connection::Connection;
use crate::error::{CoreError, CoreResult};
use crate::persistent::{Persistent, PersistentState};
use crate::storage::log::RecordLog;
use crate::storage::Storage;
use crate::types::Oid;
use objdb_storage::FileBackend;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::rc::Rc;

fn read_only_op() -> CoreError {
    CoreError::invalid_operation("history storage is read-only")
}

struct HistoryInner {
    log: RecordLog,
    /// Entry lists of each commit block, oldest first.
    blocks: Vec<Vec<(Oid, u64)>>,
    /// Number of leading blocks currently visible.
    position: usize,
    index: HashMap<Oid, u64>,
    /// OIDs invalidated by cursor moves, drained by `sync`.
    pending: BTreeSet<Oid>,
}

impl HistoryInner {
    fn rebuild_index(&mut self) {
        self.index.clear();
        for block in &self.blocks[..self.position] {
            for &(oid, offset) in block {
                self.index.insert(oid, offset);
            }
        }
    }
}

/// A [`Storage`] over a prefix of the commit blocks in a database file.
#[derive(Clone)]
pub struct HistoryStorage {
    inner: Rc<RefCell<HistoryInner>>,
}

impl HistoryStorage {
    /// Opens `path` without locking it and scans its commit blocks.
    /// The cursor starts at the newest state.
    ///
    /// An unterminated tail block is ignored; it was never part of any
    /// committed state.
    ///
    /// # Errors
    ///
    /// I/O failures, or corruption within a terminated block.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let backend = FileBackend::open_read_only(path.as_ref())?;
        let log = RecordLog::open(Box::new(backend))?;
        let scan = log.scan()?;
        if let Some(offset) = scan.partial_tail {
            tracing::debug!(offset, "ignoring unterminated tail block");
        }
        let mut inner = HistoryInner {
            log,
            position: scan.blocks.len(),
            blocks: scan.blocks,
            index: HashMap::new(),
            pending: BTreeSet::new(),
        };
        inner.rebuild_index();
        tracing::debug!(
            path = %path.as_ref().display(),
            blocks = inner.blocks.len(),
            "opened history"
        );
        Ok(Self {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    /// Number of commit blocks in the file.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.inner.borrow().blocks.len()
    }

    /// Number of leading blocks currently visible; equal to
    /// [`Self::block_count`] when the cursor is at the newest state.
    #[must_use]
    pub fn position(&self) -> usize {
        self.inner.borrow().position
    }

    /// Moves the cursor one commit older and returns the OIDs whose
    /// visible version changed. Empty when already at the oldest state.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible to match the forward step.
    pub fn step_backward(&self) -> CoreResult<Vec<Oid>> {
        let mut inner = self.inner.borrow_mut();
        if inner.position == 0 {
            return Ok(Vec::new());
        }
        inner.position -= 1;
        let crossed: Vec<Oid> = inner.blocks[inner.position]
            .iter()
            .map(|&(oid, _)| oid)
            .collect();
        inner.rebuild_index();
        inner.pending.extend(crossed.iter().copied());
        Ok(crossed)
    }

    /// Moves the cursor one commit newer and returns the OIDs whose
    /// visible version changed. Empty when already at the newest state.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible to match the backward step.
    pub fn step_forward(&self) -> CoreResult<Vec<Oid>> {
        let mut inner = self.inner.borrow_mut();
        if inner.position == inner.blocks.len() {
            return Ok(Vec::new());
        }
        let crossed: Vec<Oid> = inner.blocks[inner.position]
            .iter()
            .map(|&(oid, _)| oid)
            .collect();
        let block = inner.blocks[inner.position].clone();
        for (oid, offset) in block {
            inner.index.insert(oid, offset);
        }
        inner.position += 1;
        inner.pending.extend(crossed.iter().copied());
        Ok(crossed)
    }
}

impl Storage for HistoryStorage {
    fn new_oid(&mut self) -> CoreResult<Oid> {
        Err(read_only_op())
    }

    fn load(&mut self, oid: Oid) -> CoreResult<Vec<u8>> {
        let inner = self.inner.borrow();
        let offset = match inner.index.get(&oid) {
            Some(&offset) => offset,
            None => return Err(CoreError::not_found(oid)),
        };
        let (_, bytes) = inner.log.read_entry(offset)?;
        Ok(bytes)
    }

    fn begin(&mut self) -> CoreResult<()> {
        Err(read_only_op())
    }

    fn store(&mut self, _oid: Oid, _record: Vec<u8>) -> CoreResult<()> {
        Err(read_only_op())
    }

    fn end(&mut self) -> CoreResult<()> {
        Err(read_only_op())
    }

    fn sync(&mut self) -> CoreResult<Vec<Oid>> {
        let mut inner = self.inner.borrow_mut();
        let drained: Vec<Oid> = inner.pending.iter().copied().collect();
        inner.pending.clear();
        Ok(drained)
    }

    fn each_record(&mut self, f: &mut dyn FnMut(Oid, &[u8]) -> CoreResult<()>) -> CoreResult<()> {
        let inner = self.inner.borrow();
        let mut oids: Vec<Oid> = inner.index.keys().copied().collect();
        oids.sort_unstable();
        for oid in oids {
            let offset = match inner.index.get(&oid) {
                Some(&offset) => offset,
                None => continue,
            };
            let (_, bytes) = inner.log.read_entry(offset)?;
            f(oid, &bytes)?;
        }
        Ok(())
    }

    fn pack(&mut self) -> CoreResult<()> {
        Err(read_only_op())
    }
}

/// A connection pinned to a movable point in a file's commit history.
pub struct HistoryConnection {
    storage: HistoryStorage,
    conn: Connection<HistoryStorage>,
}

impl HistoryConnection {
    /// Opens `path` positioned at the newest committed state.
    ///
    /// # Errors
    ///
    /// Same as [`HistoryStorage::open`].
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let storage = HistoryStorage::open(path)?;
        let conn = Connection::new(storage.clone());
        Ok(Self { storage, conn })
    }

    /// Steps one commit older, ghosting every object the step
    /// invalidates. Returns the invalidated OIDs; empty at the oldest
    /// state.
    ///
    /// Stepping with uncommitted modifications fails; history objects
    /// must not be modified.
    ///
    /// # Errors
    ///
    /// Propagates the rejection of modified objects.
    pub fn previous(&self) -> CoreResult<Vec<Oid>> {
        self.ensure_unmodified()?;
        let crossed = self.storage.step_backward()?;
        // An empty commit is a pure synchronization draining the
        // pending invalidations into the cache.
        self.conn.commit()?;
        Ok(crossed)
    }

    /// Steps one commit newer; the counterpart of [`Self::previous`].
    ///
    /// # Errors
    ///
    /// Same as [`Self::previous`].
    pub fn next(&self) -> CoreResult<Vec<Oid>> {
        self.ensure_unmodified()?;
        let crossed = self.storage.step_forward()?;
        self.conn.commit()?;
        Ok(crossed)
    }

    // Modified objects are rejected before the cursor moves, so a
    // refused step leaves the cursor on the materialized state.
    fn ensure_unmodified(&self) -> CoreResult<()> {
        if self.conn.changed_oids().is_empty() {
            Ok(())
        } else {
            Err(CoreError::invalid_operation(
                "history objects must not be modified",
            ))
        }
    }

    /// Steps backward until the given object's record changes. Returns
    /// false when the history is exhausted first.
    ///
    /// # Errors
    ///
    /// Fails on detached objects and propagates stepping failures.
    pub fn previous_instance<T: PersistentState>(
        &self,
        obj: &Persistent<T>,
    ) -> CoreResult<bool> {
        let oid = obj
            .oid()
            .ok_or_else(|| CoreError::invalid_operation("detached object has no history"))?;
        loop {
            let crossed = self.previous()?;
            if crossed.is_empty() {
                return Ok(false);
            }
            if crossed.contains(&oid) {
                return Ok(true);
            }
        }
    }

    /// Steps forward until the given object's record changes. Returns
    /// false when the newest state is reached first.
    ///
    /// # Errors
    ///
    /// Same as [`Self::previous_instance`].
    pub fn next_instance<T: PersistentState>(&self, obj: &Persistent<T>) -> CoreResult<bool> {
        let oid = obj
            .oid()
            .ok_or_else(|| CoreError::invalid_operation("detached object has no history"))?;
        loop {
            let crossed = self.next()?;
            if crossed.is_empty() {
                return Ok(false);
            }
            if crossed.contains(&oid) {
                return Ok(true);
            }
        }
    }

    /// The root object at the cursor, or None if it does not exist
    /// there yet.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::root`].
    pub fn root<T: PersistentState>(&self) -> CoreResult<Option<Persistent<T>>> {
        self.conn.root()
    }

    /// A handle for `oid` at the cursor.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::get`].
    pub fn get<T: PersistentState>(&self, oid: Oid) -> CoreResult<Persistent<T>> {
        self.conn.get(oid)
    }

    /// Cursor position, as in [`HistoryStorage::position`].
    #[must_use]
    pub fn position(&self) -> usize {
        self.storage.position()
    }

    /// Total commit blocks, as in [`HistoryStorage::block_count`].
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.storage.block_count()
    }

    /// The underlying connection, for cache introspection.
    #[must_use]
    pub fn connection(&self) -> &Connection<HistoryStorage> {
        &self.conn
    }
}
