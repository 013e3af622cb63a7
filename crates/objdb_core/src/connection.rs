//! Connections: the transactional seam between objects and storage.
//!
//! A connection owns a storage, an object cache, and the bookkeeping
//! sets of one optimistic transaction:
//!
//! - **changed** - dirty objects, keyed by OID, serialized on commit
//! - **loaded** - OIDs whose state is currently in memory
//! - **invalid** - OIDs other writers committed that this connection
//!   has not resynchronized past
//!
//! Commit serializes the dirty objects in OID order, walking into
//! fresh objects discovered through references and assigning them OIDs
//! as it goes, then writes the batch as one storage transaction. There
//! is no merge step: if any invalidation is pending, commit fails with
//! a write conflict and the caller must [`Connection::abort`] and redo
//! its work against the new state.
//!
//! Connections are single-threaded by construction; handles obtained
//! from one connection must stay on its thread.

use crate::cache::{ObjectCache, DEFAULT_CACHE_TARGET};
use crate::error::{CoreError, CoreResult};
use crate::persistent::{ErasedObject, ObjectManager, Persistent, PersistentState};
use crate::serial::{Record, StateReader, StateWriter};
use crate::storage::Storage;
use crate::types::{ObjectStatus, Oid};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::rc::{Rc, Weak};

/// A single-threaded session over a [`Storage`].
pub struct Connection<S: Storage + 'static> {
    core: Rc<ConnCore<S>>,
}

struct ConnCore<S: Storage> {
    storage: RefCell<S>,
    cache: RefCell<ObjectCache>,
    changed: RefCell<BTreeMap<Oid, Rc<dyn ErasedObject>>>,
    loaded: RefCell<HashSet<Oid>>,
    invalid: RefCell<BTreeSet<Oid>>,
    // Records fetched by `get` and not yet decoded into their ghost.
    prefetched: RefCell<HashMap<Oid, Vec<u8>>>,
    me: RefCell<Option<Weak<dyn ObjectManager>>>,
}

impl<S: Storage + 'static> Connection<S> {
    /// Opens a connection with the default cache target.
    pub fn new(storage: S) -> Self {
        Self::with_cache_size(storage, DEFAULT_CACHE_TARGET)
    }

    /// Opens a connection aiming to keep at most `cache_target` loaded
    /// objects between transactions.
    pub fn with_cache_size(storage: S, cache_target: usize) -> Self {
        let core = Rc::new(ConnCore {
            storage: RefCell::new(storage),
            cache: RefCell::new(ObjectCache::new(cache_target)),
            changed: RefCell::new(BTreeMap::new()),
            loaded: RefCell::new(HashSet::new()),
            invalid: RefCell::new(BTreeSet::new()),
            prefetched: RefCell::new(HashMap::new()),
            me: RefCell::new(None),
        });
        let weak = Rc::downgrade(&core);
        let weak: Weak<dyn ObjectManager> = weak;
        *core.me.borrow_mut() = Some(weak);
        Self { core }
    }

    /// Returns a handle for `oid` as a ghost, loading no state yet.
    ///
    /// The same OID always yields the same in-memory object while any
    /// handle to it is alive.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] if no record exists,
    /// [`CoreError::ReadConflict`] if the OID awaits resynchronization,
    /// [`CoreError::TypeMismatch`] if the cached object has a different
    /// state type.
    pub fn get<T: PersistentState>(&self, oid: Oid) -> CoreResult<Persistent<T>> {
        if let Some(obj) = self.core.cache.borrow_mut().get(oid) {
            obj.meta().touch();
            return Persistent::from_erased(obj).ok_or(CoreError::TypeMismatch { oid });
        }
        if self.core.invalid.borrow().contains(&oid) {
            return Err(CoreError::read_conflict(vec![oid]));
        }
        // The state stays out of memory until first access, but the
        // record fetched here is kept so that access does not read
        // storage a second time.
        let bytes = match self.core.storage.borrow_mut().load(oid) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.core.note_conflict(&err);
                return Err(err);
            }
        };
        self.core.prefetched.borrow_mut().insert(oid, bytes);
        let handle = Persistent::<T>::new_ghost(oid);
        self.core.adopt(oid, handle.erased());
        Ok(handle)
    }

    /// Returns the root object, or None if the store has never had one.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::get`], except a missing root is not an
    /// error.
    pub fn root<T: PersistentState>(&self) -> CoreResult<Option<Persistent<T>>> {
        match self.get::<T>(Oid::ROOT) {
            Ok(handle) => Ok(Some(handle)),
            Err(CoreError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Binds a fresh object to the root OID. It becomes durable on the
    /// next commit.
    ///
    /// # Errors
    ///
    /// Fails if the object is already bound to a non-root OID.
    pub fn set_root<T: PersistentState>(&self, root: &Persistent<T>) -> CoreResult<()> {
        let erased = root.erased();
        match erased.meta().oid() {
            None => {
                erased.meta().set_oid(Oid::ROOT);
                self.core.adopt(Oid::ROOT, Rc::clone(&erased));
                self.core.note_changed(Oid::ROOT, erased);
                Ok(())
            }
            Some(oid) if oid.is_root() => Ok(()),
            Some(other) => Err(CoreError::invalid_operation(format!(
                "object already bound to {other}, cannot become the root"
            ))),
        }
    }

    /// Commits all changed objects as one transaction.
    ///
    /// With no changed objects this degenerates to a synchronization:
    /// invalidations from other writers are drained and the affected
    /// cached objects are ghosted.
    ///
    /// # Errors
    ///
    /// [`CoreError::WriteConflict`] if invalidations are pending; the
    /// dirty objects stay dirty and the caller decides whether to
    /// [`Connection::abort`]. Storage errors otherwise.
    pub fn commit(&self) -> CoreResult<()> {
        self.core.commit()
    }

    /// Discards all uncommitted changes and resynchronizes.
    ///
    /// Dirty objects are demoted to ghosts, so the next access reloads
    /// the committed state. A dirty object that was never committed has
    /// no committed state; accessing it afterwards fails.
    ///
    /// # Errors
    ///
    /// Storage errors from the synchronization step.
    pub fn abort(&self) -> CoreResult<()> {
        self.core.abort()
    }

    /// Compacts the underlying storage down to reachable records.
    ///
    /// # Errors
    ///
    /// Storage errors; packing inside an open transaction is rejected
    /// by the file store.
    pub fn pack(&self) -> CoreResult<()> {
        self.core.storage.borrow_mut().pack()
    }

    /// OIDs of currently dirty objects, ascending.
    #[must_use]
    pub fn changed_oids(&self) -> Vec<Oid> {
        self.core.changed.borrow().keys().copied().collect()
    }

    /// OIDs whose state is currently in memory, ascending.
    #[must_use]
    pub fn loaded_oids(&self) -> Vec<Oid> {
        let mut oids: Vec<Oid> = self.core.loaded.borrow().iter().copied().collect();
        oids.sort_unstable();
        oids
    }

    /// OIDs invalidated by other writers and not yet resynchronized,
    /// ascending.
    #[must_use]
    pub fn invalid_oids(&self) -> Vec<Oid> {
        self.core.invalid.borrow().iter().copied().collect()
    }

    /// Current number of cache entries.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.core.cache.borrow().len()
    }

    /// The cache's configured target size.
    #[must_use]
    pub fn cache_target(&self) -> usize {
        self.core.cache.borrow().target_size()
    }

    /// Adjusts the cache target; applies from the next transaction
    /// boundary.
    pub fn set_cache_target(&self, target: usize) {
        self.core.cache.borrow_mut().set_target_size(target);
    }
}

impl<S: Storage + 'static> ConnCore<S> {
    fn commit(&self) -> CoreResult<()> {
        if self.changed.borrow().is_empty() {
            return self.synchronize();
        }
        {
            let invalid = self.invalid.borrow();
            if !invalid.is_empty() {
                return Err(CoreError::write_conflict(invalid.iter().copied().collect()));
            }
        }
        self.storage.borrow_mut().begin()?;

        let mut queue: VecDeque<Rc<dyn ErasedObject>> =
            self.changed.borrow().values().cloned().collect();
        let mut written: Vec<Rc<dyn ErasedObject>> = Vec::new();
        let mut fresh: Vec<Rc<dyn ErasedObject>> = Vec::new();

        let result = (|| -> CoreResult<()> {
            while let Some(obj) = queue.pop_front() {
                let oid = obj
                    .meta()
                    .oid()
                    .ok_or_else(|| CoreError::invalid_operation("dirty object without an OID"))?;
                let mut w = StateWriter::new(self);
                obj.store_state_into(&mut w)?;
                let (record, discovered) = w.finish(oid);
                for obj in discovered {
                    fresh.push(Rc::clone(&obj));
                    queue.push_back(obj);
                }
                self.storage.borrow_mut().store(oid, record.encode()?)?;
                written.push(obj);
            }
            self.storage.borrow_mut().end()
        })();

        match result {
            Ok(()) => {
                {
                    let mut loaded = self.loaded.borrow_mut();
                    for obj in &written {
                        obj.meta().set_status(ObjectStatus::Saved);
                        if let Some(oid) = obj.meta().oid() {
                            loaded.insert(oid);
                        }
                    }
                }
                self.changed.borrow_mut().clear();
                self.shrink();
                tracing::debug!(records = written.len(), "transaction committed");
                Ok(())
            }
            Err(err) => {
                // Objects first reached by this failed commit go back
                // to being plain detached values.
                for obj in &fresh {
                    if let Some(oid) = obj.meta().oid() {
                        self.cache.borrow_mut().remove(oid);
                    }
                    obj.meta().clear_oid();
                    obj.meta().clear_owner();
                }
                self.note_conflict(&err);
                Err(err)
            }
        }
    }

    fn abort(&self) -> CoreResult<()> {
        let dirty: Vec<Rc<dyn ErasedObject>> = {
            let mut changed = self.changed.borrow_mut();
            let dirty = changed.values().cloned().collect();
            changed.clear();
            dirty
        };
        for obj in dirty {
            obj.ghostify();
            if let Some(oid) = obj.meta().oid() {
                self.loaded.borrow_mut().remove(&oid);
            }
        }
        self.synchronize()
    }

    fn synchronize(&self) -> CoreResult<()> {
        let newly = self.storage.borrow_mut().sync()?;
        self.invalid.borrow_mut().extend(newly);
        let drained: Vec<Oid> = {
            let mut invalid = self.invalid.borrow_mut();
            let drained = invalid.iter().copied().collect();
            invalid.clear();
            drained
        };
        for oid in drained {
            // An undecoded fetch is as stale as a loaded state.
            self.prefetched.borrow_mut().remove(&oid);
            if let Some(obj) = self.cache.borrow_mut().get(oid) {
                obj.ghostify();
            }
            self.loaded.borrow_mut().remove(&oid);
        }
        self.shrink();
        Ok(())
    }

    fn shrink(&self) {
        let mut loaded = self.loaded.borrow_mut();
        let ghosted = self.cache.borrow_mut().shrink(&mut loaded);
        if ghosted > 0 {
            tracing::trace!(ghosted, "cache shrink demoted objects");
        }
        // A stashed record is useless once its ghost is gone.
        let mut cache = self.cache.borrow_mut();
        self.prefetched
            .borrow_mut()
            .retain(|oid, _| cache.get(*oid).is_some());
    }

    fn note_conflict(&self, err: &CoreError) {
        if let Some(oids) = err.conflict_oids() {
            self.invalid.borrow_mut().extend(oids.iter().copied());
        }
    }
}

impl<S: Storage + 'static> ObjectManager for ConnCore<S> {
    fn load_into(&self, oid: Oid, target: &Rc<dyn ErasedObject>) -> CoreResult<()> {
        if self.invalid.borrow().contains(&oid) {
            return Err(CoreError::read_conflict(vec![oid]));
        }
        let prefetched = self.prefetched.borrow_mut().remove(&oid);
        let bytes = match prefetched {
            Some(bytes) => bytes,
            None => match self.storage.borrow_mut().load(oid) {
                Ok(bytes) => bytes,
                Err(err) => {
                    self.note_conflict(&err);
                    return Err(err);
                }
            },
        };
        let record = Record::decode(&bytes)?;
        if record.oid() != oid {
            return Err(CoreError::corrupt(format!(
                "record for {} loaded under {oid}",
                record.oid()
            )));
        }
        let mut reader = StateReader::new(&record, self);
        target.load_state_from(&mut reader)?;
        reader.expect_end()?;
        self.loaded.borrow_mut().insert(oid);
        Ok(())
    }

    fn note_changed(&self, oid: Oid, obj: Rc<dyn ErasedObject>) {
        self.changed.borrow_mut().insert(oid, obj);
    }

    fn lookup(&self, oid: Oid) -> Option<Rc<dyn ErasedObject>> {
        self.cache.borrow_mut().get(oid)
    }

    fn adopt(&self, oid: Oid, obj: Rc<dyn ErasedObject>) {
        if let Some(me) = self.me.borrow().clone() {
            obj.meta().set_owner(me);
        }
        self.cache.borrow_mut().insert(oid, &obj);
    }

    fn allocate_oid(&self) -> CoreResult<Oid> {
        self.storage.borrow_mut().new_oid()
    }
}
