//! Persistent object lifecycle and the accessor/mutator write barrier.
//!
//! Every durable object lives behind a [`Persistent<T>`] handle: a shared,
//! cheaply clonable reference to one in-memory object. The object moves
//! through three states:
//!
//! - **Unsaved** - new or dirtied; in memory only
//! - **Saved** - in memory and identical to the durable record
//! - **Ghost** - no in-memory state; reloaded from storage on next access
//!
//! Transitions: Unsaved -> Saved on successful commit; Saved -> Unsaved on
//! mutation; Saved -> Ghost on cache eviction or invalidation;
//! Ghost -> Saved on reload. Mutating a ghost reloads it first and then
//! dirties it, so Ghost -> Unsaved only ever happens through a reload.
//!
//! The write barrier is the [`Persistent::read`] / [`Persistent::modify`]
//! closure pair: both transparently reload a ghost before running the
//! closure, and `modify` additionally marks the object Unsaved and
//! registers it with the owning connection's change set. There is no
//! hidden field interception; the load and dirty points are visible in
//! the code.
//!
//! Re-entrancy: the closures borrow the object's state for their whole
//! run. Do not call connection methods (commit, abort) or touch the same
//! handle again from inside a closure.

use crate::error::{CoreError, CoreResult};
use crate::serial::{StateReader, StateWriter};
use crate::types::{ObjectStatus, Oid};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

/// State types that can live inside a persistent object.
///
/// Implementations write and read their fields through the serializer
/// cursors; references to other persistent objects go through
/// [`StateWriter::put_ref`] / [`StateReader::take_ref`] so the engine can
/// track the object graph without understanding the state itself.
pub trait PersistentState: 'static {
    /// Serializes this state into a record body.
    fn store_state(&self, w: &mut StateWriter<'_>) -> CoreResult<()>;

    /// Reconstructs this state from a record body.
    fn load_state(r: &mut StateReader<'_>) -> CoreResult<Self>
    where
        Self: Sized;
}

/// The connection-side services a persistent object relies on.
///
/// Implemented by the connection core. Objects hold a weak reference to
/// their manager so that dropping the connection detaches its objects
/// instead of leaking it.
pub(crate) trait ObjectManager {
    /// Loads the record for `oid` and installs its state into `target`,
    /// promoting it to Saved.
    fn load_into(&self, oid: Oid, target: &Rc<dyn ErasedObject>) -> CoreResult<()>;

    /// Registers a dirtied object in the change set.
    fn note_changed(&self, oid: Oid, obj: Rc<dyn ErasedObject>);

    /// Returns the live cached object for `oid`, if any.
    fn lookup(&self, oid: Oid) -> Option<Rc<dyn ErasedObject>>;

    /// Caches `obj` under `oid` and makes this manager its owner.
    fn adopt(&self, oid: Oid, obj: Rc<dyn ErasedObject>);

    /// Allocates a fresh OID for an object first reached by a commit.
    fn allocate_oid(&self) -> CoreResult<Oid>;
}

/// Identity and lifecycle metadata shared by all persistent objects.
pub struct ObjectMeta {
    oid: Cell<Option<Oid>>,
    status: Cell<ObjectStatus>,
    touched: Cell<bool>,
    owner: RefCell<Option<Weak<dyn ObjectManager>>>,
}

impl ObjectMeta {
    fn new_unsaved() -> Self {
        Self {
            oid: Cell::new(None),
            status: Cell::new(ObjectStatus::Unsaved),
            touched: Cell::new(false),
            owner: RefCell::new(None),
        }
    }

    fn new_ghost(oid: Oid) -> Self {
        Self {
            oid: Cell::new(Some(oid)),
            status: Cell::new(ObjectStatus::Ghost),
            touched: Cell::new(false),
            owner: RefCell::new(None),
        }
    }

    /// Returns the assigned OID, or None before the first commit.
    #[must_use]
    pub fn oid(&self) -> Option<Oid> {
        self.oid.get()
    }

    /// Returns the current lifecycle status.
    #[must_use]
    pub fn status(&self) -> ObjectStatus {
        self.status.get()
    }

    /// Returns the cache-aging flag.
    #[must_use]
    pub fn is_touched(&self) -> bool {
        self.touched.get()
    }

    pub(crate) fn set_oid(&self, oid: Oid) {
        self.oid.set(Some(oid));
    }

    pub(crate) fn clear_oid(&self) {
        self.oid.set(None);
    }

    pub(crate) fn set_status(&self, status: ObjectStatus) {
        self.status.set(status);
    }

    pub(crate) fn touch(&self) {
        self.touched.set(true);
    }

    pub(crate) fn clear_touched(&self) {
        self.touched.set(false);
    }

    pub(crate) fn set_owner(&self, owner: Weak<dyn ObjectManager>) {
        *self.owner.borrow_mut() = Some(owner);
    }

    pub(crate) fn clear_owner(&self) {
        *self.owner.borrow_mut() = None;
    }

    fn owner(&self) -> Option<Rc<dyn ObjectManager>> {
        self.owner.borrow().as_ref().and_then(Weak::upgrade)
    }
}

impl fmt::Debug for ObjectMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectMeta")
            .field("oid", &self.oid.get())
            .field("status", &self.status.get())
            .field("touched", &self.touched.get())
            .finish_non_exhaustive()
    }
}

/// The shared cell behind a [`Persistent<T>`] handle.
pub(crate) struct PCell<T: PersistentState> {
    meta: ObjectMeta,
    state: RefCell<Option<T>>,
}

/// A type-erased persistent object.
///
/// This is the seam between the typed handles and the untyped machinery
/// (cache, connection change set, serializer). Library users never
/// implement it.
pub trait ErasedObject {
    /// The object's identity and lifecycle metadata.
    fn meta(&self) -> &ObjectMeta;

    /// Discards in-memory state and demotes the object to Ghost.
    fn ghostify(&self);

    /// Installs state decoded from a record and promotes to Saved.
    fn load_state_from(&self, r: &mut StateReader<'_>) -> CoreResult<()>;

    /// Serializes the current state into a record body.
    fn store_state_into(&self, w: &mut StateWriter<'_>) -> CoreResult<()>;

    /// Upcast used to recover the typed cell behind a cached object.
    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any>;
}

impl<T: PersistentState> ErasedObject for PCell<T> {
    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn ghostify(&self) {
        self.state.replace(None);
        self.meta.set_status(ObjectStatus::Ghost);
        self.meta.clear_touched();
    }

    fn load_state_from(&self, r: &mut StateReader<'_>) -> CoreResult<()> {
        let state = T::load_state(r)?;
        self.state.replace(Some(state));
        self.meta.set_status(ObjectStatus::Saved);
        Ok(())
    }

    fn store_state_into(&self, w: &mut StateWriter<'_>) -> CoreResult<()> {
        match self.state.borrow().as_ref() {
            Some(state) => state.store_state(w),
            None => Err(CoreError::invalid_operation(
                "cannot serialize a ghost object",
            )),
        }
    }

    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// A shared handle to a persistent object with state type `T`.
///
/// Handles are cheap to clone and compare by object identity. All state
/// access goes through [`Persistent::read`] and [`Persistent::modify`],
/// which implement the ghost-reload and dirty-marking barrier.
pub struct Persistent<T: PersistentState> {
    cell: Rc<PCell<T>>,
}

impl<T: PersistentState> Persistent<T> {
    /// Creates a fresh, detached object in the Unsaved state.
    ///
    /// The object has no OID and no owning connection until a commit
    /// first reaches it through a reference from another persistent
    /// object (or through `Connection::set_root`).
    #[must_use]
    pub fn new(state: T) -> Self {
        Self {
            cell: Rc::new(PCell {
                meta: ObjectMeta::new_unsaved(),
                state: RefCell::new(Some(state)),
            }),
        }
    }

    /// Creates a ghost handle for a known OID with no state loaded.
    pub(crate) fn new_ghost(oid: Oid) -> Self {
        Self {
            cell: Rc::new(PCell {
                meta: ObjectMeta::new_ghost(oid),
                state: RefCell::new(None),
            }),
        }
    }

    /// Recovers a typed handle from a cached erased object.
    ///
    /// Returns None if the object was cached under a different state
    /// type.
    pub(crate) fn from_erased(erased: Rc<dyn ErasedObject>) -> Option<Self> {
        erased
            .as_any_rc()
            .downcast::<PCell<T>>()
            .ok()
            .map(|cell| Self { cell })
    }

    /// The type-erased view of this object.
    pub(crate) fn erased(&self) -> Rc<dyn ErasedObject> {
        Rc::clone(&self.cell) as Rc<dyn ErasedObject>
    }

    /// Returns the assigned OID, or None before the first commit.
    #[must_use]
    pub fn oid(&self) -> Option<Oid> {
        self.cell.meta.oid()
    }

    /// Returns the current lifecycle status.
    #[must_use]
    pub fn status(&self) -> ObjectStatus {
        self.cell.meta.status()
    }

    /// Returns true if the object currently holds no in-memory state.
    #[must_use]
    pub fn is_ghost(&self) -> bool {
        self.status() == ObjectStatus::Ghost
    }

    /// Reads the object's state through the barrier.
    ///
    /// Reloads the state from the owning connection first if the object
    /// is a ghost.
    ///
    /// # Errors
    ///
    /// Fails if a ghost cannot be reloaded (detached handle, missing
    /// record, or invalidated OID).
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> CoreResult<R> {
        self.ensure_loaded()?;
        self.cell.meta.touch();
        match self.cell.state.borrow().as_ref() {
            Some(state) => Ok(f(state)),
            None => Err(CoreError::invalid_operation(
                "object state missing after load",
            )),
        }
    }

    /// Mutates the object's state through the barrier.
    ///
    /// Reloads a ghost first, then marks the object Unsaved and
    /// registers it with the owning connection's change set (unless it
    /// is already Unsaved), then runs the closure on the state.
    ///
    /// # Errors
    ///
    /// Fails if a ghost cannot be reloaded.
    pub fn modify<R>(&self, f: impl FnOnce(&mut T) -> R) -> CoreResult<R> {
        self.ensure_loaded()?;
        self.cell.meta.touch();
        self.mark_changed();
        match self.cell.state.borrow_mut().as_mut() {
            Some(state) => Ok(f(state)),
            None => Err(CoreError::invalid_operation(
                "object state missing after load",
            )),
        }
    }

    fn ensure_loaded(&self) -> CoreResult<()> {
        if self.cell.meta.status() != ObjectStatus::Ghost {
            return Ok(());
        }
        let oid = self
            .cell
            .meta
            .oid()
            .ok_or_else(|| CoreError::invalid_operation("ghost object without an OID"))?;
        let owner = self.cell.meta.owner().ok_or_else(|| {
            CoreError::invalid_operation("object is detached from its connection")
        })?;
        owner.load_into(oid, &self.erased())
    }

    fn mark_changed(&self) {
        if self.cell.meta.status() == ObjectStatus::Unsaved {
            return;
        }
        self.cell.meta.set_status(ObjectStatus::Unsaved);
        if let (Some(oid), Some(owner)) = (self.cell.meta.oid(), self.cell.meta.owner()) {
            owner.note_changed(oid, self.erased());
        }
    }

    /// Identity comparison: do two handles refer to the same object?
    #[must_use]
    pub fn same_object(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<T: PersistentState> Clone for Persistent<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Rc::clone(&self.cell),
        }
    }
}

impl<T: PersistentState> PartialEq for Persistent<T> {
    fn eq(&self, other: &Self) -> bool {
        self.same_object(other)
    }
}

impl<T: PersistentState> Eq for Persistent<T> {}

impl<T: PersistentState> fmt::Debug for Persistent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persistent")
            .field("oid", &self.cell.meta.oid())
            .field("status", &self.cell.meta.status())
            .finish_non_exhaustive()
    }
}
