//! Weak object cache with incremental clock eviction.
//!
//! The cache maps OIDs to weak references, so it never keeps an object
//! alive by itself; it guarantees identity (one in-memory object per
//! OID per connection) while handles exist, and forgets entries whose
//! objects were dropped.
//!
//! Eviction is not LRU. [`ObjectCache::shrink`] runs at transaction
//! boundaries and sweeps a bounded window of entries starting at a
//! finger position that persists across calls. Objects accessed since
//! the last sweep get their touched flag cleared and survive; Saved
//! objects not accessed for a full revolution are demoted to ghosts.
//! Unsaved objects and existing ghosts are never evicted. The window is
//! sized to the excess over the target, clamped between 1/64 and 1/4 of
//! the cache, so one sweep costs a bounded slice of the whole.

use crate::persistent::ErasedObject;
use crate::types::{ObjectStatus, Oid};
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::rc::{Rc, Weak};

/// Default number of loaded objects a connection aims to keep.
pub const DEFAULT_CACHE_TARGET: usize = 10_000;

/// Per-connection object cache.
pub struct ObjectCache {
    objects: BTreeMap<Oid, Weak<dyn ErasedObject>>,
    target: usize,
    finger: Option<Oid>,
}

impl ObjectCache {
    /// Creates a cache aiming to keep at most `target` loaded objects.
    #[must_use]
    pub fn new(target: usize) -> Self {
        Self {
            objects: BTreeMap::new(),
            target,
            finger: None,
        }
    }

    /// The configured target size.
    #[must_use]
    pub fn target_size(&self) -> usize {
        self.target
    }

    /// Adjusts the target size; takes effect on the next shrink.
    pub fn set_target_size(&mut self, target: usize) {
        self.target = target;
    }

    /// Number of entries, counting dead ones not yet pruned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Looks up the live object for `oid`.
    ///
    /// A dead entry found here is pruned on the spot.
    pub fn get(&mut self, oid: Oid) -> Option<Rc<dyn ErasedObject>> {
        match self.objects.get(&oid).map(Weak::upgrade) {
            Some(Some(obj)) => Some(obj),
            Some(None) => {
                self.objects.remove(&oid);
                None
            }
            None => None,
        }
    }

    /// Caches `obj` under `oid`, replacing any previous entry.
    pub fn insert(&mut self, oid: Oid, obj: &Rc<dyn ErasedObject>) {
        self.objects.insert(oid, Rc::downgrade(obj));
    }

    /// Drops the entry for `oid`, if any.
    pub fn remove(&mut self, oid: Oid) {
        self.objects.remove(&oid);
    }

    /// Sweeps one window of entries, demoting stale Saved objects to
    /// ghosts. Returns the number of objects ghosted.
    ///
    /// `loaded` is the connection's loaded-OID set; OIDs whose objects
    /// are ghosted or found dead are removed from it, since their state
    /// is no longer in memory.
    pub fn shrink(&mut self, loaded: &mut HashSet<Oid>) -> usize {
        let current = self.objects.len();
        if current <= self.target {
            return 0;
        }
        let excess = current - self.target;
        let window = excess.clamp(current / 64, current / 4).max(1);

        let mut keys: Vec<Oid> = Vec::with_capacity(window);
        match self.finger {
            Some(f) => {
                keys.extend(self.objects.range(f..).map(|(k, _)| *k).take(window));
                if keys.len() < window {
                    let rest = window - keys.len();
                    keys.extend(self.objects.range(..f).map(|(k, _)| *k).take(rest));
                }
            }
            None => keys.extend(self.objects.keys().copied().take(window)),
        }

        let mut ghosted = 0;
        for oid in &keys {
            let Some(entry) = self.objects.get(oid) else {
                continue;
            };
            match entry.upgrade() {
                None => {
                    self.objects.remove(oid);
                    loaded.remove(oid);
                }
                Some(obj) => {
                    let meta = obj.meta();
                    if meta.is_touched() {
                        meta.clear_touched();
                    } else if meta.status() == ObjectStatus::Saved {
                        obj.ghostify();
                        loaded.remove(oid);
                        ghosted += 1;
                    }
                }
            }
        }

        self.finger = keys.last().and_then(|last| {
            self.objects
                .range((Bound::Excluded(*last), Bound::Unbounded))
                .next()
                .map(|(k, _)| *k)
        });
        ghosted
    }
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("len", &self.objects.len())
            .field("target", &self.target)
            .field("finger", &self.finger)
            .finish()
    }
}
