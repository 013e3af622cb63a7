//! Several sessions over one storage within a process.
//!
//! Each [`SharedStorage`] handle is one session; cloning the view with
//! [`SharedStorage::new_session`] registers another. When a session
//! commits, the written OIDs are queued as invalidations for every
//! other session. A session with unseen invalidations cannot commit
//! (write conflict) or load an invalidated OID (read conflict) until it
//! drains them with [`Storage::sync`].
//!
//! This is the in-process analogue of the client/server conflict
//! protocol, and what the engine's optimistic concurrency tests run
//! against.

use crate::error::{CoreError, CoreResult};
use crate::storage::log::SENTINEL_OID;
use crate::storage::Storage;
use crate::types::Oid;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

struct Hub {
    base: Box<dyn Storage>,
    sessions: HashMap<u64, BTreeSet<Oid>>,
    next_session: u64,
}

/// One session over a shared underlying storage.
pub struct SharedStorage {
    hub: Rc<RefCell<Hub>>,
    session: u64,
    pending: Vec<(Oid, Vec<u8>)>,
    in_txn: bool,
}

impl SharedStorage {
    /// Wraps `base` and opens the first session over it.
    pub fn new(base: impl Storage + 'static) -> Self {
        let mut sessions = HashMap::new();
        sessions.insert(0, BTreeSet::new());
        Self {
            hub: Rc::new(RefCell::new(Hub {
                base: Box::new(base),
                sessions,
                next_session: 1,
            })),
            session: 0,
            pending: Vec::new(),
            in_txn: false,
        }
    }

    /// Opens another session over the same underlying storage.
    #[must_use]
    pub fn new_session(&self) -> Self {
        let mut hub = self.hub.borrow_mut();
        let session = hub.next_session;
        hub.next_session += 1;
        hub.sessions.insert(session, BTreeSet::new());
        drop(hub);
        Self {
            hub: Rc::clone(&self.hub),
            session,
            pending: Vec::new(),
            in_txn: false,
        }
    }

    /// Invalidations queued for this session, without draining them.
    #[must_use]
    pub fn pending_invalidations(&self) -> Vec<Oid> {
        self.hub
            .borrow()
            .sessions
            .get(&self.session)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Storage for SharedStorage {
    fn new_oid(&mut self) -> CoreResult<Oid> {
        self.hub.borrow_mut().base.new_oid()
    }

    fn load(&mut self, oid: Oid) -> CoreResult<Vec<u8>> {
        let mut hub = self.hub.borrow_mut();
        let stale = hub
            .sessions
            .get(&self.session)
            .is_some_and(|set| set.contains(&oid));
        if stale {
            return Err(CoreError::read_conflict(vec![oid]));
        }
        hub.base.load(oid)
    }

    fn begin(&mut self) -> CoreResult<()> {
        self.pending.clear();
        self.in_txn = true;
        Ok(())
    }

    fn store(&mut self, oid: Oid, record: Vec<u8>) -> CoreResult<()> {
        if !self.in_txn {
            return Err(CoreError::invalid_operation(
                "store outside of a transaction",
            ));
        }
        if oid.as_u64() == SENTINEL_OID {
            return Err(CoreError::invalid_operation(
                "oid u64::MAX is reserved for the block marker",
            ));
        }
        self.pending.push((oid, record));
        Ok(())
    }

    fn end(&mut self) -> CoreResult<()> {
        if !self.in_txn {
            return Err(CoreError::invalid_operation("end without begin"));
        }
        self.in_txn = false;

        let mut hub = self.hub.borrow_mut();
        let unseen: Vec<Oid> = hub
            .sessions
            .get(&self.session)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        if !unseen.is_empty() {
            // The invalidations stay queued; a sync is the only way
            // out.
            self.pending.clear();
            return Err(CoreError::write_conflict(unseen));
        }

        let records = std::mem::take(&mut self.pending);
        if records.is_empty() {
            return Ok(());
        }
        hub.base.begin()?;
        for (oid, record) in &records {
            hub.base.store(*oid, record.clone())?;
        }
        hub.base.end()?;

        let written: Vec<Oid> = records.iter().map(|(oid, _)| *oid).collect();
        let me = self.session;
        for (id, set) in &mut hub.sessions {
            if *id != me {
                set.extend(written.iter().copied());
            }
        }
        Ok(())
    }

    fn sync(&mut self) -> CoreResult<Vec<Oid>> {
        let mut hub = self.hub.borrow_mut();
        Ok(hub
            .sessions
            .get_mut(&self.session)
            .map(|set| std::mem::take(set).into_iter().collect())
            .unwrap_or_default())
    }

    fn each_record(
        &mut self,
        f: &mut dyn FnMut(Oid, &[u8]) -> CoreResult<()>,
    ) -> CoreResult<()> {
        self.hub.borrow_mut().base.each_record(f)
    }

    fn pack(&mut self) -> CoreResult<()> {
        self.hub.borrow_mut().base.pack()
    }
}

impl Drop for SharedStorage {
    fn drop(&mut self) {
        if let Ok(mut hub) = self.hub.try_borrow_mut() {
            hub.sessions.remove(&self.session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::Record;
    use crate::storage::MemoryStorage;

    fn encoded(oid: u64, state: &[u8]) -> Vec<u8> {
        Record::new(Oid::new(oid), state.to_vec(), Vec::new())
            .encode()
            .unwrap()
    }

    fn commit(storage: &mut SharedStorage, oid: u64, state: &[u8]) -> CoreResult<()> {
        storage.begin()?;
        storage.store(Oid::new(oid), encoded(oid, state))?;
        storage.end()
    }

    #[test]
    fn sessions_share_committed_data_after_sync() {
        let mut a = SharedStorage::new(MemoryStorage::new());
        let mut b = a.new_session();

        commit(&mut a, 1, b"from a").unwrap();
        assert_eq!(b.sync().unwrap(), vec![Oid::new(1)]);
        assert_eq!(b.load(Oid::new(1)).unwrap(), encoded(1, b"from a"));
    }

    #[test]
    fn loading_an_invalidated_oid_is_a_read_conflict() {
        let mut a = SharedStorage::new(MemoryStorage::new());
        let mut b = a.new_session();

        commit(&mut a, 1, b"v1").unwrap();
        let err = b.load(Oid::new(1)).unwrap_err();
        assert!(matches!(err, CoreError::ReadConflict { .. }));

        b.sync().unwrap();
        assert!(b.load(Oid::new(1)).is_ok());
    }

    #[test]
    fn commit_with_unseen_invalidations_is_a_write_conflict() {
        let mut a = SharedStorage::new(MemoryStorage::new());
        let mut b = a.new_session();

        commit(&mut a, 1, b"first").unwrap();
        let err = commit(&mut b, 2, b"second").unwrap_err();
        match err {
            CoreError::WriteConflict { oids } => assert_eq!(oids, vec![Oid::new(1)]),
            other => panic!("expected write conflict, got {other:?}"),
        }

        // The conflicted transaction must not have been applied.
        b.sync().unwrap();
        assert!(b.load(Oid::new(2)).is_err());

        // After a sync, the retry goes through.
        commit(&mut b, 2, b"second").unwrap();
        assert!(b.load(Oid::new(2)).is_ok());
    }

    #[test]
    fn own_writes_are_not_self_invalidating() {
        let mut a = SharedStorage::new(MemoryStorage::new());
        let _b = a.new_session();
        commit(&mut a, 1, b"x").unwrap();
        assert!(a.sync().unwrap().is_empty());
        assert!(a.load(Oid::new(1)).is_ok());
    }

    #[test]
    fn invalidations_accumulate_across_commits() {
        let mut a = SharedStorage::new(MemoryStorage::new());
        let mut b = a.new_session();

        commit(&mut a, 1, b"x").unwrap();
        commit(&mut a, 2, b"y").unwrap();
        assert_eq!(b.pending_invalidations(), vec![Oid::new(1), Oid::new(2)]);
        assert_eq!(b.sync().unwrap(), vec![Oid::new(1), Oid::new(2)]);
        assert!(b.sync().unwrap().is_empty());
    }

    #[test]
    fn dropped_sessions_stop_receiving_invalidations() {
        let mut a = SharedStorage::new(MemoryStorage::new());
        let b = a.new_session();
        drop(b);
        commit(&mut a, 1, b"x").unwrap();
        assert!(a.sync().unwrap().is_empty());
    }

    #[test]
    fn oid_allocation_is_global_across_sessions() {
        let mut a = SharedStorage::new(MemoryStorage::new());
        let mut b = a.new_session();
        let first = a.new_oid().unwrap();
        let second = b.new_oid().unwrap();
        assert!(second > first);
    }

    #[test]
    fn reserved_oid_never_reaches_the_hub() {
        let mut a = SharedStorage::new(MemoryStorage::new());
        a.begin().unwrap();
        assert!(matches!(
            a.store(Oid::new(u64::MAX), encoded(u64::MAX, b"evil")),
            Err(CoreError::InvalidOperation { .. })
        ));
        // The transaction itself is still viable.
        a.store(Oid::new(1), encoded(1, b"fine")).unwrap();
        a.end().unwrap();
        assert_eq!(a.load(Oid::new(1)).unwrap(), encoded(1, b"fine"));
    }
}
