//! Heap-only storage for tests and throwaway databases.

use crate::error::{CoreError, CoreResult};
use crate::serial::Record;
use crate::storage::log::SENTINEL_OID;
use crate::storage::Storage;
use crate::types::Oid;
use std::collections::{HashMap, HashSet, VecDeque};

/// A [`Storage`] that keeps every record in a map. Nothing survives
/// drop; transactions still apply atomically so engine behavior matches
/// the durable stores.
pub struct MemoryStorage {
    records: HashMap<Oid, Vec<u8>>,
    next_oid: u64,
    pending: Vec<(Oid, Vec<u8>)>,
    in_txn: bool,
}

impl MemoryStorage {
    /// Creates an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            next_oid: 1,
            pending: Vec::new(),
            in_txn: false,
        }
    }

    /// Number of current records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn new_oid(&mut self) -> CoreResult<Oid> {
        let oid = Oid::new(self.next_oid);
        self.next_oid = self.next_oid.saturating_add(1);
        Ok(oid)
    }

    fn load(&mut self, oid: Oid) -> CoreResult<Vec<u8>> {
        self.records
            .get(&oid)
            .cloned()
            .ok_or_else(|| CoreError::not_found(oid))
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
        let record_oid = Record::peek_oid(&record)?;
        if record_oid != oid {
            return Err(CoreError::invalid_operation(format!(
                "record encoded for {record_oid} stored under {oid}"
            )));
        }
        self.pending.push((oid, record));
        Ok(())
    }

    fn end(&mut self) -> CoreResult<()> {
        if !self.in_txn {
            return Err(CoreError::invalid_operation("end without begin"));
        }
        self.in_txn = false;
        for (oid, record) in self.pending.drain(..) {
            if oid.as_u64() >= self.next_oid {
                self.next_oid = oid.as_u64().saturating_add(1);
            }
            self.records.insert(oid, record);
        }
        Ok(())
    }

    fn sync(&mut self) -> CoreResult<Vec<Oid>> {
        Ok(Vec::new())
    }

    fn each_record(
        &mut self,
        f: &mut dyn FnMut(Oid, &[u8]) -> CoreResult<()>,
    ) -> CoreResult<()> {
        let mut oids: Vec<Oid> = self.records.keys().copied().collect();
        oids.sort_unstable();
        for oid in oids {
            if let Some(record) = self.records.get(&oid) {
                f(oid, record)?;
            }
        }
        Ok(())
    }

    fn pack(&mut self) -> CoreResult<()> {
        if !self.records.contains_key(&Oid::ROOT) {
            self.records.clear();
            return Ok(());
        }
        let mut marked = HashSet::from([Oid::ROOT]);
        let mut queue = VecDeque::from([Oid::ROOT]);
        while let Some(oid) = queue.pop_front() {
            let Some(bytes) = self.records.get(&oid) else {
                continue;
            };
            for referenced in Record::refs_of(bytes)? {
                if marked.insert(referenced) {
                    queue.push_back(referenced);
                }
            }
        }
        self.records.retain(|oid, _| marked.contains(oid));
        Ok(())
    }
}
