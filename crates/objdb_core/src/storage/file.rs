//! Durable storage over an append-only log file.
//!
//! One process owns the file exclusively; a second open fails with a
//! lock error. The OID index is rebuilt by scanning the log on open,
//! and the highest OID seen becomes the allocation high-water mark.
//!
//! Packing copies records reachable from the root into a sibling
//! `.pack` file, one bounded batch per [`FileStorage::pack_step`] call,
//! then atomically renames it over the live file. Transactions
//! committed while a pack runs are mirrored into the pack file too, so
//! nothing written during the pack is lost.

use crate::error::{CoreError, CoreResult};
use crate::serial::Record;
use crate::storage::log::{RecordLog, SENTINEL_OID};
use crate::storage::Storage;
use crate::types::Oid;
use objdb_storage::{FileBackend, InMemoryBackend};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

/// OIDs copied per pack step. Small enough that a server can interleave
/// client requests between steps.
const PACK_STEP_OIDS: usize = 16;

struct PackJob {
    sink: RecordLog,
    sink_path: Option<PathBuf>,
    queue: VecDeque<Oid>,
    marked: HashSet<Oid>,
    new_index: HashMap<Oid, u64>,
}

/// Append-only file storage with stop-the-world-free packing.
pub struct FileStorage {
    log: RecordLog,
    path: Option<PathBuf>,
    index: HashMap<Oid, u64>,
    next_oid: u64,
    pending: Vec<(Oid, Vec<u8>)>,
    in_txn: bool,
    pack: Option<PackJob>,
}

impl FileStorage {
    /// Opens or creates the database file at `path`, taking an
    /// exclusive lock and replaying the log.
    ///
    /// # Errors
    ///
    /// Fails if another process holds the file, on I/O errors, or with
    /// [`CoreError::CorruptRecord`] if the log fails validation.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let backend = Box::new(FileBackend::open_locked(&path)?);
        let mut log = RecordLog::open(backend)?;
        let index = log.recover()?;
        let next_oid = Self::high_water(&index);
        tracing::debug!(path = %path.display(), records = index.len(), "storage opened");
        Ok(Self {
            log,
            path: Some(path),
            index,
            next_oid,
            pending: Vec::new(),
            in_txn: false,
            pack: None,
        })
    }

    /// Creates a storage with the file format but no file, useful for
    /// tests and scratch databases.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches [`Self::open`].
    pub fn in_memory() -> CoreResult<Self> {
        let log = RecordLog::open(Box::new(InMemoryBackend::new()))?;
        Ok(Self {
            log,
            path: None,
            index: HashMap::new(),
            next_oid: 1,
            pending: Vec::new(),
            in_txn: false,
            pack: None,
        })
    }

    fn high_water(index: &HashMap<Oid, u64>) -> u64 {
        index
            .keys()
            .map(|oid| oid.as_u64())
            .max()
            .map_or(1, |max| max.saturating_add(1).max(1))
    }

    /// The backing file, or None for an in-memory instance.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of current records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.index.len()
    }

    /// True while an incremental pack is in progress.
    #[must_use]
    pub fn is_packing(&self) -> bool {
        self.pack.is_some()
    }

    /// Begins an incremental pack. A no-op if one is already running.
    ///
    /// # Errors
    ///
    /// Fails inside an open transaction or on I/O errors creating the
    /// pack file.
    pub fn start_pack(&mut self) -> CoreResult<()> {
        if self.pack.is_some() {
            return Ok(());
        }
        if self.in_txn {
            return Err(CoreError::invalid_operation(
                "cannot pack inside an open transaction",
            ));
        }
        let (sink, sink_path) = match &self.path {
            Some(path) => {
                let pack_path = pack_path_for(path);
                if pack_path.exists() {
                    // Leftover from an interrupted pack; start over.
                    std::fs::remove_file(&pack_path)?;
                }
                let backend = Box::new(FileBackend::open(&pack_path)?);
                (RecordLog::open(backend)?, Some(pack_path))
            }
            None => (RecordLog::open(Box::new(InMemoryBackend::new()))?, None),
        };
        let mut queue = VecDeque::new();
        let mut marked = HashSet::new();
        if self.index.contains_key(&Oid::ROOT) {
            queue.push_back(Oid::ROOT);
            marked.insert(Oid::ROOT);
        }
        tracing::debug!(records = self.index.len(), "pack started");
        self.pack = Some(PackJob {
            sink,
            sink_path,
            queue,
            marked,
            new_index: HashMap::new(),
        });
        Ok(())
    }

    /// Copies one bounded batch of reachable records into the pack
    /// file. Returns true once the pack has finished (or none was
    /// running).
    ///
    /// # Errors
    ///
    /// I/O and corruption errors; on error the pack job is dropped and
    /// the live file is untouched.
    pub fn pack_step(&mut self) -> CoreResult<bool> {
        if self.pack.is_none() {
            return Ok(true);
        }
        match self.pack_step_inner() {
            Ok(done) => Ok(done),
            Err(e) => {
                self.abandon_pack();
                Err(e)
            }
        }
    }

    fn pack_step_inner(&mut self) -> CoreResult<bool> {
        let Some(job) = self.pack.as_mut() else {
            return Ok(true);
        };
        let mut batch: Vec<(Oid, Vec<u8>)> = Vec::new();
        for _ in 0..PACK_STEP_OIDS {
            let Some(oid) = job.queue.pop_front() else {
                break;
            };
            let Some(&offset) = self.index.get(&oid) else {
                tracing::warn!(%oid, "skipping dangling reference while packing");
                continue;
            };
            let (_, payload) = self.log.read_entry(offset)?;
            for referenced in Record::refs_of(&payload)? {
                if job.marked.insert(referenced) {
                    job.queue.push_back(referenced);
                }
            }
            batch.push((oid, payload));
        }
        if !batch.is_empty() {
            for (oid, offset) in job.sink.append_block(&batch)? {
                job.new_index.insert(oid, offset);
            }
        }
        if job.queue.is_empty() {
            self.finish_pack()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn finish_pack(&mut self) -> CoreResult<()> {
        let Some(job) = self.pack.take() else {
            return Ok(());
        };
        let PackJob {
            sink,
            sink_path,
            new_index,
            ..
        } = job;
        if let Some(pack_path) = sink_path {
            let main = self
                .path
                .clone()
                .ok_or_else(|| CoreError::invalid_operation("pack file without a main path"))?;
            drop(sink.into_backend());
            self.log.replace_with_file(&pack_path, &main)?;
        } else {
            let packed = sink.raw_bytes()?;
            self.log.replace_contents(&packed)?;
        }
        let dropped = self.index.len().saturating_sub(new_index.len());
        self.index = new_index;
        let bytes = self.log.size()?;
        tracing::debug!(kept = self.index.len(), dropped, bytes, "pack finished");
        Ok(())
    }

    fn abandon_pack(&mut self) {
        if let Some(job) = self.pack.take() {
            let sink_path = job.sink_path.clone();
            drop(job);
            if let Some(path) = sink_path {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

fn pack_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".pack");
    PathBuf::from(name)
}

impl Storage for FileStorage {
    fn new_oid(&mut self) -> CoreResult<Oid> {
        let oid = Oid::new(self.next_oid);
        self.next_oid = self.next_oid.saturating_add(1);
        Ok(oid)
    }

    fn load(&mut self, oid: Oid) -> CoreResult<Vec<u8>> {
        match self.index.get(&oid) {
            Some(&offset) => {
                let (_, payload) = self.log.read_entry(offset)?;
                Ok(payload)
            }
            None => Err(CoreError::not_found(oid)),
        }
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
        if self.pending.is_empty() {
            return Ok(());
        }
        let records = std::mem::take(&mut self.pending);
        for (oid, offset) in self.log.append_block(&records)? {
            self.index.insert(oid, offset);
        }
        for (oid, _) in &records {
            if oid.as_u64() >= self.next_oid {
                self.next_oid = oid.as_u64().saturating_add(1);
            }
        }
        // A pack in flight gets the same block, so the swap cannot lose
        // this transaction.
        if let Some(job) = self.pack.as_mut() {
            for (oid, offset) in job.sink.append_block(&records)? {
                job.new_index.insert(oid, offset);
            }
            for (oid, payload) in &records {
                job.marked.insert(*oid);
                for referenced in Record::refs_of(payload)? {
                    if job.marked.insert(referenced) {
                        job.queue.push_back(referenced);
                    }
                }
            }
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
        let mut entries: Vec<(Oid, u64)> = self.index.iter().map(|(o, off)| (*o, *off)).collect();
        entries.sort_unstable_by_key(|(oid, _)| *oid);
        for (oid, offset) in entries {
            let (_, payload) = self.log.read_entry(offset)?;
            f(oid, &payload)?;
        }
        Ok(())
    }

    fn pack(&mut self) -> CoreResult<()> {
        self.start_pack()?;
        while !self.pack_step()? {}
        Ok(())
    }
}
