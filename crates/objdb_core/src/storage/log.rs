//! Append-only transaction log shared by the file-backed stores.
//!
//! Layout:
//!
//! ```text
//! | magic "ODBF" (4) | format version (4) |
//! | block | block | ...
//! ```
//!
//! A block is one committed transaction: a run of entries followed by a
//! commit marker.
//!
//! ```text
//! entry:  | oid (8) | length (4) | encoded record (length) |
//! marker: | 0xFFFF_FFFF_FFFF_FFFF (8) | crc32 (4) |
//! ```
//!
//! All integers are big-endian. The marker's checksum covers every
//! entry byte of its block, so a block is committed exactly when its
//! marker is fully on disk and consistent.
//!
//! Recovery distinguishes two kinds of damage:
//!
//! - a block that runs past end-of-file, or a missing marker, is a
//!   crash mid-write: the partial tail is discarded with a warning
//! - a bad magic, unsupported version, checksum mismatch, or an entry
//!   whose OID disagrees with its record inside a checksummed block is
//!   real corruption: the store refuses to open

use crate::error::{CoreError, CoreResult};
use crate::serial::Record;
use crate::types::Oid;
use objdb_storage::{StorageBackend, StorageError, StorageResult};
use std::collections::HashMap;
use std::path::Path;

/// Magic bytes at the start of every log file.
pub(crate) const LOG_MAGIC: [u8; 4] = *b"ODBF";

/// Current log format version.
pub(crate) const LOG_VERSION: u32 = 1;

/// Bytes of file header: magic plus version.
pub(crate) const LOG_HEADER_LEN: usize = 8;

/// Entry header: oid plus length.
const ENTRY_HEADER_LEN: usize = 12;

/// OID value that marks the end of a block. Never allocated.
pub(crate) const SENTINEL_OID: u64 = u64::MAX;

/// Computes the IEEE CRC32 of `data`.
pub(crate) fn crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

/// Result of walking a log from start to end.
pub(crate) struct LogScan {
    /// Per-block entry lists in commit order: `(oid, entry offset)`.
    pub(crate) blocks: Vec<Vec<(Oid, u64)>>,
    /// Offset of a partial block at the tail, if the log ends
    /// mid-write.
    pub(crate) partial_tail: Option<u64>,
}

/// A transaction log over an arbitrary byte backend.
pub(crate) struct RecordLog {
    backend: Box<dyn StorageBackend>,
}

impl RecordLog {
    /// Opens a log, writing the header into an empty backend and
    /// validating it otherwise.
    pub(crate) fn open(mut backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let size = backend.size()?;
        if size == 0 {
            let mut header = Vec::with_capacity(LOG_HEADER_LEN);
            header.extend_from_slice(&LOG_MAGIC);
            header.extend_from_slice(&LOG_VERSION.to_be_bytes());
            backend.append(&header)?;
            backend.flush()?;
            backend.sync()?;
            return Ok(Self { backend });
        }
        if size < LOG_HEADER_LEN as u64 {
            return Err(CoreError::corrupt("log shorter than its header"));
        }
        let header = backend.read_at(0, LOG_HEADER_LEN)?;
        if header[..4] != LOG_MAGIC {
            return Err(CoreError::corrupt("bad magic bytes, not a database file"));
        }
        let mut version_bytes = [0u8; 4];
        version_bytes.copy_from_slice(&header[4..8]);
        let version = u32::from_be_bytes(version_bytes);
        if version != LOG_VERSION {
            return Err(CoreError::corrupt(format!(
                "unsupported log format version {version}"
            )));
        }
        Ok(Self { backend })
    }

    /// Walks every block, verifying commit markers.
    ///
    /// Entry OIDs are only checked against their record payloads inside
    /// blocks whose checksum verified; a torn tail therefore never
    /// reads as corruption.
    pub(crate) fn scan(&self) -> CoreResult<LogScan> {
        let size = self.backend.size()?;
        let body_len = (size - LOG_HEADER_LEN as u64) as usize;
        let body = self.backend.read_at(LOG_HEADER_LEN as u64, body_len)?;

        let abs = |rel: usize| (LOG_HEADER_LEN + rel) as u64;
        let mut blocks = Vec::new();
        let mut partial_tail = None;
        let mut pos = 0usize;

        'blocks: while pos < body.len() {
            let block_start = pos;
            let mut staged: Vec<(u64, usize, usize)> = Vec::new();
            loop {
                if pos + 8 > body.len() {
                    partial_tail = Some(abs(block_start));
                    break 'blocks;
                }
                let mut oid_bytes = [0u8; 8];
                oid_bytes.copy_from_slice(&body[pos..pos + 8]);
                let oid_val = u64::from_be_bytes(oid_bytes);

                if oid_val == SENTINEL_OID {
                    if pos + 12 > body.len() {
                        partial_tail = Some(abs(block_start));
                        break 'blocks;
                    }
                    let mut crc_bytes = [0u8; 4];
                    crc_bytes.copy_from_slice(&body[pos + 8..pos + 12]);
                    let stored = u32::from_be_bytes(crc_bytes);
                    let computed = crc32(&body[block_start..pos]);
                    if stored != computed {
                        return Err(CoreError::corrupt(format!(
                            "commit marker checksum mismatch at offset {}",
                            abs(pos)
                        )));
                    }
                    // The block is committed; now hold its entries to
                    // the format.
                    let mut entries = Vec::with_capacity(staged.len());
                    for &(oid_val, entry_rel, len) in &staged {
                        let payload = &body[entry_rel + ENTRY_HEADER_LEN
                            ..entry_rel + ENTRY_HEADER_LEN + len];
                        let record_oid = Record::peek_oid(payload)?;
                        if record_oid.as_u64() != oid_val {
                            return Err(CoreError::corrupt(format!(
                                "log entry for {} holds a record for {} at offset {}",
                                Oid::new(oid_val),
                                record_oid,
                                abs(entry_rel)
                            )));
                        }
                        entries.push((Oid::new(oid_val), abs(entry_rel)));
                    }
                    blocks.push(entries);
                    pos += 12;
                    continue 'blocks;
                }

                if pos + ENTRY_HEADER_LEN > body.len() {
                    partial_tail = Some(abs(block_start));
                    break 'blocks;
                }
                let mut len_bytes = [0u8; 4];
                len_bytes.copy_from_slice(&body[pos + 8..pos + 12]);
                let len = u32::from_be_bytes(len_bytes) as usize;
                if pos + ENTRY_HEADER_LEN + len > body.len() {
                    partial_tail = Some(abs(block_start));
                    break 'blocks;
                }
                staged.push((oid_val, pos, len));
                pos += ENTRY_HEADER_LEN + len;
            }
        }

        Ok(LogScan {
            blocks,
            partial_tail,
        })
    }

    /// Scans the log, discards a partial tail if present, and returns
    /// the OID index with each OID mapped to its latest entry offset.
    pub(crate) fn recover(&mut self) -> CoreResult<HashMap<Oid, u64>> {
        let scan = self.scan()?;
        if let Some(at) = scan.partial_tail {
            let size = self.backend.size()?;
            tracing::warn!(
                offset = at,
                discarded = size - at,
                "discarding partial transaction at end of log"
            );
            self.backend.truncate(at)?;
            self.backend.sync()?;
        }
        let mut index = HashMap::new();
        for block in &scan.blocks {
            for &(oid, offset) in block {
                index.insert(oid, offset);
            }
        }
        Ok(index)
    }

    /// Reads the record payload of the entry at `offset`.
    pub(crate) fn read_entry(&self, offset: u64) -> CoreResult<(Oid, Vec<u8>)> {
        let header = self.backend.read_at(offset, ENTRY_HEADER_LEN)?;
        let mut oid_bytes = [0u8; 8];
        oid_bytes.copy_from_slice(&header[..8]);
        let oid_val = u64::from_be_bytes(oid_bytes);
        if oid_val == SENTINEL_OID {
            return Err(CoreError::corrupt(format!(
                "entry offset {offset} points at a commit marker"
            )));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&header[8..12]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        let payload = self.backend.read_at(offset + ENTRY_HEADER_LEN as u64, len)?;
        let record_oid = Record::peek_oid(&payload)?;
        if record_oid.as_u64() != oid_val {
            return Err(CoreError::corrupt(format!(
                "log entry for {} holds a record for {record_oid}",
                Oid::new(oid_val)
            )));
        }
        Ok((Oid::new(oid_val), payload))
    }

    /// Appends one transaction block and makes it durable.
    ///
    /// Returns the entry offset for each record, in input order.
    pub(crate) fn append_block(
        &mut self,
        records: &[(Oid, Vec<u8>)],
    ) -> CoreResult<Vec<(Oid, u64)>> {
        let mut buf = Vec::new();
        let mut rel_offsets = Vec::with_capacity(records.len());
        for (oid, payload) in records {
            // The scan would read such an entry back as a block marker.
            if oid.as_u64() == SENTINEL_OID {
                return Err(CoreError::invalid_operation(
                    "oid u64::MAX is reserved for the block marker",
                ));
            }
            let len = u32::try_from(payload.len()).map_err(|_| {
                CoreError::invalid_operation(format!("record for {oid} too large for log entry"))
            })?;
            rel_offsets.push((*oid, buf.len()));
            buf.extend_from_slice(&oid.as_u64().to_be_bytes());
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(payload);
        }
        let crc = crc32(&buf);
        buf.extend_from_slice(&SENTINEL_OID.to_be_bytes());
        buf.extend_from_slice(&crc.to_be_bytes());

        let start = self.backend.append(&buf)?;
        self.backend.flush()?;
        self.backend.sync()?;
        Ok(rel_offsets
            .into_iter()
            .map(|(oid, rel)| (oid, start + rel as u64))
            .collect())
    }

    /// Total log size in bytes, header included.
    pub(crate) fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }

    /// Reads the whole log, header included.
    pub(crate) fn raw_bytes(&self) -> CoreResult<Vec<u8>> {
        let size = self.backend.size()?;
        Ok(self.backend.read_at(0, size as usize)?)
    }

    /// Overwrites the whole log with `bytes` and makes it durable.
    /// Used to swap in a packed copy when the backend has no file to
    /// rename.
    pub(crate) fn replace_contents(&mut self, bytes: &[u8]) -> CoreResult<()> {
        self.backend.truncate(0)?;
        self.backend.append(bytes)?;
        self.backend.flush()?;
        self.backend.sync()?;
        Ok(())
    }

    /// Swaps this log's file for an already-durable packed file.
    ///
    /// Closes the current backend to release its lock, renames `packed`
    /// over `main`, makes the rename durable, and reopens the file with
    /// the exclusive lock retaken.
    ///
    /// A failed rename leaves `main` untouched, so the original file is
    /// reopened and the rename error returned. If a reopen fails the
    /// poison placeholder stays behind and every later log access
    /// errors rather than acting on a store that is no longer the file.
    pub(crate) fn replace_with_file(&mut self, packed: &Path, main: &Path) -> CoreResult<()> {
        use objdb_storage::FileBackend;

        // The lock has to be released before the rename on platforms
        // that refuse to replace an open file.
        let old = std::mem::replace(&mut self.backend, Box::new(PoisonedBackend));
        drop(old);
        if let Err(err) = std::fs::rename(packed, main) {
            self.backend = Box::new(FileBackend::open_locked(main)?);
            return Err(err.into());
        }
        if let Err(err) = sync_parent_dir(main) {
            tracing::warn!(error = %err, "directory sync after pack swap failed");
        }
        self.backend = Box::new(FileBackend::open_locked(main)?);
        Ok(())
    }

    /// Releases the underlying backend.
    pub(crate) fn into_backend(self) -> Box<dyn StorageBackend> {
        self.backend
    }
}

/// Placeholder held while the log file is being swapped. If the swap
/// dies midway the placeholder stays installed, and every later access
/// fails instead of quietly acting on an empty store.
struct PoisonedBackend;

fn poisoned() -> StorageError {
    StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "log file swap did not complete",
    ))
}

impl StorageBackend for PoisonedBackend {
    fn read_at(&self, _offset: u64, _len: usize) -> StorageResult<Vec<u8>> {
        Err(poisoned())
    }

    fn append(&mut self, _data: &[u8]) -> StorageResult<u64> {
        Err(poisoned())
    }

    fn flush(&mut self) -> StorageResult<()> {
        Err(poisoned())
    }

    fn size(&self) -> StorageResult<u64> {
        Err(poisoned())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Err(poisoned())
    }

    fn truncate(&mut self, _new_size: u64) -> StorageResult<()> {
        Err(poisoned())
    }
}

/// Flushes the directory entry for `path` so a rename survives a crash.
fn sync_parent_dir(path: &Path) -> CoreResult<()> {
    #[cfg(unix)]
    {
        let dir = path.parent().filter(|d| !d.as_os_str().is_empty());
        if let Some(dir) = dir {
            std::fs::File::open(dir)?.sync_all()?;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use objdb_storage::InMemoryBackend;

    fn payload(oid: u64, fill: u8) -> Vec<u8> {
        Record::new(Oid::new(oid), vec![fill; 5], Vec::new())
            .encode()
            .unwrap()
    }

    fn fresh_log() -> RecordLog {
        RecordLog::open(Box::new(InMemoryBackend::new())).unwrap()
    }

    #[test]
    fn crc32_known_value() {
        // Known test vector: "123456789" should give 0xCBF43926
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn crc32_empty() {
        assert_eq!(crc32(b""), 0x0000_0000);
    }

    #[test]
    fn open_writes_and_validates_header() {
        let log = fresh_log();
        let bytes = log.raw_bytes().unwrap();
        assert_eq!(bytes.len(), LOG_HEADER_LEN);
        assert_eq!(&bytes[..4], b"ODBF");

        // Reopening the same bytes succeeds.
        let mut reopened = RecordLog::open(Box::new(InMemoryBackend::with_data(bytes))).unwrap();
        assert!(reopened.recover().is_ok());
    }

    #[test]
    fn bad_magic_is_fatal() {
        let backend = InMemoryBackend::with_data(b"NOPE\x00\x00\x00\x01rest".to_vec());
        assert!(matches!(
            RecordLog::open(Box::new(backend)),
            Err(CoreError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn unsupported_version_is_fatal() {
        let mut data = LOG_MAGIC.to_vec();
        data.extend_from_slice(&99u32.to_be_bytes());
        assert!(matches!(
            RecordLog::open(Box::new(InMemoryBackend::with_data(data))),
            Err(CoreError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn append_then_recover_and_read() {
        let mut log = fresh_log();
        let offsets = log
            .append_block(&[(Oid::new(1), payload(1, 0xAA)), (Oid::new(2), payload(2, 0xBB))])
            .unwrap();
        assert_eq!(offsets.len(), 2);

        let index = log.recover().unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index[&Oid::new(1)], offsets[0].1);

        let (oid, bytes) = log.read_entry(index[&Oid::new(2)]).unwrap();
        assert_eq!(oid, Oid::new(2));
        assert_eq!(bytes, payload(2, 0xBB));
    }

    #[test]
    fn later_blocks_win_in_the_index() {
        let mut log = fresh_log();
        log.append_block(&[(Oid::new(1), payload(1, 0x01))]).unwrap();
        let second = log.append_block(&[(Oid::new(1), payload(1, 0x02))]).unwrap();

        let index = log.recover().unwrap();
        assert_eq!(index[&Oid::new(1)], second[0].1);
        let (_, bytes) = log.read_entry(index[&Oid::new(1)]).unwrap();
        assert_eq!(bytes, payload(1, 0x02));
    }

    #[test]
    fn scan_reports_blocks_in_commit_order() {
        let mut log = fresh_log();
        log.append_block(&[(Oid::new(1), payload(1, 1)), (Oid::new(2), payload(2, 2))])
            .unwrap();
        log.append_block(&[(Oid::new(3), payload(3, 3))]).unwrap();

        let scan = log.scan().unwrap();
        assert!(scan.partial_tail.is_none());
        assert_eq!(scan.blocks.len(), 2);
        let oids: Vec<Vec<u64>> = scan
            .blocks
            .iter()
            .map(|b| b.iter().map(|(o, _)| o.as_u64()).collect())
            .collect();
        assert_eq!(oids, vec![vec![1, 2], vec![3]]);
    }

    #[test]
    fn partial_tail_is_truncated_with_committed_data_kept() {
        let mut log = fresh_log();
        log.append_block(&[(Oid::new(1), payload(1, 0xAA))]).unwrap();
        let committed = log.raw_bytes().unwrap();

        // A torn write: a second block's first entry, cut mid-payload.
        let mut torn = committed.clone();
        torn.extend_from_slice(&2u64.to_be_bytes());
        torn.extend_from_slice(&100u32.to_be_bytes());
        torn.extend_from_slice(&[0xCC; 17]);

        let mut log = RecordLog::open(Box::new(InMemoryBackend::with_data(torn))).unwrap();
        let index = log.recover().unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.contains_key(&Oid::new(1)));
        assert_eq!(log.size().unwrap(), committed.len() as u64);
    }

    #[test]
    fn missing_marker_is_treated_as_partial() {
        let mut log = fresh_log();
        log.append_block(&[(Oid::new(1), payload(1, 0xAA))]).unwrap();
        let committed_len = log.size().unwrap();

        // A whole entry, but no commit marker after it.
        let mut bytes = log.raw_bytes().unwrap();
        let p = payload(2, 0xBB);
        bytes.extend_from_slice(&2u64.to_be_bytes());
        bytes.extend_from_slice(&(p.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&p);

        let mut log = RecordLog::open(Box::new(InMemoryBackend::with_data(bytes))).unwrap();
        let index = log.recover().unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(log.size().unwrap(), committed_len);
    }

    #[test]
    fn checksum_mismatch_is_fatal() {
        let mut log = fresh_log();
        log.append_block(&[(Oid::new(1), payload(1, 0xAA))]).unwrap();
        let mut bytes = log.raw_bytes().unwrap();

        // Flip one bit in the payload; the marker checksum no longer
        // matches.
        let mid = LOG_HEADER_LEN + 14;
        bytes[mid] ^= 0x01;

        let log = RecordLog::open(Box::new(InMemoryBackend::with_data(bytes))).unwrap();
        assert!(matches!(log.scan(), Err(CoreError::CorruptRecord { .. })));
    }

    #[test]
    fn entry_and_record_oid_disagreement_is_fatal() {
        let mut log = fresh_log();
        // Entry claims OID 5 but carries a record encoded for OID 6.
        log.append_block(&[(Oid::new(5), payload(6, 0xAA))]).unwrap();
        assert!(matches!(log.scan(), Err(CoreError::CorruptRecord { .. })));
    }

    #[test]
    fn empty_block_round_trips() {
        let mut log = fresh_log();
        log.append_block(&[]).unwrap();
        let scan = log.scan().unwrap();
        assert_eq!(scan.blocks.len(), 1);
        assert!(scan.blocks[0].is_empty());
        assert!(scan.partial_tail.is_none());
    }

    #[test]
    fn replace_contents_swaps_the_log() {
        let mut first = fresh_log();
        first.append_block(&[(Oid::new(1), payload(1, 0x11))]).unwrap();

        let mut second = fresh_log();
        second
            .append_block(&[(Oid::new(9), payload(9, 0x99))])
            .unwrap();
        let packed = second.raw_bytes().unwrap();

        first.replace_contents(&packed).unwrap();
        let index = first.recover().unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.contains_key(&Oid::new(9)));
    }

    #[test]
    fn reserved_marker_oid_is_refused() {
        let mut log = fresh_log();
        let before = log.size().unwrap();
        assert!(matches!(
            log.append_block(&[(Oid::new(SENTINEL_OID), payload(SENTINEL_OID, 0xEE))]),
            Err(CoreError::InvalidOperation { .. })
        ));
        // Nothing reached the log, and ordinary blocks still land.
        assert_eq!(log.size().unwrap(), before);
        log.append_block(&[(Oid::new(3), payload(3, 0x33))]).unwrap();
        assert_eq!(log.scan().unwrap().blocks.len(), 1);
    }

    #[test]
    fn failed_file_swap_keeps_the_log_alive() {
        use objdb_storage::FileBackend;
        use tempfile::tempdir;

        let dir = tempdir().unwrap();
        let main = dir.path().join("db.odb");
        let backend = FileBackend::open_locked(&main).unwrap();
        let mut log = RecordLog::open(Box::new(backend)).unwrap();
        log.append_block(&[(Oid::new(1), payload(1, 0x11))]).unwrap();

        // The packed file never existed, so the rename cannot land.
        let missing = dir.path().join("missing.pack");
        assert!(log.replace_with_file(&missing, &main).is_err());

        // The original file was reopened: reads and writes still work.
        let index = log.recover().unwrap();
        assert!(index.contains_key(&Oid::new(1)));
        log.append_block(&[(Oid::new(2), payload(2, 0x22))]).unwrap();
        assert_eq!(log.scan().unwrap().blocks.len(), 2);
    }
}
