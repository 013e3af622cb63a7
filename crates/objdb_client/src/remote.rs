//! Remote storage over a blocking socket.

use objdb_core::{CoreError, CoreResult, Oid, Storage};
use objdb_proto::{
    decode_oids, encode_commit_blob, Opcode, Status, MAX_COMMIT_BLOB_LEN, MAX_OID_BATCH,
    MAX_RECORD_LEN, PROTOCOL_VERSION,
};
use std::collections::VecDeque;
use std::io::{BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Number of OIDs fetched per allocation round trip.
pub const OID_BATCH_SIZE: u32 = 32;

enum Wire {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Wire {
    fn try_clone(&self) -> std::io::Result<Self> {
        match self {
            Wire::Tcp(stream) => Ok(Wire::Tcp(stream.try_clone()?)),
            #[cfg(unix)]
            Wire::Unix(stream) => Ok(Wire::Unix(stream.try_clone()?)),
        }
    }

    fn set_io_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self {
            Wire::Tcp(stream) => {
                stream.set_read_timeout(timeout)?;
                stream.set_write_timeout(timeout)
            }
            #[cfg(unix)]
            Wire::Unix(stream) => {
                stream.set_read_timeout(timeout)?;
                stream.set_write_timeout(timeout)
            }
        }
    }
}

impl Read for Wire {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Wire::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Wire::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Wire {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Wire::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Wire::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Wire::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Wire::Unix(stream) => stream.flush(),
        }
    }
}

/// Storage backed by a remote server; one socket per logical
/// connection.
pub struct RemoteStorage {
    reader: BufReader<Wire>,
    writer: Wire,
    oid_pool: VecDeque<u64>,
    pending: Vec<(u64, Vec<u8>)>,
    in_txn: bool,
}

impl RemoteStorage {
    /// Connects over TCP and performs the version handshake.
    ///
    /// # Errors
    ///
    /// Connection failures, or a server speaking another protocol
    /// version.
    pub fn connect(addr: impl ToSocketAddrs) -> CoreResult<Self> {
        let stream = TcpStream::connect(addr)?;
        // One small request per exchange; coalescing only adds latency.
        stream.set_nodelay(true)?;
        Self::handshake(Wire::Tcp(stream))
    }

    /// Connects over a Unix-domain socket and performs the version
    /// handshake.
    ///
    /// # Errors
    ///
    /// Same as [`Self::connect`].
    #[cfg(unix)]
    pub fn connect_unix(path: impl AsRef<std::path::Path>) -> CoreResult<Self> {
        let stream = UnixStream::connect(path.as_ref())?;
        Self::handshake(Wire::Unix(stream))
    }

    fn handshake(wire: Wire) -> CoreResult<Self> {
        let writer = wire.try_clone()?;
        let mut client = Self {
            reader: BufReader::new(wire),
            writer,
            oid_pool: VecDeque::new(),
            pending: Vec::new(),
            in_txn: false,
        };
        client.writer.write_all(&PROTOCOL_VERSION)?;
        client.writer.flush()?;
        match client.read_status()? {
            Status::Ok => {
                tracing::debug!("connected to storage server");
                Ok(client)
            }
            _ => Err(CoreError::protocol("server rejected protocol version")),
        }
    }

    /// Applies a timeout to all socket reads and writes; None removes
    /// it.
    ///
    /// # Errors
    ///
    /// Propagates socket option failures.
    pub fn set_io_timeout(&self, timeout: Option<Duration>) -> CoreResult<()> {
        self.writer.set_io_timeout(timeout)?;
        Ok(())
    }

    /// Loads several records in one exchange. Missing records come
    /// back as None.
    ///
    /// # Errors
    ///
    /// A read conflict naming every OID awaiting resynchronization,
    /// after the whole reply has been drained.
    pub fn load_many(&mut self, oids: &[Oid]) -> CoreResult<Vec<Option<Vec<u8>>>> {
        if oids.len() as u64 > u64::from(MAX_OID_BATCH) {
            return Err(CoreError::protocol(format!(
                "batch of {} loads exceeds the wire limit",
                oids.len()
            )));
        }
        let mut req = Vec::with_capacity(5 + oids.len() * 8);
        req.push(Opcode::LoadBatch.as_byte());
        req.extend_from_slice(&(oids.len() as u32).to_be_bytes());
        for oid in oids {
            req.extend_from_slice(&oid.as_u64().to_be_bytes());
        }
        self.send(&req)?;

        let mut records = Vec::with_capacity(oids.len());
        let mut conflicted = Vec::new();
        for &oid in oids {
            match self.read_status()? {
                Status::Ok => {
                    let len = self.checked_record_len()?;
                    records.push(Some(self.read_exact_vec(len)?));
                }
                Status::KeyError => records.push(None),
                Status::Invalid => {
                    conflicted.push(oid);
                    records.push(None);
                }
            }
        }
        if conflicted.is_empty() {
            Ok(records)
        } else {
            Err(CoreError::read_conflict(conflicted))
        }
    }

    fn send(&mut self, request: &[u8]) -> CoreResult<()> {
        self.writer.write_all(request)?;
        self.writer.flush()?;
        Ok(())
    }

    fn read_exact_vec(&mut self, len: usize) -> CoreResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_u32(&mut self) -> CoreResult<u32> {
        let mut raw = [0u8; 4];
        self.reader.read_exact(&mut raw)?;
        Ok(u32::from_be_bytes(raw))
    }

    fn read_status(&mut self) -> CoreResult<Status> {
        let mut raw = [0u8; 1];
        self.reader.read_exact(&mut raw)?;
        Status::from_byte(raw[0])
            .ok_or_else(|| CoreError::protocol(format!("unknown status byte {:#04x}", raw[0])))
    }

    fn checked_record_len(&mut self) -> CoreResult<usize> {
        let len = self.read_u32()?;
        if len > MAX_RECORD_LEN {
            return Err(CoreError::protocol(format!(
                "record of {len} bytes exceeds the wire limit"
            )));
        }
        Ok(len as usize)
    }

    fn read_oid_list(&mut self) -> CoreResult<Vec<u64>> {
        let count = self.read_u32()?;
        let bytes = u64::from(count) * 8;
        if bytes > u64::from(MAX_COMMIT_BLOB_LEN) {
            return Err(CoreError::protocol(format!(
                "OID list of {count} entries exceeds the wire limit"
            )));
        }
        let body = self.read_exact_vec(bytes as usize)?;
        decode_oids(&body).map_err(|err| CoreError::protocol(err.to_string()))
    }
}

impl Storage for RemoteStorage {
    fn new_oid(&mut self) -> CoreResult<Oid> {
        if self.oid_pool.is_empty() {
            let mut req = Vec::with_capacity(5);
            req.push(Opcode::NewOidBatch.as_byte());
            req.extend_from_slice(&OID_BATCH_SIZE.to_be_bytes());
            self.send(&req)?;
            let batch = self.read_oid_list()?;
            if batch.is_empty() {
                return Err(CoreError::protocol("server returned an empty OID batch"));
            }
            tracing::trace!(count = batch.len(), "refilled OID pool");
            self.oid_pool.extend(batch);
        }
        let oid = self
            .oid_pool
            .pop_front()
            .ok_or_else(|| CoreError::protocol("OID pool drained unexpectedly"))?;
        Ok(Oid::new(oid))
    }

    fn load(&mut self, oid: Oid) -> CoreResult<Vec<u8>> {
        let mut req = Vec::with_capacity(9);
        req.push(Opcode::Load.as_byte());
        req.extend_from_slice(&oid.as_u64().to_be_bytes());
        self.send(&req)?;
        match self.read_status()? {
            Status::Ok => {
                let len = self.checked_record_len()?;
                self.read_exact_vec(len)
            }
            Status::KeyError => Err(CoreError::not_found(oid)),
            Status::Invalid => Err(CoreError::read_conflict(vec![oid])),
        }
    }

    fn begin(&mut self) -> CoreResult<()> {
        self.pending.clear();
        self.in_txn = true;
        Ok(())
    }

    fn store(&mut self, oid: Oid, record: Vec<u8>) -> CoreResult<()> {
        if !self.in_txn {
            return Err(CoreError::invalid_operation("store outside a transaction"));
        }
        if oid.as_u64() == u64::MAX {
            // Reserved by the storage log as the commit marker; the
            // server refuses it too.
            return Err(CoreError::invalid_operation(
                "oid u64::MAX is reserved for the block marker",
            ));
        }
        if record.len() as u64 > u64::from(MAX_RECORD_LEN) {
            return Err(CoreError::protocol(format!(
                "record of {} bytes exceeds the wire limit",
                record.len()
            )));
        }
        self.pending.push((oid.as_u64(), record));
        Ok(())
    }

    fn end(&mut self) -> CoreResult<()> {
        if !self.in_txn {
            return Err(CoreError::invalid_operation("commit without a transaction"));
        }
        self.in_txn = false;
        self.send(&[Opcode::Commit.as_byte()])?;
        let invalidated = self.read_oid_list()?;
        if !invalidated.is_empty() {
            // Another writer got there first. Deliver an empty
            // transaction to keep the exchange in step, then report
            // the conflict.
            self.pending.clear();
            self.send(&0u32.to_be_bytes())?;
            let _ = self.read_status()?;
            return Err(CoreError::write_conflict(
                invalidated.into_iter().map(Oid::new).collect(),
            ));
        }
        let blob = encode_commit_blob(&self.pending);
        self.pending.clear();
        if blob.len() as u64 > u64::from(MAX_COMMIT_BLOB_LEN) {
            self.send(&0u32.to_be_bytes())?;
            let _ = self.read_status()?;
            return Err(CoreError::protocol("transaction exceeds the wire size limit"));
        }
        let mut msg = Vec::with_capacity(4 + blob.len());
        msg.extend_from_slice(&(blob.len() as u32).to_be_bytes());
        msg.extend_from_slice(&blob);
        self.send(&msg)?;
        match self.read_status()? {
            Status::Ok => Ok(()),
            Status::Invalid => Err(CoreError::write_conflict(Vec::new())),
            Status::KeyError => Err(CoreError::protocol("unexpected commit status")),
        }
    }

    fn sync(&mut self) -> CoreResult<Vec<Oid>> {
        self.send(&[Opcode::Sync.as_byte()])?;
        Ok(self.read_oid_list()?.into_iter().map(Oid::new).collect())
    }

    fn each_record(&mut self, _f: &mut dyn FnMut(Oid, &[u8]) -> CoreResult<()>) -> CoreResult<()> {
        Err(CoreError::protocol(
            "record iteration is not available over the wire",
        ))
    }

    fn pack(&mut self) -> CoreResult<()> {
        self.send(&[Opcode::Pack.as_byte()])?;
        match self.read_status()? {
            Status::Ok => Ok(()),
            status => Err(CoreError::protocol(format!("pack refused: {status:?}"))),
        }
    }
}

impl Drop for RemoteStorage {
    fn drop(&mut self) {
        let _ = self.writer.write_all(&[Opcode::Quit.as_byte()]);
        let _ = self.writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{SocketAddr, TcpListener};
    use std::thread::JoinHandle;

    fn read_byte(stream: &mut TcpStream) -> u8 {
        let mut raw = [0u8; 1];
        stream.read_exact(&mut raw).unwrap();
        raw[0]
    }

    fn read_u32(stream: &mut TcpStream) -> u32 {
        let mut raw = [0u8; 4];
        stream.read_exact(&mut raw).unwrap();
        u32::from_be_bytes(raw)
    }

    fn read_u64(stream: &mut TcpStream) -> u64 {
        let mut raw = [0u8; 8];
        stream.read_exact(&mut raw).unwrap();
        u64::from_be_bytes(raw)
    }

    fn send_oid_list(stream: &mut TcpStream, oids: &[u64]) {
        stream
            .write_all(&(oids.len() as u32).to_be_bytes())
            .unwrap();
        stream.write_all(&objdb_proto::encode_oids(oids)).unwrap();
    }

    /// Accepts one client, answers the handshake, then runs `script`.
    fn scripted_server<F>(script: F) -> (SocketAddr, JoinHandle<()>)
    where
        F: FnOnce(&mut TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut version = [0u8; 4];
            stream.read_exact(&mut version).unwrap();
            assert_eq!(version, PROTOCOL_VERSION);
            stream.write_all(&[Status::Ok.as_byte()]).unwrap();
            script(&mut stream);
        });
        (addr, handle)
    }

    #[test]
    fn handshake_rejection_surfaces_as_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut version = [0u8; 4];
            stream.read_exact(&mut version).unwrap();
            stream.write_all(&[Status::Invalid.as_byte()]).unwrap();
        });
        assert!(matches!(
            RemoteStorage::connect(addr),
            Err(CoreError::ProtocolError { .. })
        ));
        handle.join().unwrap();
    }

    #[test]
    fn oid_pool_refills_in_batches() {
        let (addr, handle) = scripted_server(|stream| {
            assert_eq!(read_byte(stream), Opcode::NewOidBatch.as_byte());
            assert_eq!(read_u32(stream), OID_BATCH_SIZE);
            let batch: Vec<u64> = (100..100 + u64::from(OID_BATCH_SIZE)).collect();
            send_oid_list(stream, &batch);
            assert_eq!(read_byte(stream), Opcode::Quit.as_byte());
        });

        let mut storage = RemoteStorage::connect(addr).unwrap();
        // One round trip serves the whole batch.
        for expected in 100..100 + u64::from(OID_BATCH_SIZE) {
            assert_eq!(storage.new_oid().unwrap(), Oid::new(expected));
        }
        drop(storage);
        handle.join().unwrap();
    }

    #[test]
    fn load_maps_each_status() {
        let (addr, handle) = scripted_server(|stream| {
            for _ in 0..3 {
                assert_eq!(read_byte(stream), Opcode::Load.as_byte());
                let oid = read_u64(stream);
                match oid {
                    1 => {
                        stream.write_all(&[Status::Ok.as_byte()]).unwrap();
                        stream.write_all(&5u32.to_be_bytes()).unwrap();
                        stream.write_all(b"bytes").unwrap();
                    }
                    2 => stream.write_all(&[Status::KeyError.as_byte()]).unwrap(),
                    _ => stream.write_all(&[Status::Invalid.as_byte()]).unwrap(),
                }
            }
            assert_eq!(read_byte(stream), Opcode::Quit.as_byte());
        });

        let mut storage = RemoteStorage::connect(addr).unwrap();
        assert_eq!(storage.load(Oid::new(1)).unwrap(), b"bytes");
        assert!(matches!(
            storage.load(Oid::new(2)),
            Err(CoreError::NotFound { .. })
        ));
        match storage.load(Oid::new(3)) {
            Err(CoreError::ReadConflict { oids }) => assert_eq!(oids, vec![Oid::new(3)]),
            other => panic!("expected read conflict, got {other:?}"),
        }
        drop(storage);
        handle.join().unwrap();
    }

    #[test]
    fn commit_sends_records_after_clean_invalidations() {
        let (addr, handle) = scripted_server(|stream| {
            assert_eq!(read_byte(stream), Opcode::Commit.as_byte());
            send_oid_list(stream, &[]);
            let len = read_u32(stream) as usize;
            let mut blob = vec![0u8; len];
            stream.read_exact(&mut blob).unwrap();
            let records = objdb_proto::decode_commit_blob(&blob).unwrap();
            assert_eq!(records, vec![(5u64, b"hello".to_vec())]);
            stream.write_all(&[Status::Ok.as_byte()]).unwrap();
            assert_eq!(read_byte(stream), Opcode::Quit.as_byte());
        });

        let mut storage = RemoteStorage::connect(addr).unwrap();
        storage.begin().unwrap();
        storage.store(Oid::new(5), b"hello".to_vec()).unwrap();
        storage.end().unwrap();
        drop(storage);
        handle.join().unwrap();
    }

    #[test]
    fn commit_backs_off_when_invalidations_arrive() {
        let (addr, handle) = scripted_server(|stream| {
            assert_eq!(read_byte(stream), Opcode::Commit.as_byte());
            send_oid_list(stream, &[7]);
            // The client keeps the exchange in step with an empty
            // transaction.
            assert_eq!(read_u32(stream), 0);
            stream.write_all(&[Status::Ok.as_byte()]).unwrap();
            assert_eq!(read_byte(stream), Opcode::Quit.as_byte());
        });

        let mut storage = RemoteStorage::connect(addr).unwrap();
        storage.begin().unwrap();
        storage.store(Oid::new(5), b"doomed".to_vec()).unwrap();
        match storage.end() {
            Err(CoreError::WriteConflict { oids }) => assert_eq!(oids, vec![Oid::new(7)]),
            other => panic!("expected write conflict, got {other:?}"),
        }
        drop(storage);
        handle.join().unwrap();
    }

    #[test]
    fn empty_commit_is_a_pure_sync_on_the_wire() {
        let (addr, handle) = scripted_server(|stream| {
            assert_eq!(read_byte(stream), Opcode::Commit.as_byte());
            send_oid_list(stream, &[]);
            assert_eq!(read_u32(stream), 0);
            stream.write_all(&[Status::Ok.as_byte()]).unwrap();
            assert_eq!(read_byte(stream), Opcode::Quit.as_byte());
        });

        let mut storage = RemoteStorage::connect(addr).unwrap();
        storage.begin().unwrap();
        storage.end().unwrap();
        drop(storage);
        handle.join().unwrap();
    }

    #[test]
    fn sync_returns_the_drained_oid_list() {
        let (addr, handle) = scripted_server(|stream| {
            assert_eq!(read_byte(stream), Opcode::Sync.as_byte());
            send_oid_list(stream, &[3, 9]);
            assert_eq!(read_byte(stream), Opcode::Quit.as_byte());
        });

        let mut storage = RemoteStorage::connect(addr).unwrap();
        assert_eq!(storage.sync().unwrap(), vec![Oid::new(3), Oid::new(9)]);
        drop(storage);
        handle.join().unwrap();
    }

    #[test]
    fn load_many_mixes_hits_and_misses() {
        let (addr, handle) = scripted_server(|stream| {
            assert_eq!(read_byte(stream), Opcode::LoadBatch.as_byte());
            assert_eq!(read_u32(stream), 2);
            assert_eq!(read_u64(stream), 1);
            assert_eq!(read_u64(stream), 2);
            stream.write_all(&[Status::Ok.as_byte()]).unwrap();
            stream.write_all(&2u32.to_be_bytes()).unwrap();
            stream.write_all(b"ab").unwrap();
            stream.write_all(&[Status::KeyError.as_byte()]).unwrap();
            assert_eq!(read_byte(stream), Opcode::Quit.as_byte());
        });

        let mut storage = RemoteStorage::connect(addr).unwrap();
        let records = storage.load_many(&[Oid::new(1), Oid::new(2)]).unwrap();
        assert_eq!(records, vec![Some(b"ab".to_vec()), None]);
        drop(storage);
        handle.join().unwrap();
    }

    #[test]
    fn record_iteration_is_refused() {
        let (addr, handle) = scripted_server(|stream| {
            assert_eq!(read_byte(stream), Opcode::Quit.as_byte());
        });

        let mut storage = RemoteStorage::connect(addr).unwrap();
        let result = storage.each_record(&mut |_, _| Ok(()));
        assert!(matches!(result, Err(CoreError::ProtocolError { .. })));
        drop(storage);
        handle.join().unwrap();
    }

    #[test]
    fn store_outside_a_transaction_is_rejected() {
        let (addr, handle) = scripted_server(|stream| {
            assert_eq!(read_byte(stream), Opcode::Quit.as_byte());
        });

        let mut storage = RemoteStorage::connect(addr).unwrap();
        assert!(matches!(
            storage.store(Oid::new(1), b"x".to_vec()),
            Err(CoreError::InvalidOperation { .. })
        ));
        drop(storage);
        handle.join().unwrap();
    }

    #[test]
    fn store_of_the_reserved_oid_is_rejected() {
        let (addr, handle) = scripted_server(|stream| {
            assert_eq!(read_byte(stream), Opcode::Quit.as_byte());
        });

        let mut storage = RemoteStorage::connect(addr).unwrap();
        storage.begin().unwrap();
        assert!(matches!(
            storage.store(Oid::new(u64::MAX), b"x".to_vec()),
            Err(CoreError::InvalidOperation { .. })
        ));
        drop(storage);
        handle.join().unwrap();
    }
}
