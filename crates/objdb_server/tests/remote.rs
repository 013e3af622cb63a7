//! End-to-end exchanges between the remote client and the server.

use objdb_client::RemoteStorage;
use objdb_core::{
    Connection, CoreError, CoreResult, FileStorage, Oid, Persistent, PersistentState, Record,
    StateReader, StateWriter, Storage,
};
use objdb_server::{ServerConfig, ServerResult, ShutdownHandle, StorageServer};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tempfile::tempdir;

#[derive(Debug)]
struct Item {
    label: String,
    quantity: u64,
}

impl PersistentState for Item {
    fn store_state(&self, writer: &mut StateWriter) -> CoreResult<()> {
        writer.put_str(&self.label)?;
        writer.put_u64(self.quantity);
        Ok(())
    }

    fn load_state(reader: &mut StateReader) -> CoreResult<Self> {
        Ok(Self {
            label: reader.take_str()?,
            quantity: reader.take_u64()?,
        })
    }
}

fn loopback() -> ServerConfig {
    ServerConfig::tcp("127.0.0.1:0".parse().unwrap())
}

fn start_server(
    path: &Path,
    config: ServerConfig,
) -> (SocketAddr, ShutdownHandle, JoinHandle<ServerResult<()>>) {
    let storage = FileStorage::open(path).unwrap();
    let server = StorageServer::bind(storage, config).unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let handle = std::thread::spawn(move || server.run());
    (addr, shutdown, handle)
}

fn stop(shutdown: &ShutdownHandle, handle: JoinHandle<ServerResult<()>>) {
    shutdown.shutdown();
    handle.join().unwrap().unwrap();
}

fn connect(addr: SocketAddr) -> Connection<RemoteStorage> {
    Connection::new(RemoteStorage::connect(addr).unwrap())
}

#[test]
fn remote_object_graph_round_trips() {
    let dir = tempdir().unwrap();
    let (addr, shutdown, handle) = start_server(&dir.path().join("remote.odb"), loopback());

    let writer = connect(addr);
    let root = Persistent::new(Item {
        label: "root".into(),
        quantity: 3,
    });
    writer.set_root(&root).unwrap();
    writer.commit().unwrap();

    let reader = connect(addr);
    let seen: Persistent<Item> = reader.root().unwrap().unwrap();
    let (label, quantity) = seen
        .read(|item| (item.label.clone(), item.quantity))
        .unwrap();
    assert_eq!(label, "root");
    assert_eq!(quantity, 3);

    drop(writer);
    drop(reader);
    stop(&shutdown, handle);
}

#[test]
fn conflicting_remote_writers_converge() {
    let dir = tempdir().unwrap();
    let (addr, shutdown, handle) = start_server(&dir.path().join("conflict.odb"), loopback());

    let a = connect(addr);
    let root_a = Persistent::new(Item {
        label: "v1".into(),
        quantity: 1,
    });
    a.set_root(&root_a).unwrap();
    a.commit().unwrap();

    let b = connect(addr);
    let root_b: Persistent<Item> = b.root().unwrap().unwrap();
    assert_eq!(root_b.read(|item| item.label.clone()).unwrap(), "v1");

    root_a.modify(|item| item.label = "v2".into()).unwrap();
    a.commit().unwrap();

    root_b.modify(|item| item.label = "loser".into()).unwrap();
    let err = b.commit().unwrap_err();
    assert!(matches!(err, CoreError::WriteConflict { .. }));

    // After the abort the stale handle reloads the winning state, and
    // the session can write again.
    b.abort().unwrap();
    assert_eq!(root_b.read(|item| item.label.clone()).unwrap(), "v2");
    root_b.modify(|item| item.quantity = 9).unwrap();
    b.commit().unwrap();

    drop(a);
    drop(b);
    stop(&shutdown, handle);
}

#[test]
fn empty_remote_commit_acts_as_pure_sync() {
    let dir = tempdir().unwrap();
    let (addr, shutdown, handle) = start_server(&dir.path().join("sync.odb"), loopback());

    let a = connect(addr);
    let root_a = Persistent::new(Item {
        label: "shared".into(),
        quantity: 1,
    });
    a.set_root(&root_a).unwrap();
    a.commit().unwrap();

    let b = connect(addr);
    let root_b: Persistent<Item> = b.root().unwrap().unwrap();
    assert_eq!(root_b.read(|item| item.quantity).unwrap(), 1);

    root_a.modify(|item| item.quantity = 2).unwrap();
    a.commit().unwrap();

    // Nothing is dirty in b, so the commit degrades to a
    // synchronization: the invalidation drains and the handle reloads.
    b.commit().unwrap();
    assert!(b.invalid_oids().is_empty());
    assert_eq!(root_b.read(|item| item.quantity).unwrap(), 2);

    drop(a);
    drop(b);
    stop(&shutdown, handle);
}

#[test]
fn zero_record_commit_over_the_wire_drains_invalidations() {
    let dir = tempdir().unwrap();
    let (addr, shutdown, handle) = start_server(&dir.path().join("drain.odb"), loopback());

    let mut a = RemoteStorage::connect(addr).unwrap();
    let mut b = RemoteStorage::connect(addr).unwrap();

    let oid = a.new_oid().unwrap();
    let record = Record::new(oid, b"state".to_vec(), vec![]).encode().unwrap();
    a.begin().unwrap();
    a.store(oid, record.clone()).unwrap();
    a.end().unwrap();

    // The write is queued against b until it resynchronizes.
    let err = b.load(oid).unwrap_err();
    assert!(matches!(err, CoreError::ReadConflict { .. }));

    // A commit with no buffered records surfaces the queued OIDs as a
    // write conflict and clears them, without writing anything.
    b.begin().unwrap();
    match b.end() {
        Err(CoreError::WriteConflict { oids }) => assert_eq!(oids, vec![oid]),
        other => panic!("expected write conflict, got {other:?}"),
    }
    assert_eq!(b.load(oid).unwrap(), record);

    drop(a);
    drop(b);
    stop(&shutdown, handle);
}

#[test]
fn oid_allocation_is_disjoint_across_sessions() {
    let dir = tempdir().unwrap();
    let (addr, shutdown, handle) = start_server(&dir.path().join("alloc.odb"), loopback());

    let mut a = RemoteStorage::connect(addr).unwrap();
    let mut b = RemoteStorage::connect(addr).unwrap();
    let mut seen = HashSet::new();
    // Enough rounds to force several pool refills per session.
    for _ in 0..100 {
        assert!(seen.insert(a.new_oid().unwrap()));
        assert!(seen.insert(b.new_oid().unwrap()));
    }
    assert_eq!(seen.len(), 200);

    drop(a);
    drop(b);
    stop(&shutdown, handle);
}

#[test]
fn remote_pack_compacts_the_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pack.odb");
    let (addr, shutdown, handle) = start_server(&path, loopback());

    let conn = connect(addr);
    let root = Persistent::new(Item {
        label: "root".into(),
        quantity: 0,
    });
    conn.set_root(&root).unwrap();
    conn.commit().unwrap();
    // Rewrite the root many times so the log accumulates stale
    // versions.
    for round in 1..=50u64 {
        root.modify(|item| item.quantity = round).unwrap();
        conn.commit().unwrap();
    }
    let before = std::fs::metadata(&path).unwrap().len();

    conn.pack().unwrap();
    // The pack finishes in the background between requests; poll until
    // the rewritten file lands.
    let deadline = Instant::now() + Duration::from_secs(5);
    while std::fs::metadata(&path).unwrap().len() >= before {
        assert!(Instant::now() < deadline, "pack never finished");
        std::thread::sleep(Duration::from_millis(20));
    }

    let check = connect(addr);
    let seen: Persistent<Item> = check.root().unwrap().unwrap();
    assert_eq!(seen.read(|item| item.quantity).unwrap(), 50);

    drop(conn);
    drop(check);
    stop(&shutdown, handle);
}

#[test]
fn idle_sessions_are_dropped() {
    let dir = tempdir().unwrap();
    let config = loopback().with_idle_timeout(Duration::from_millis(50));
    let (addr, shutdown, handle) = start_server(&dir.path().join("idle.odb"), config);

    let mut storage = RemoteStorage::connect(addr).unwrap();
    assert!(storage.sync().unwrap().is_empty());
    std::thread::sleep(Duration::from_millis(400));
    assert!(storage.sync().is_err());

    drop(storage);
    stop(&shutdown, handle);
}

#[test]
fn version_mismatch_is_rejected() {
    use std::io::{Read, Write};

    let dir = tempdir().unwrap();
    let (addr, shutdown, handle) = start_server(&dir.path().join("reject.odb"), loopback());

    let mut raw = std::net::TcpStream::connect(addr).unwrap();
    raw.write_all(b"XX\x00\x00").unwrap();
    let mut status = [0u8; 1];
    raw.read_exact(&mut status).unwrap();
    assert_eq!(status[0], objdb_proto::Status::Invalid.as_byte());
    // The server hangs up after the refusal.
    let mut rest = [0u8; 1];
    assert_eq!(raw.read(&mut rest).unwrap(), 0);

    drop(raw);
    stop(&shutdown, handle);
}

#[test]
fn reserved_oid_commit_is_refused() {
    use std::io::{Read, Write};

    let dir = tempdir().unwrap();
    let (addr, shutdown, handle) = start_server(&dir.path().join("reserved.odb"), loopback());

    let mut raw = std::net::TcpStream::connect(addr).unwrap();
    raw.write_all(&objdb_proto::PROTOCOL_VERSION).unwrap();
    let mut status = [0u8; 1];
    raw.read_exact(&mut status).unwrap();
    assert_eq!(status[0], objdb_proto::Status::Ok.as_byte());

    // Commit one record claiming the OID the log reserves for its
    // block marker.
    raw.write_all(&[objdb_proto::Opcode::Commit.as_byte()])
        .unwrap();
    let mut count = [0u8; 4];
    raw.read_exact(&mut count).unwrap();
    assert_eq!(u32::from_be_bytes(count), 0);
    let record = Record::new(Oid::new(u64::MAX), b"evil".to_vec(), Vec::new())
        .encode()
        .unwrap();
    let blob = objdb_proto::encode_commit_blob(&[(u64::MAX, record)]);
    raw.write_all(&(blob.len() as u32).to_be_bytes()).unwrap();
    raw.write_all(&blob).unwrap();
    raw.read_exact(&mut status).unwrap();
    assert_eq!(status[0], objdb_proto::Status::Invalid.as_byte());

    // The refusal is frame aligned, so the session keeps answering.
    raw.write_all(&[objdb_proto::Opcode::Sync.as_byte()]).unwrap();
    raw.read_exact(&mut count).unwrap();
    assert_eq!(u32::from_be_bytes(count), 0);

    drop(raw);
    stop(&shutdown, handle);
}

#[cfg(unix)]
#[test]
fn unix_socket_round_trip() {
    let dir = tempdir().unwrap();
    let sock = dir.path().join("objdb.sock");
    let storage = FileStorage::open(dir.path().join("unix.odb")).unwrap();
    let server = StorageServer::bind(storage, ServerConfig::unix(&sock)).unwrap();
    let shutdown = server.shutdown_handle();
    let handle = std::thread::spawn(move || server.run());

    let conn = Connection::new(RemoteStorage::connect_unix(&sock).unwrap());
    let root = Persistent::new(Item {
        label: "local".into(),
        quantity: 1,
    });
    conn.set_root(&root).unwrap();
    conn.commit().unwrap();

    let again = Connection::new(RemoteStorage::connect_unix(&sock).unwrap());
    let seen: Persistent<Item> = again.root().unwrap().unwrap();
    assert_eq!(seen.read(|item| item.label.clone()).unwrap(), "local");

    drop(conn);
    drop(again);
    shutdown.shutdown();
    handle.join().unwrap().unwrap();
}
