//! Accept loop and per-session protocol handling.
//!
//! Every session runs as a task on one `LocalSet`, so storage access
//! needs no locks: a command executes to completion before the next
//! one is polled, and commits never hold an open bracket across an
//! await point. Packing is a task on the same thread that performs one
//! bounded step, yields, and repeats, which keeps client latency flat
//! while the file is rewritten.

use crate::config::{BindAddr, ServerConfig};
use crate::error::{ServerError, ServerResult};
use objdb_core::{CoreError, FileStorage, Oid, Record, Storage};
use objdb_proto::{decode_commit_blob, decode_oids, encode_oids, Opcode, Status, PROTOCOL_VERSION};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::sync::Notify;
use tokio::task::LocalSet;
use tokio::time::timeout;

/// Stops a running [`StorageServer`] from any thread.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    /// Creates an unattached handle; [`StorageServer::bind`] makes its
    /// own.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the server to stop accepting and tear down. Harmless to
    /// call before the server runs or more than once.
    pub fn shutdown(&self) {
        self.notify.notify_one();
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// State shared by every session task on the loop thread.
struct Shared {
    storage: FileStorage,
    sessions: HashMap<u64, BTreeSet<Oid>>,
    pack_running: bool,
}

impl Shared {
    /// Clears and returns this session's pending invalidations,
    /// ascending.
    fn take_invalidations(&mut self, session: u64) -> Vec<u64> {
        self.sessions
            .get_mut(&session)
            .map(std::mem::take)
            .map(|pending| pending.into_iter().map(Oid::as_u64).collect())
            .unwrap_or_default()
    }

    fn fan_out(&mut self, source: u64, written: &[Oid]) {
        for (id, pending) in &mut self.sessions {
            if *id != source {
                pending.extend(written.iter().copied());
            }
        }
    }

    /// Appends one load sub-frame: `Invalid` if the session holds a
    /// pending invalidation for the OID, otherwise the record or
    /// `KeyError`.
    fn record_frame(&mut self, session: u64, oid: Oid, out: &mut Vec<u8>) -> ServerResult<()> {
        let invalid = self
            .sessions
            .get(&session)
            .is_some_and(|pending| pending.contains(&oid));
        if invalid {
            out.push(Status::Invalid.as_byte());
            return Ok(());
        }
        match self.storage.load(oid) {
            Ok(bytes) => {
                out.push(Status::Ok.as_byte());
                out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                out.extend_from_slice(&bytes);
            }
            Err(CoreError::NotFound { .. }) => out.push(Status::KeyError.as_byte()),
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}

enum Listener {
    Tcp(std::net::TcpListener),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener),
}

/// Serves one storage file to many remote sessions on one thread.
pub struct StorageServer {
    config: ServerConfig,
    storage: FileStorage,
    listener: Listener,
    local_addr: Option<SocketAddr>,
    shutdown: ShutdownHandle,
}

impl StorageServer {
    /// Binds the configured address without serving yet.
    ///
    /// # Errors
    ///
    /// Fails when the address cannot be bound.
    pub fn bind(storage: FileStorage, config: ServerConfig) -> ServerResult<Self> {
        let (listener, local_addr) = match &config.bind {
            BindAddr::Tcp(addr) => {
                let listener = std::net::TcpListener::bind(addr)?;
                listener.set_nonblocking(true)?;
                let local = listener.local_addr()?;
                (Listener::Tcp(listener), Some(local))
            }
            #[cfg(unix)]
            BindAddr::Unix(path) => {
                // A socket file left by a previous run blocks bind.
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = std::os::unix::net::UnixListener::bind(path)?;
                listener.set_nonblocking(true)?;
                (Listener::Unix(listener), None)
            }
        };
        tracing::info!(bind = %config.bind, "storage server bound");
        Ok(Self {
            config,
            storage,
            listener,
            local_addr,
            shutdown: ShutdownHandle::new(),
        })
    }

    /// The bound TCP address; None for Unix-domain listeners.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// A handle that stops this server from any thread.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serves until shutdown, consuming the calling thread.
    ///
    /// # Errors
    ///
    /// Fatal listener or runtime errors. A failing session only ends
    /// that session.
    pub fn run(self) -> ServerResult<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let local = LocalSet::new();
        local.block_on(&runtime, self.serve())
    }

    async fn serve(self) -> ServerResult<()> {
        let Self {
            config,
            storage,
            listener,
            shutdown,
            ..
        } = self;
        let config = Rc::new(config);
        let shared = Rc::new(RefCell::new(Shared {
            storage,
            sessions: HashMap::new(),
            pack_running: false,
        }));
        let mut next_session: u64 = 0;
        match listener {
            Listener::Tcp(listener) => {
                let listener = tokio::net::TcpListener::from_std(listener)?;
                loop {
                    tokio::select! {
                        () = shutdown.wait() => break,
                        accepted = listener.accept() => {
                            let (stream, peer) = accepted?;
                            // The exchange is small request/reply
                            // frames; batching only adds latency.
                            let _ = stream.set_nodelay(true);
                            tracing::debug!(session = next_session, %peer, "client connected");
                            spawn_session(&shared, &config, next_session, stream);
                            next_session += 1;
                        }
                    }
                }
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let listener = tokio::net::UnixListener::from_std(listener)?;
                loop {
                    tokio::select! {
                        () = shutdown.wait() => break,
                        accepted = listener.accept() => {
                            let (stream, _) = accepted?;
                            tracing::debug!(session = next_session, "client connected");
                            spawn_session(&shared, &config, next_session, stream);
                            next_session += 1;
                        }
                    }
                }
                if let BindAddr::Unix(path) = &config.bind {
                    let _ = std::fs::remove_file(path);
                }
            }
        }
        tracing::info!("storage server stopped");
        Ok(())
    }
}

fn spawn_session<S>(shared: &Rc<RefCell<Shared>>, config: &Rc<ServerConfig>, session: u64, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    shared.borrow_mut().sessions.insert(session, BTreeSet::new());
    let shared = Rc::clone(shared);
    let config = Rc::clone(config);
    tokio::task::spawn_local(async move {
        let result = serve_session(&shared, &config, session, stream).await;
        shared.borrow_mut().sessions.remove(&session);
        match result {
            Ok(()) => tracing::debug!(session, "client disconnected"),
            Err(err) if err.is_session_fault() => {
                tracing::debug!(session, error = %err, "session dropped");
            }
            Err(err) => tracing::error!(session, error = %err, "session failed"),
        }
    });
}

async fn serve_session<S>(
    shared: &Rc<RefCell<Shared>>,
    config: &ServerConfig,
    session: u64,
    stream: S,
) -> ServerResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufStream::new(stream);
    let idle = config.idle_timeout;

    let mut version = [0u8; 4];
    timeout(idle, stream.read_exact(&mut version)).await??;
    if version != PROTOCOL_VERSION {
        stream.write_u8(Status::Invalid.as_byte()).await?;
        stream.flush().await?;
        return Err(ServerError::protocol(format!(
            "handshake bytes {version:02x?}"
        )));
    }
    stream.write_u8(Status::Ok.as_byte()).await?;
    stream.flush().await?;

    loop {
        let opcode = match timeout(idle, stream.read_u8()).await? {
            Ok(byte) => byte,
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let Some(op) = Opcode::from_byte(opcode) else {
            return Err(ServerError::protocol(format!(
                "unknown opcode {opcode:#04x}"
            )));
        };
        match op {
            Opcode::NewOid => {
                let oid = shared.borrow_mut().storage.new_oid()?;
                stream.write_u64(oid.as_u64()).await?;
            }
            Opcode::NewOidBatch => {
                let count = timeout(idle, stream.read_u32()).await??;
                if count == 0 || count > config.max_oid_batch {
                    return Err(ServerError::protocol(format!("oid batch of {count}")));
                }
                let mut reply = Vec::with_capacity(4 + count as usize * 8);
                reply.extend_from_slice(&count.to_be_bytes());
                {
                    let mut shared = shared.borrow_mut();
                    for _ in 0..count {
                        let oid = shared.storage.new_oid()?;
                        reply.extend_from_slice(&oid.as_u64().to_be_bytes());
                    }
                }
                stream.write_all(&reply).await?;
            }
            Opcode::Load => {
                let oid = Oid::new(timeout(idle, stream.read_u64()).await??);
                let mut reply = Vec::new();
                shared.borrow_mut().record_frame(session, oid, &mut reply)?;
                stream.write_all(&reply).await?;
            }
            Opcode::LoadBatch => {
                let count = timeout(idle, stream.read_u32()).await??;
                if count > config.max_oid_batch {
                    return Err(ServerError::protocol(format!("load batch of {count}")));
                }
                let mut raw = vec![0u8; count as usize * 8];
                timeout(idle, stream.read_exact(&mut raw)).await??;
                let oids =
                    decode_oids(&raw).map_err(|err| ServerError::protocol(err.to_string()))?;
                let mut reply = Vec::new();
                {
                    let mut shared = shared.borrow_mut();
                    for oid in oids {
                        shared.record_frame(session, Oid::new(oid), &mut reply)?;
                    }
                }
                stream.write_all(&reply).await?;
            }
            Opcode::Commit => {
                commit_exchange(shared, config, session, &mut stream).await?;
            }
            Opcode::Sync => {
                let drained = shared.borrow_mut().take_invalidations(session);
                let mut reply = Vec::with_capacity(4 + drained.len() * 8);
                reply.extend_from_slice(&(drained.len() as u32).to_be_bytes());
                reply.extend_from_slice(&encode_oids(&drained));
                stream.write_all(&reply).await?;
            }
            Opcode::Pack => {
                start_pack(shared)?;
                stream.write_u8(Status::Ok.as_byte()).await?;
            }
            Opcode::Quit => {
                stream.write_u8(Status::Ok.as_byte()).await?;
                stream.flush().await?;
                return Ok(());
            }
        }
        stream.flush().await?;
    }
}

/// The three-step commit: deliver invalidations, take the record blob,
/// apply it atomically and fan the written OIDs out.
async fn commit_exchange<S>(
    shared: &Rc<RefCell<Shared>>,
    config: &ServerConfig,
    session: u64,
    stream: &mut BufStream<S>,
) -> ServerResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let invalidated = shared.borrow_mut().take_invalidations(session);
    let mut header = Vec::with_capacity(4 + invalidated.len() * 8);
    header.extend_from_slice(&(invalidated.len() as u32).to_be_bytes());
    header.extend_from_slice(&encode_oids(&invalidated));
    stream.write_all(&header).await?;
    stream.flush().await?;

    let blob_len = timeout(config.idle_timeout, stream.read_u32()).await??;
    if blob_len > config.max_commit_blob {
        return Err(ServerError::protocol(format!(
            "commit blob of {blob_len} bytes"
        )));
    }
    let mut blob = vec![0u8; blob_len as usize];
    timeout(config.idle_timeout, stream.read_exact(&mut blob)).await??;
    if blob.is_empty() {
        // Nothing to write; the exchange was a pure synchronization.
        stream.write_u8(Status::Ok.as_byte()).await?;
        return Ok(());
    }

    let records = decode_commit_blob(&blob).map_err(|err| ServerError::protocol(err.to_string()))?;
    // Validate before opening the bracket so a bad entry cannot leave
    // a half-built transaction behind. Oid u64::MAX is reserved by the
    // storage log as its commit marker and must never reach it.
    for (oid, bytes) in &records {
        let valid = *oid != u64::MAX
            && Record::peek_oid(bytes).is_ok_and(|embedded| embedded.as_u64() == *oid);
        if !valid {
            tracing::debug!(session, oid = *oid, "refusing invalid commit entry");
            stream.write_u8(Status::Invalid.as_byte()).await?;
            return Ok(());
        }
    }
    let written: Vec<Oid> = records.iter().map(|(oid, _)| Oid::new(*oid)).collect();
    {
        let mut shared = shared.borrow_mut();
        shared.storage.begin()?;
        for (oid, bytes) in records {
            shared.storage.store(Oid::new(oid), bytes)?;
        }
        shared.storage.end()?;
        shared.fan_out(session, &written);
    }
    tracing::debug!(session, records = written.len(), "commit applied");
    stream.write_u8(Status::Ok.as_byte()).await?;
    Ok(())
}

/// Starts the incremental pack task unless one is already running.
fn start_pack(shared: &Rc<RefCell<Shared>>) -> ServerResult<()> {
    {
        let mut guard = shared.borrow_mut();
        if guard.pack_running {
            return Ok(());
        }
        guard.storage.start_pack()?;
        guard.pack_running = true;
    }
    let shared = Rc::clone(shared);
    tokio::task::spawn_local(async move {
        loop {
            let step = shared.borrow_mut().storage.pack_step();
            match step {
                Ok(true) => break,
                // Yield between steps so client traffic interleaves.
                Ok(false) => tokio::task::yield_now().await,
                Err(err) => {
                    tracing::error!(error = %err, "pack abandoned");
                    break;
                }
            }
        }
        shared.borrow_mut().pack_running = false;
        tracing::debug!("pack task finished");
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn loopback() -> ServerConfig {
        ServerConfig::tcp("127.0.0.1:0".parse().unwrap())
    }

    #[test]
    fn bind_reports_the_chosen_port() {
        let storage = FileStorage::in_memory().unwrap();
        let server = StorageServer::bind(storage, loopback()).unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn two_servers_cannot_share_a_port() {
        let first =
            StorageServer::bind(FileStorage::in_memory().unwrap(), loopback()).unwrap();
        let addr = first.local_addr().unwrap();
        let second = StorageServer::bind(FileStorage::in_memory().unwrap(), ServerConfig::tcp(addr));
        assert!(matches!(second, Err(ServerError::Io(_))));
    }

    #[test]
    fn shutdown_before_run_stops_immediately() {
        let storage = FileStorage::in_memory().unwrap();
        let server = StorageServer::bind(storage, loopback()).unwrap();
        server.shutdown_handle().shutdown();
        // The stored permit makes run() return without a client.
        server.run().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn unix_listener_replaces_a_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("objdb.sock");
        std::fs::write(&path, b"stale").unwrap();
        let storage = FileStorage::in_memory().unwrap();
        let server = StorageServer::bind(storage, ServerConfig::unix(&path)).unwrap();
        assert!(server.local_addr().is_none());
    }
}
