//! Server configuration.

use objdb_proto::{MAX_COMMIT_BLOB_LEN, MAX_OID_BATCH};
use std::fmt;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::time::Duration;

/// Default TCP port of the storage server.
pub const DEFAULT_PORT: u16 = 2972;

/// Where the server listens.
#[derive(Debug, Clone)]
pub enum BindAddr {
    /// A TCP socket address.
    Tcp(SocketAddr),
    /// A Unix-domain socket path.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl fmt::Display for BindAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindAddr::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            BindAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

impl From<SocketAddr> for BindAddr {
    fn from(addr: SocketAddr) -> Self {
        BindAddr::Tcp(addr)
    }
}

/// Configuration for the storage server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind: BindAddr,
    /// Sessions quiet for longer than this are dropped.
    pub idle_timeout: Duration,
    /// Largest accepted OID allocation or load batch.
    pub max_oid_batch: u32,
    /// Largest accepted commit blob in bytes.
    pub max_commit_blob: u32,
}

impl ServerConfig {
    /// Creates a configuration listening on a TCP address.
    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            bind: BindAddr::Tcp(addr),
            idle_timeout: Duration::from_secs(600),
            max_oid_batch: MAX_OID_BATCH,
            max_commit_blob: MAX_COMMIT_BLOB_LEN,
        }
    }

    /// Creates a configuration listening on a Unix-domain socket.
    #[cfg(unix)]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        let mut config = Self::tcp(SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)));
        config.bind = BindAddr::Unix(path.into());
        config
    }

    /// Sets the session idle timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Caps batch sizes; the protocol ceiling still applies.
    #[must_use]
    pub fn with_max_oid_batch(mut self, count: u32) -> Self {
        self.max_oid_batch = count.min(MAX_OID_BATCH);
        self
    }

    /// Caps the commit blob size; the protocol ceiling still applies.
    #[must_use]
    pub fn with_max_commit_blob(mut self, bytes: u32) -> Self {
        self.max_commit_blob = bytes.min(MAX_COMMIT_BLOB_LEN);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::tcp(SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))
    }
}
