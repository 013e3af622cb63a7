//! Opcodes, status codes, and wire limits.

/// Version tag exchanged when a connection opens. The client sends
/// these four bytes verbatim; the server answers [`Status::Ok`] when
/// they match and [`Status::Invalid`] before closing when they do not.
pub const PROTOCOL_VERSION: [u8; 4] = *b"OD\x01\x00";

/// Upper bound on a single encoded record on the wire.
pub const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

/// Upper bound on the OID count of one batch request.
pub const MAX_OID_BATCH: u32 = 1024;

/// Upper bound on a whole commit blob.
pub const MAX_COMMIT_BLOB_LEN: u32 = 256 * 1024 * 1024;

/// First byte of every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Allocate one OID.
    NewOid = 1,
    /// Allocate a batch of OIDs.
    NewOidBatch = 2,
    /// Load one record.
    Load = 3,
    /// Load a batch of records.
    LoadBatch = 4,
    /// Commit a transaction (or synchronize, with an empty blob).
    Commit = 5,
    /// Drain pending invalidations.
    Sync = 6,
    /// Start packing the store.
    Pack = 7,
    /// Close the connection.
    Quit = 8,
}

impl Opcode {
    /// Converts a byte to an opcode.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::NewOid),
            2 => Some(Self::NewOidBatch),
            3 => Some(Self::Load),
            4 => Some(Self::LoadBatch),
            5 => Some(Self::Commit),
            6 => Some(Self::Sync),
            7 => Some(Self::Pack),
            8 => Some(Self::Quit),
            _ => None,
        }
    }

    /// Converts the opcode to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Single-byte reply verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// The request succeeded.
    Ok = 0,
    /// The requested record does not exist.
    KeyError = 1,
    /// The request cannot be honored in the connection's current
    /// state; for loads this means unsynchronized invalidations, for
    /// commits a concurrent writer won.
    Invalid = 2,
}

impl Status {
    /// Converts a byte to a status.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Ok),
            1 => Some(Self::KeyError),
            2 => Some(Self::Invalid),
            _ => None,
        }
    }

    /// Converts the status to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}
