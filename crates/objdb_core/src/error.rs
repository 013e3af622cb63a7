//! Error types for the ObjDB core.

use crate::types::Oid;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in ObjDB core operations.
///
/// Conflicts are never retried inside the engine; retry policy belongs
/// to the caller.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Byte-level storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] objdb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No record exists for the OID.
    #[error("object not found: {oid}")]
    NotFound {
        /// The OID that was requested.
        oid: Oid,
    },

    /// Tried to load an OID invalidated by a concurrent commit.
    ///
    /// The caller must resynchronize (abort or sync) before retrying.
    #[error("read conflict on {} invalidated object(s)", oids.len())]
    ReadConflict {
        /// The invalidated OIDs involved.
        oids: Vec<Oid>,
    },

    /// Tried to commit while holding invalidated OIDs, or the durable
    /// commit itself was rejected.
    ///
    /// The caller must abort and retry the whole unit of work.
    #[error("write conflict on {} invalidated object(s)", oids.len())]
    WriteConflict {
        /// The invalidated OIDs involved.
        oids: Vec<Oid>,
    },

    /// Malformed wire-protocol input, version mismatch, or unexpected
    /// opcode. Fatal to that connection only.
    #[error("protocol error: {message}")]
    ProtocolError {
        /// Description of the violation.
        message: String,
    },

    /// Unreadable or truncated on-disk record. Fatal; no automatic
    /// repair is attempted.
    #[error("corrupt record: {message}")]
    CorruptRecord {
        /// Description of the corruption.
        message: String,
    },

    /// A tree operation referenced a key that is not present.
    #[error("key not found")]
    KeyNotFound,

    /// `min_item`/`max_item` on a tree with no items.
    #[error("tree is empty")]
    EmptyTree,

    /// A typed handle was requested for an object cached under a
    /// different state type.
    #[error("object type mismatch for {oid}")]
    TypeMismatch {
        /// The OID whose cached object had another type.
        oid: Oid,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(oid: Oid) -> Self {
        Self::NotFound { oid }
    }

    /// Creates a read-conflict error.
    #[must_use]
    pub fn read_conflict(oids: Vec<Oid>) -> Self {
        Self::ReadConflict { oids }
    }

    /// Creates a write-conflict error.
    #[must_use]
    pub fn write_conflict(oids: Vec<Oid>) -> Self {
        Self::WriteConflict { oids }
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolError {
            message: message.into(),
        }
    }

    /// Creates a corrupt-record error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptRecord {
            message: message.into(),
        }
    }

    /// Creates an invalid-operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns the invalidated OIDs carried by a conflict error, if any.
    #[must_use]
    pub fn conflict_oids(&self) -> Option<&[Oid]> {
        match self {
            Self::ReadConflict { oids } | Self::WriteConflict { oids } => Some(oids),
            _ => None,
        }
    }
}
