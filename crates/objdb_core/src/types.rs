//! Core type definitions for ObjDB.

use std::fmt;

/// Unique identifier of a persistent object within one store.
///
/// OIDs are assigned monotonically by storage and never reused, even
/// after the object becomes unreachable and is packed away. OID 0 is
/// reserved for the root object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid(pub u64);

impl Oid {
    /// The reserved root object ID.
    pub const ROOT: Oid = Oid(0);

    /// Creates an OID from a raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next OID in allocation order.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns true for the reserved root OID.
    #[must_use]
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid:{}", self.0)
    }
}

/// Lifecycle state of a persistent object.
///
/// See the `persistent` module for the transition rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStatus {
    /// New or dirtied: in memory only, differs from the durable record.
    Unsaved,
    /// In memory and identical to the durable record.
    Saved,
    /// No in-memory state; reloaded from storage on next access.
    Ghost,
}

impl fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectStatus::Unsaved => "unsaved",
            ObjectStatus::Saved => "saved",
            ObjectStatus::Ghost => "ghost",
        };
        f.write_str(name)
    }
}
