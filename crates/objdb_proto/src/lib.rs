//! # ObjDB Protocol
//!
//! Wire protocol shared by the ObjDB client and server.
//!
//! The protocol is a byte-oriented request/reply exchange over one
//! stream. After a four-byte version handshake, every request starts
//! with a single opcode byte; integers on the wire are big-endian.
//!
//! ## Exchanges
//!
//! | Opcode          | Request payload      | Reply                                  |
//! |-----------------|----------------------|----------------------------------------|
//! | `NewOid`        | nothing              | 8-byte OID                             |
//! | `NewOidBatch`   | u32 count            | u32 count, then count OIDs             |
//! | `Load`          | 8-byte OID           | status, then u32 length + record on Ok |
//! | `LoadBatch`     | u32 count, then OIDs | per OID: status (+ record on Ok)       |
//! | `Commit`        | see below            | status                                 |
//! | `Sync`          | nothing              | u32 count, then count OIDs             |
//! | `Pack`          | nothing              | status                                 |
//! | `Quit`          | nothing              | connection closes                      |
//!
//! `Commit` is a three-step dance: the server first sends the client's
//! accumulated invalidations (u32 count + OIDs), the client answers
//! with a u32 length and a record blob (zero length makes the commit a
//! pure synchronization), and the server finishes with a status byte.
//!
//! This crate holds only pure types and codecs; it does no I/O and
//! does not depend on the engine.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod frames;
mod wire;

pub use frames::{
    decode_commit_blob, decode_oids, encode_commit_blob, encode_oids, ProtoError, ProtoResult,
};
pub use wire::{
    Opcode, Status, MAX_COMMIT_BLOB_LEN, MAX_OID_BATCH, MAX_RECORD_LEN, PROTOCOL_VERSION,
};
