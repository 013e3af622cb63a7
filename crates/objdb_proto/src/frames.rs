//! Pure codecs for the composite frame bodies.
//!
//! The I/O layers read a length or count prefix off the stream, pull
//! that many bytes, and hand the body to these functions. Encoders
//! produce bodies only; prefixes are written by the sender.

use crate::wire::MAX_RECORD_LEN;
use thiserror::Error;

/// Decoding failure for a frame body.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    /// The body ended before a complete element.
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes required by the next element.
        need: usize,
        /// Bytes actually remaining.
        have: usize,
    },
    /// A declared length exceeds its wire limit.
    #[error("{what} length {len} exceeds limit {max}")]
    TooLarge {
        /// Which element was oversized.
        what: &'static str,
        /// Declared length.
        len: u64,
        /// Permitted maximum.
        max: u64,
    },
    /// The body held bytes beyond the last element.
    #[error("{extra} stray bytes after frame")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        extra: usize,
    },
}

/// Result alias for frame decoding.
pub type ProtoResult<T> = Result<T, ProtoError>;

/// Encodes an OID list body: each OID as eight big-endian bytes.
#[must_use]
pub fn encode_oids(oids: &[u64]) -> Vec<u8> {
    let mut body = Vec::with_capacity(oids.len() * 8);
    for oid in oids {
        body.extend_from_slice(&oid.to_be_bytes());
    }
    body
}

/// Decodes an OID list body.
///
/// # Errors
///
/// Fails when the body is not a whole number of OIDs.
pub fn decode_oids(body: &[u8]) -> ProtoResult<Vec<u64>> {
    if body.len() % 8 != 0 {
        return Err(ProtoError::Truncated {
            need: 8,
            have: body.len() % 8,
        });
    }
    Ok(body
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            u64::from_be_bytes(raw)
        })
        .collect())
}

/// Encodes a commit blob body: per record, the OID (8 bytes), the
/// record length (u32), and the record bytes.
#[must_use]
pub fn encode_commit_blob(records: &[(u64, Vec<u8>)]) -> Vec<u8> {
    let total: usize = records.iter().map(|(_, bytes)| 12 + bytes.len()).sum();
    let mut body = Vec::with_capacity(total);
    for (oid, bytes) in records {
        body.extend_from_slice(&oid.to_be_bytes());
        body.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        body.extend_from_slice(bytes);
    }
    body
}

/// Decodes a commit blob body.
///
/// # Errors
///
/// Fails on truncation, on a record longer than [`MAX_RECORD_LEN`],
/// and on stray bytes after the last record.
pub fn decode_commit_blob(body: &[u8]) -> ProtoResult<Vec<(u64, Vec<u8>)>> {
    let mut records = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        if rest.len() < 12 {
            return Err(ProtoError::Truncated {
                need: 12,
                have: rest.len(),
            });
        }
        let mut raw_oid = [0u8; 8];
        raw_oid.copy_from_slice(&rest[..8]);
        let oid = u64::from_be_bytes(raw_oid);
        let mut raw_len = [0u8; 4];
        raw_len.copy_from_slice(&rest[8..12]);
        let len = u32::from_be_bytes(raw_len);
        if len > MAX_RECORD_LEN {
            return Err(ProtoError::TooLarge {
                what: "record",
                len: u64::from(len),
                max: u64::from(MAX_RECORD_LEN),
            });
        }
        let len = len as usize;
        rest = &rest[12..];
        if rest.len() < len {
            return Err(ProtoError::Truncated {
                need: len,
                have: rest.len(),
            });
        }
        records.push((oid, rest[..len].to_vec()));
        rest = &rest[len..];
    }
    Ok(records)
}
