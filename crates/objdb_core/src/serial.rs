//! Record format and state serialization.
//!
//! A durable record carries three things: the object's OID, an opaque
//! state payload, and the list of OIDs the state references. The
//! reference list is stored outside the payload so that storage-side
//! tools (the packer, history inspection) can walk the object graph
//! without decoding any state.
//!
//! Record layout, all integers big-endian:
//!
//! ```text
//! oid: u64 | state_len: u32 | state bytes | ref_count: u32 | refs: u64 each
//! ```
//!
//! Inside the state payload a reference to another persistent object is
//! a `u32` index into the record's reference list, written by
//! [`StateWriter::put_ref`] and resolved by [`StateReader::take_ref`].
//! Everything else is written with the fixed-width primitives below.

use crate::error::{CoreError, CoreResult};
use crate::persistent::{ErasedObject, ObjectManager, Persistent, PersistentState};
use crate::types::Oid;
use std::collections::HashMap;
use std::rc::Rc;

/// A serialized persistent object: OID, opaque state, outgoing references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    oid: Oid,
    state: Vec<u8>,
    refs: Vec<Oid>,
}

impl Record {
    /// Assembles a record from its parts.
    #[must_use]
    pub fn new(oid: Oid, state: Vec<u8>, refs: Vec<Oid>) -> Self {
        Self { oid, state, refs }
    }

    /// The OID this record belongs to.
    #[must_use]
    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// The opaque state payload.
    #[must_use]
    pub fn state(&self) -> &[u8] {
        &self.state
    }

    /// The OIDs this record's state references.
    #[must_use]
    pub fn refs(&self) -> &[Oid] {
        &self.refs
    }

    /// The size of the encoded form in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        8 + 4 + self.state.len() + 4 + 8 * self.refs.len()
    }

    /// Encodes the record into its wire and on-disk form.
    ///
    /// # Errors
    ///
    /// Fails if the state or reference list exceeds the u32 length
    /// fields.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let state_len = u32::try_from(self.state.len())
            .map_err(|_| CoreError::invalid_operation("record state exceeds 4 GiB"))?;
        let ref_count = u32::try_from(self.refs.len())
            .map_err(|_| CoreError::invalid_operation("record reference list too long"))?;
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.oid.as_u64().to_be_bytes());
        out.extend_from_slice(&state_len.to_be_bytes());
        out.extend_from_slice(&self.state);
        out.extend_from_slice(&ref_count.to_be_bytes());
        for r in &self.refs {
            out.extend_from_slice(&r.as_u64().to_be_bytes());
        }
        Ok(out)
    }

    /// Decodes a record, validating that `bytes` is exactly one record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptRecord`] on truncation or trailing
    /// garbage.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let mut cur = Cursor::new(bytes);
        let oid = Oid::new(cur.take_u64()?);
        let state_len = cur.take_u32()? as usize;
        let state = cur.take_exact(state_len)?.to_vec();
        let refs = Self::decode_refs(&mut cur)?;
        cur.expect_end()?;
        Ok(Self { oid, state, refs })
    }

    /// Extracts just the OID from an encoded record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptRecord`] if the header is truncated.
    pub fn peek_oid(bytes: &[u8]) -> CoreResult<Oid> {
        let mut cur = Cursor::new(bytes);
        Ok(Oid::new(cur.take_u64()?))
    }

    /// Extracts the reference list without copying or decoding the state.
    ///
    /// This is the packer's view of a record: enough to mark reachable
    /// OIDs, nothing more.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptRecord`] on any framing damage.
    pub fn refs_of(bytes: &[u8]) -> CoreResult<Vec<Oid>> {
        let mut cur = Cursor::new(bytes);
        cur.take_u64()?;
        let state_len = cur.take_u32()? as usize;
        cur.take_exact(state_len)?;
        let refs = Self::decode_refs(&mut cur)?;
        cur.expect_end()?;
        Ok(refs)
    }

    fn decode_refs(cur: &mut Cursor<'_>) -> CoreResult<Vec<Oid>> {
        let ref_count = cur.take_u32()? as usize;
        if ref_count.checked_mul(8).is_none_or(|n| n > cur.remaining()) {
            return Err(CoreError::corrupt("record reference count overruns record"));
        }
        let mut refs = Vec::with_capacity(ref_count);
        for _ in 0..ref_count {
            refs.push(Oid::new(cur.take_u64()?));
        }
        Ok(refs)
    }
}

/// Bounds-checked read cursor over a byte slice.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take_exact(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(CoreError::corrupt(format!(
                "unexpected end of record: need {len} bytes at offset {}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take_exact(N)?);
        Ok(out)
    }

    fn take_u8(&mut self) -> CoreResult<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    fn take_u32(&mut self) -> CoreResult<u32> {
        Ok(u32::from_be_bytes(self.take_array::<4>()?))
    }

    fn take_u64(&mut self) -> CoreResult<u64> {
        Ok(u64::from_be_bytes(self.take_array::<8>()?))
    }

    fn expect_end(&self) -> CoreResult<()> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(CoreError::corrupt(format!(
                "{} trailing bytes after record",
                self.remaining()
            )))
        }
    }
}

/// Write cursor used by [`PersistentState::store_state`].
///
/// Accumulates the state payload and the reference list side by side.
/// When a reference reaches an object that has never been committed,
/// the writer assigns it a fresh OID through the owning connection and
/// reports it back so the commit can serialize it too.
pub struct StateWriter<'a> {
    buf: Vec<u8>,
    refs: Vec<Oid>,
    seen: HashMap<Oid, u32>,
    manager: &'a dyn ObjectManager,
    discovered: Vec<Rc<dyn ErasedObject>>,
}

impl<'a> StateWriter<'a> {
    pub(crate) fn new(manager: &'a dyn ObjectManager) -> Self {
        Self {
            buf: Vec::new(),
            refs: Vec::new(),
            seen: HashMap::new(),
            manager,
            discovered: Vec::new(),
        }
    }

    /// Appends a single byte.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Appends a big-endian u32.
    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a big-endian u64.
    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a big-endian two's-complement i64.
    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a bool as one byte, 0 or 1.
    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    /// Appends a length-prefixed byte string.
    ///
    /// # Errors
    ///
    /// Fails if `bytes` exceeds the u32 length prefix.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> CoreResult<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| CoreError::invalid_operation("byte string exceeds 4 GiB"))?;
        self.put_u32(len);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Appends a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// Fails if `s` exceeds the u32 length prefix.
    pub fn put_str(&mut self, s: &str) -> CoreResult<()> {
        self.put_bytes(s.as_bytes())
    }

    /// Appends a reference to another persistent object.
    ///
    /// The reference is written as an index into the record's reference
    /// list; repeated references to the same object share one entry. If
    /// the target has never been committed it is assigned a fresh OID
    /// here and queued for serialization in the same commit.
    ///
    /// # Errors
    ///
    /// Fails if OID allocation fails or the reference list overflows.
    pub fn put_ref<T: PersistentState>(&mut self, handle: &Persistent<T>) -> CoreResult<()> {
        let erased = handle.erased();
        let oid = match erased.meta().oid() {
            Some(oid) => oid,
            None => {
                let oid = self.manager.allocate_oid()?;
                erased.meta().set_oid(oid);
                self.manager.adopt(oid, Rc::clone(&erased));
                self.discovered.push(erased);
                oid
            }
        };
        let index = match self.seen.get(&oid) {
            Some(&i) => i,
            None => {
                let i = u32::try_from(self.refs.len()).map_err(|_| {
                    CoreError::invalid_operation("too many references in one record")
                })?;
                self.refs.push(oid);
                self.seen.insert(oid, i);
                i
            }
        };
        self.put_u32(index);
        Ok(())
    }

    /// Finalizes into a record for `oid`, yielding any objects first
    /// reached while writing.
    pub(crate) fn finish(self, oid: Oid) -> (Record, Vec<Rc<dyn ErasedObject>>) {
        (Record::new(oid, self.buf, self.refs), self.discovered)
    }
}

/// Read cursor used by [`PersistentState::load_state`].
///
/// Walks the state payload of one record; reference tokens resolve
/// through the owning connection so that an already-cached object is
/// returned as the same handle, preserving identity.
pub struct StateReader<'a> {
    cur: Cursor<'a>,
    refs: &'a [Oid],
    manager: &'a dyn ObjectManager,
}

impl<'a> StateReader<'a> {
    pub(crate) fn new(record: &'a Record, manager: &'a dyn ObjectManager) -> Self {
        Self {
            cur: Cursor::new(record.state()),
            refs: record.refs(),
            manager,
        }
    }

    /// Reads a single byte.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptRecord`] on overrun.
    pub fn take_u8(&mut self) -> CoreResult<u8> {
        self.cur.take_u8()
    }

    /// Reads a big-endian u32.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptRecord`] on overrun.
    pub fn take_u32(&mut self) -> CoreResult<u32> {
        self.cur.take_u32()
    }

    /// Reads a big-endian u64.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptRecord`] on overrun.
    pub fn take_u64(&mut self) -> CoreResult<u64> {
        self.cur.take_u64()
    }

    /// Reads a big-endian two's-complement i64.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptRecord`] on overrun.
    pub fn take_i64(&mut self) -> CoreResult<i64> {
        Ok(i64::from_be_bytes(self.cur.take_array::<8>()?))
    }

    /// Reads a bool.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptRecord`] on overrun or a byte other
    /// than 0 or 1.
    pub fn take_bool(&mut self) -> CoreResult<bool> {
        match self.cur.take_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CoreError::corrupt(format!("invalid bool byte {other:#04x}"))),
        }
    }

    /// Reads a length-prefixed byte string, borrowed from the record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptRecord`] on overrun.
    pub fn take_bytes(&mut self) -> CoreResult<&'a [u8]> {
        let len = self.cur.take_u32()? as usize;
        self.cur.take_exact(len)
    }

    /// Reads a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptRecord`] on overrun or invalid UTF-8.
    pub fn take_str(&mut self) -> CoreResult<String> {
        let bytes = self.take_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CoreError::corrupt("string payload is not valid UTF-8"))
    }

    /// Resolves a reference token to a typed handle.
    ///
    /// Returns the cached object if the connection already holds one
    /// for that OID, otherwise creates a ghost and caches it. Loading
    /// the same OID twice therefore yields the same handle.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptRecord`] for an out-of-range token
    /// and [`CoreError::TypeMismatch`] if the cached object has a
    /// different state type.
    pub fn take_ref<T: PersistentState>(&mut self) -> CoreResult<Persistent<T>> {
        let index = self.cur.take_u32()? as usize;
        let oid = *self
            .refs
            .get(index)
            .ok_or_else(|| CoreError::corrupt(format!("reference token {index} out of range")))?;
        match self.manager.lookup(oid) {
            Some(existing) => {
                Persistent::from_erased(existing).ok_or(CoreError::TypeMismatch { oid })
            }
            None => {
                let handle = Persistent::<T>::new_ghost(oid);
                self.manager.adopt(oid, handle.erased());
                Ok(handle)
            }
        }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.cur.remaining()
    }

    pub(crate) fn expect_end(&self) -> CoreResult<()> {
        if self.cur.remaining() == 0 {
            Ok(())
        } else {
            Err(CoreError::corrupt(format!(
                "{} unread bytes after state",
                self.cur.remaining()
            )))
        }
    }
}

/// Values encodable into a state payload.
///
/// Provided for the primitives the built-in containers are made of;
/// state types usually implement [`PersistentState`] directly and call
/// the cursor methods themselves.
pub trait Encode {
    /// Writes `self` to the cursor.
    ///
    /// # Errors
    ///
    /// Propagates writer failures such as reference-list overflow.
    fn encode(&self, w: &mut StateWriter<'_>) -> CoreResult<()>;
}

/// Values decodable from a state payload.
pub trait Decode: Sized {
    /// Reads one value from the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptRecord`] on malformed input.
    fn decode(r: &mut StateReader<'_>) -> CoreResult<Self>;
}

impl Encode for u8 {
    fn encode(&self, w: &mut StateWriter<'_>) -> CoreResult<()> {
        w.put_u8(*self);
        Ok(())
    }
}

impl Decode for u8 {
    fn decode(r: &mut StateReader<'_>) -> CoreResult<Self> {
        r.take_u8()
    }
}

impl Encode for u32 {
    fn encode(&self, w: &mut StateWriter<'_>) -> CoreResult<()> {
        w.put_u32(*self);
        Ok(())
    }
}

impl Decode for u32 {
    fn decode(r: &mut StateReader<'_>) -> CoreResult<Self> {
        r.take_u32()
    }
}

impl Encode for u64 {
    fn encode(&self, w: &mut StateWriter<'_>) -> CoreResult<()> {
        w.put_u64(*self);
        Ok(())
    }
}

impl Decode for u64 {
    fn decode(r: &mut StateReader<'_>) -> CoreResult<Self> {
        r.take_u64()
    }
}

impl Encode for i64 {
    fn encode(&self, w: &mut StateWriter<'_>) -> CoreResult<()> {
        w.put_i64(*self);
        Ok(())
    }
}

impl Decode for i64 {
    fn decode(r: &mut StateReader<'_>) -> CoreResult<Self> {
        r.take_i64()
    }
}

impl Encode for bool {
    fn encode(&self, w: &mut StateWriter<'_>) -> CoreResult<()> {
        w.put_bool(*self);
        Ok(())
    }
}

impl Decode for bool {
    fn decode(r: &mut StateReader<'_>) -> CoreResult<Self> {
        r.take_bool()
    }
}

impl Encode for String {
    fn encode(&self, w: &mut StateWriter<'_>) -> CoreResult<()> {
        w.put_str(self)
    }
}

impl Decode for String {
    fn decode(r: &mut StateReader<'_>) -> CoreResult<Self> {
        r.take_str()
    }
}

impl Encode for Oid {
    fn encode(&self, w: &mut StateWriter<'_>) -> CoreResult<()> {
        w.put_u64(self.as_u64());
        Ok(())
    }
}

impl Decode for Oid {
    fn decode(r: &mut StateReader<'_>) -> CoreResult<Self> {
        Ok(Oid::new(r.take_u64()?))
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, w: &mut StateWriter<'_>) -> CoreResult<()> {
        let len = u32::try_from(self.len())
            .map_err(|_| CoreError::invalid_operation("container exceeds u32 length"))?;
        w.put_u32(len);
        for item in self {
            item.encode(w)?;
        }
        Ok(())
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(r: &mut StateReader<'_>) -> CoreResult<Self> {
        let count = r.take_u32()? as usize;
        // Every element occupies at least one byte, so a count beyond
        // the remaining payload is framing damage, not a request to
        // allocate.
        if count > r.remaining() {
            return Err(CoreError::corrupt(format!(
                "container count {count} overruns state payload"
            )));
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(T::decode(r)?);
        }
        Ok(out)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, w: &mut StateWriter<'_>) -> CoreResult<()> {
        match self {
            None => {
                w.put_bool(false);
                Ok(())
            }
            Some(v) => {
                w.put_bool(true);
                v.encode(w)
            }
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(r: &mut StateReader<'_>) -> CoreResult<Self> {
        if r.take_bool()? {
            Ok(Some(T::decode(r)?))
        } else {
            Ok(None)
        }
    }
}

impl<A: Encode, B: Encode> Encode for (A, B) {
    fn encode(&self, w: &mut StateWriter<'_>) -> CoreResult<()> {
        self.0.encode(w)?;
        self.1.encode(w)
    }
}

impl<A: Decode, B: Decode> Decode for (A, B) {
    fn decode(r: &mut StateReader<'_>) -> CoreResult<Self> {
        Ok((A::decode(r)?, B::decode(r)?))
    }
}

impl<T: PersistentState> Encode for Persistent<T> {
    fn encode(&self, w: &mut StateWriter<'_>) -> CoreResult<()> {
        w.put_ref(self)
    }
}

impl<T: PersistentState> Decode for Persistent<T> {
    fn decode(r: &mut StateReader<'_>) -> CoreResult<Self> {
        r.take_ref()
    }
}
