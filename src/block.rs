//! Block codec (spec.md §4.3) and the internal-key model (§3) it operates on.
//!
//! A block is a sequence of shared-prefix-compressed records followed by
//! a restart-point array and a trailing `u32` restart count:
//!
//! ```text
//! record₁ record₂ … recordₙ  [restart₀ restart₁ … restartₖ] [u32 restart_count]
//! ```
//!
//! Each record is `<shared:varint32> <non_shared:varint32> <value_len:varint32>
//! <key_delta:bytes> <value:bytes>`, except index-value-delta-encoded index
//! blocks (format ≥ 4), where the value is a raw two-varint [`BlockHandle`]
//! and no `value_len` is stored — see [`IndexBlockIterator`].

use std::cmp::Ordering;

/// Numeric value-type tag stored in an internal key's trailer. Values are
/// fixed by the on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ValueType {
    /// A regular value.
    Value = 1,
    /// A point deletion.
    Deletion = 0,
    /// A merge operand (protocol not specified by this crate; see `DESIGN.md`).
    Merge = 2,
    /// A single-delete (point delete that may only cancel exactly one put).
    SingleDeletion = 7,
    /// A range-deletion tombstone; only appears in the range-deletion block,
    /// where the "user key" is the tombstone's start key.
    RangeDeletion = 15,
    /// Any value not covered above; round-tripped verbatim.
    Other(u8),
}

impl ValueType {
    /// Numeric wire value.
    pub fn as_u8(self) -> u8 {
        match self {
            ValueType::Deletion => 0,
            ValueType::Value => 1,
            ValueType::Merge => 2,
            ValueType::SingleDeletion => 7,
            ValueType::RangeDeletion => 15,
            ValueType::Other(b) => b,
        }
    }

    /// Decode a numeric wire value.
    pub fn from_u8(b: u8) -> ValueType {
        match b {
            0 => ValueType::Deletion,
            1 => ValueType::Value,
            2 => ValueType::Merge,
            7 => ValueType::SingleDeletion,
            15 => ValueType::RangeDeletion,
            other => ValueType::Other(other),
        }
    }
}

/// Trailer size appended to every user key to form an internal key:
/// 7 bytes of sequence number plus 1 byte of value type, packed as
/// `(sequence << 8) | value_type` in a little-endian `u64`.
pub const TRAILER_LEN: usize = 8;

/// Pack `(sequence, value_type)` into the 8-byte little-endian trailer.
pub fn pack_trailer(sequence: u64, value_type: ValueType) -> [u8; TRAILER_LEN] {
    let word = (sequence << 8) | u64::from(value_type.as_u8());
    word.to_le_bytes()
}

/// Unpack an 8-byte trailer into `(sequence, value_type)`.
pub fn unpack_trailer(trailer: [u8; TRAILER_LEN]) -> (u64, ValueType) {
    let word = u64::from_le_bytes(trailer);
    let sequence = word >> 8;
    let value_type = ValueType::from_u8((word & 0xFF) as u8);
    (sequence, value_type)
}

/// A user key extended with an 8-byte trailer: `user_key ‖ (sequence, value_type)`.
///
/// Internal-key order: user-key ascending, then sequence descending
/// (newer first), then value-type descending as a final tie-break.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    bytes: Vec<u8>,
}

impl InternalKey {
    /// Build an internal key from its parts.
    pub fn new(user_key: &[u8], sequence: u64, value_type: ValueType) -> Self {
        let mut bytes = Vec::with_capacity(user_key.len() + TRAILER_LEN);
        bytes.extend_from_slice(user_key);
        bytes.extend_from_slice(&pack_trailer(sequence, value_type));
        Self { bytes }
    }

    /// Wrap an already-encoded `user_key ‖ trailer` byte sequence.
    ///
    /// Returns `None` if `bytes` is shorter than [`TRAILER_LEN`].
    pub fn from_encoded(bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() < TRAILER_LEN {
            return None;
        }
        Some(Self { bytes })
    }

    /// The full encoded `user_key ‖ trailer` byte sequence.
    pub fn encoded(&self) -> &[u8] {
        &self.bytes
    }

    /// The user-key portion (trailer stripped).
    pub fn user_key(&self) -> &[u8] {
        &self.bytes[..self.bytes.len() - TRAILER_LEN]
    }

    /// The sequence number stored in the trailer.
    pub fn sequence(&self) -> u64 {
        self.trailer_parts().0
    }

    /// The value type stored in the trailer.
    pub fn value_type(&self) -> ValueType {
        self.trailer_parts().1
    }

    fn trailer_parts(&self) -> (u64, ValueType) {
        let n = self.bytes.len();
        let mut trailer = [0u8; TRAILER_LEN];
        trailer.copy_from_slice(&self.bytes[n - TRAILER_LEN..]);
        unpack_trailer(trailer)
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_internal_keys(&self.bytes, &other.bytes)
    }
}

/// Compare two already-encoded internal keys (`user_key ‖ trailer`) per
/// the internal-key order: user-key ascending, sequence descending,
/// value-type descending.
///
/// Keys shorter than [`TRAILER_LEN`] are compared as plain byte strings
/// (defensive — well-formed blocks never contain such a key).
pub fn compare_internal_keys(a: &[u8], b: &[u8]) -> Ordering {
    if a.len() < TRAILER_LEN || b.len() < TRAILER_LEN {
        return a.cmp(b);
    }
    let (a_user, a_trailer) = a.split_at(a.len() - TRAILER_LEN);
    let (b_user, b_trailer) = b.split_at(b.len() - TRAILER_LEN);
    a_user.cmp(b_user).then_with(|| {
        // Trailers compare as little-endian u64; descending order means
        // the *larger* packed word sorts first, so reverse the byte
        // comparison by comparing the decoded words in reverse.
        let aw = u64::from_le_bytes(a_trailer.try_into().unwrap_or([0; 8]));
        let bw = u64::from_le_bytes(b_trailer.try_into().unwrap_or([0; 8]));
        bw.cmp(&aw)
    })
}

// ------------------------------------------------------------------------------------------------
// Varint helpers
// ------------------------------------------------------------------------------------------------

/// Append `v` to `buf` as a base-128 varint (LSB-first, MSB continuation bit).
pub fn put_varint32(buf: &mut Vec<u8>, v: u32) {
    put_varint64(buf, u64::from(v));
}

/// Append `v` to `buf` as a base-128 varint.
pub fn put_varint64(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        if v < 0x80 {
            buf.push(v as u8);
            return;
        }
        buf.push((v as u8 & 0x7F) | 0x80);
        v >>= 7;
    }
}

/// Decode a varint32 from the start of `buf`, returning `(value, bytes_consumed)`.
pub fn get_varint32(buf: &[u8]) -> Option<(u32, usize)> {
    get_varint64(buf).and_then(|(v, n)| u32::try_from(v).ok().map(|v| (v, n)))
}

/// Decode a varint64 from the start of `buf`, returning `(value, bytes_consumed)`.
pub fn get_varint64(buf: &[u8]) -> Option<(u64, usize)> {
    let mut result: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= 10 {
            return None; // malformed: too long for a 64-bit varint
        }
        result |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((result, i + 1));
        }
    }
    None // truncated
}

// ------------------------------------------------------------------------------------------------
// BlockHandle
// ------------------------------------------------------------------------------------------------

/// Pointer to a block within an SST file: `<offset:varint64> <size:varint64>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    /// Byte offset of the block within the file.
    pub offset: u64,
    /// Size of the block, excluding its trailer.
    pub size: u64,
}

impl BlockHandle {
    /// The `(0, 0)` handle, used where the spec calls for a NULL handle.
    pub const NULL: BlockHandle = BlockHandle { offset: 0, size: 0 };

    /// Whether this is the NULL handle.
    pub fn is_null(&self) -> bool {
        self.offset == 0 && self.size == 0
    }

    /// Encode as two varint64s.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        put_varint64(buf, self.offset);
        put_varint64(buf, self.size);
    }

    /// Decode two varint64s from the start of `buf`.
    pub fn decode_from(buf: &[u8]) -> Option<(Self, usize)> {
        let (offset, n1) = get_varint64(buf)?;
        let (size, n2) = get_varint64(&buf[n1..])?;
        Some((Self { offset, size }, n1 + n2))
    }
}

// ------------------------------------------------------------------------------------------------
// BlockBuilder
// ------------------------------------------------------------------------------------------------

/// Accumulates key/value records into a single block with restart-point
/// prefix compression.
pub struct BlockBuilder {
    restart_interval: usize,
    buf: Vec<u8>,
    restarts: Vec<u32>,
    counter: usize,
    last_key: Vec<u8>,
    finished: bool,
}

impl BlockBuilder {
    /// Create a builder that emits a restart point every `restart_interval`
    /// records (the first record is always a restart point).
    pub fn new(restart_interval: usize) -> Self {
        Self {
            restart_interval: restart_interval.max(1),
            buf: Vec::new(),
            restarts: vec![0],
            counter: 0,
            last_key: Vec::new(),
            finished: false,
        }
    }

    /// Number of bytes accumulated so far (an estimate of the eventual
    /// block size, used by the table builder to decide when to flush).
    pub fn current_size_estimate(&self) -> usize {
        self.buf.len() + self.restarts.len() * 4 + 4
    }

    /// Whether any records have been added since the last reset.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append one key/value record. Keys must be added in ascending order
    /// (callers — the table builder — are responsible for this; the block
    /// codec itself does not re-validate it).
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        assert!(!self.finished, "BlockBuilder::add after finish");

        let shared = if self.counter < self.restart_interval {
            shared_prefix_len(&self.last_key, key)
        } else {
            0
        };

        if self.counter >= self.restart_interval {
            self.restarts.push(self.buf.len() as u32);
            self.counter = 0;
        }

        let non_shared = key.len() - shared;
        put_varint32(&mut self.buf, shared as u32);
        put_varint32(&mut self.buf, non_shared as u32);
        put_varint32(&mut self.buf, value.len() as u32);
        self.buf.extend_from_slice(&key[shared..]);
        self.buf.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Finish the block: records ‖ restart array ‖ u32 restart count.
    pub fn finish(mut self) -> Vec<u8> {
        self.finished = true;
        for &r in &self.restarts {
            self.buf.extend_from_slice(&r.to_le_bytes());
        }
        self.buf
            .extend_from_slice(&(self.restarts.len() as u32).to_le_bytes());
        self.buf
    }

    /// Reset the builder to an empty state, reusing its allocation.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
        self.finished = false;
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Builds a value-delta-encoded index block: like [`BlockBuilder`] but each
/// record's value is a raw two-varint [`BlockHandle`] with no explicit
/// value length, matching what [`IndexBlockIterator`] expects.
pub struct IndexBlockBuilder {
    restart_interval: usize,
    buf: Vec<u8>,
    restarts: Vec<u32>,
    counter: usize,
    last_key: Vec<u8>,
}

impl IndexBlockBuilder {
    /// Create a builder with the given restart interval.
    pub fn new(restart_interval: usize) -> Self {
        Self {
            restart_interval: restart_interval.max(1),
            buf: Vec::new(),
            restarts: vec![0],
            counter: 0,
            last_key: Vec::new(),
        }
    }

    /// Add one `(separator_key, handle)` entry.
    pub fn add(&mut self, key: &[u8], handle: BlockHandle) {
        let shared = if self.counter < self.restart_interval {
            shared_prefix_len(&self.last_key, key)
        } else {
            0
        };
        if self.counter >= self.restart_interval {
            self.restarts.push(self.buf.len() as u32);
            self.counter = 0;
        }
        let non_shared = key.len() - shared;
        put_varint32(&mut self.buf, shared as u32);
        put_varint32(&mut self.buf, non_shared as u32);
        self.buf.extend_from_slice(&key[shared..]);
        handle.encode_to(&mut self.buf);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Whether any entries have been added.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish the block: records ‖ restart array ‖ u32 restart count.
    pub fn finish(mut self) -> Vec<u8> {
        for &r in &self.restarts {
            self.buf.extend_from_slice(&r.to_le_bytes());
        }
        self.buf
            .extend_from_slice(&(self.restarts.len() as u32).to_le_bytes());
        self.buf
    }
}

// ------------------------------------------------------------------------------------------------
// BlockIterator (standard records, with value_len)
// ------------------------------------------------------------------------------------------------

/// Read-only view over a finished block's restart array.
fn restart_count(data: &[u8]) -> usize {
    if data.len() < 4 {
        return 0;
    }
    u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap_or([0; 4])) as usize
}

fn restart_offset(data: &[u8], restarts_end: usize, i: usize) -> u32 {
    let pos = restarts_end - 4 * (i + 1);
    u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap_or([0; 4]))
}

/// Iterator over a standard (non index-value-delta) block's records.
///
/// Supports `seek_to_first`/`seek_to_last`/`seek`/`next`/`prev`.
/// Invalid state is sticky until the next successful seek.
pub struct BlockIterator<'a> {
    data: &'a [u8],
    restarts_end: usize,
    num_restarts: usize,
    /// Byte offset just past the current record (= start of the next
    /// record), or `restarts_end` if invalid.
    current: usize,
    /// Byte offset where the current record begins, or `restarts_end` if
    /// invalid. Needed by `prev()`, which must locate the restart point
    /// strictly before the *start* of the current record, not its end.
    record_start: usize,
    key: Vec<u8>,
    value: (usize, usize),
    valid: bool,
}

impl<'a> BlockIterator<'a> {
    /// Wrap a finished block's raw bytes.
    pub fn new(data: &'a [u8]) -> Self {
        let num_restarts = restart_count(data);
        let restarts_end = data.len().saturating_sub(4 + 4 * num_restarts);
        Self {
            data,
            restarts_end,
            num_restarts,
            current: restarts_end,
            record_start: restarts_end,
            key: Vec::new(),
            value: (0, 0),
            valid: false,
        }
    }

    /// Whether the iterator currently sits on a valid record.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// The current record's fully-reconstructed key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The current record's value bytes.
    pub fn value(&self) -> &[u8] {
        let (start, end) = self.value;
        &self.data[start..end]
    }

    /// Position at the first record in the block.
    pub fn seek_to_first(&mut self) {
        self.seek_to_restart(0);
        self.advance_until(|_| true);
    }

    /// Position at the last record in the block.
    pub fn seek_to_last(&mut self) {
        if self.num_restarts == 0 {
            self.invalidate();
            return;
        }
        self.seek_to_restart(self.num_restarts - 1);
        let mut last_valid = self.valid;
        let mut last_key = self.key.clone();
        let mut last_value = self.value;
        let mut last_current = self.current;
        let mut last_record_start = self.record_start;
        while self.valid {
            last_valid = self.valid;
            last_key = self.key.clone();
            last_value = self.value;
            last_current = self.current;
            last_record_start = self.record_start;
            self.step();
        }
        self.valid = last_valid;
        self.key = last_key;
        self.value = last_value;
        self.current = last_current;
        self.record_start = last_record_start;
    }

    /// Position at the first record whose key is ≥ `target` (by
    /// [`compare_internal_keys`]). Binary-searches the restart array,
    /// then scans linearly from the located restart point.
    pub fn seek(&mut self, target: &[u8]) {
        if self.num_restarts == 0 {
            self.invalidate();
            return;
        }
        let mut left = 0usize;
        let mut right = self.num_restarts - 1;
        while left < right {
            let mid = left.div_ceil(2) + right / 2 - left / 2; // avoid overflow; mid in (left, right]
            let mid = mid.min(right).max(left + 1);
            self.seek_to_restart(mid);
            if self.valid && compare_internal_keys(&self.key, target) == Ordering::Less {
                left = mid;
            } else {
                right = mid - 1;
            }
        }
        self.seek_to_restart(left);
        self.advance_until(|k| compare_internal_keys(k, target) != Ordering::Less);
    }

    /// Advance to the next record.
    pub fn next(&mut self) {
        if !self.valid {
            return;
        }
        self.step();
    }

    /// Move to the previous record (rescans forward from the preceding
    /// restart point, per the standard block-iterator algorithm).
    pub fn prev(&mut self) {
        if !self.valid {
            return;
        }
        let original = self.record_start;
        // Find the restart point at or before `original`.
        let mut restart_idx = self.num_restarts;
        for i in 0..self.num_restarts {
            if restart_offset(self.data, self.restarts_end, i) as usize >= original {
                restart_idx = i;
                break;
            }
        }
        if restart_idx == 0 {
            self.invalidate();
            return;
        }
        self.seek_to_restart(restart_idx - 1);
        let mut last_key = self.key.clone();
        let mut last_value = self.value;
        let mut last_valid = self.valid;
        let mut last_current = self.current;
        let mut last_record_start = self.record_start;
        while self.valid && self.record_start < original {
            last_key = self.key.clone();
            last_value = self.value;
            last_valid = self.valid;
            last_current = self.current;
            last_record_start = self.record_start;
            self.step();
        }
        self.valid = last_valid;
        self.key = last_key;
        self.value = last_value;
        self.current = last_current;
        self.record_start = last_record_start;
    }

    fn seek_to_restart(&mut self, i: usize) {
        let offset = restart_offset(self.data, self.restarts_end, i) as usize;
        self.current = offset;
        self.key.clear();
        self.parse_current();
    }

    fn advance_until(&mut self, pred: impl Fn(&[u8]) -> bool) {
        while self.valid && !pred(&self.key) {
            self.step();
        }
    }

    fn step(&mut self) {
        let prev_key = std::mem::take(&mut self.key);
        self.key = prev_key;
        self.parse_current();
    }

    fn parse_current(&mut self) {
        let start = self.current;
        if self.current >= self.restarts_end {
            self.invalidate();
            return;
        }
        let rest = &self.data[self.current..self.restarts_end];
        let (shared, n1) = match get_varint32(rest) {
            Some(v) => v,
            None => return self.invalidate(),
        };
        let (non_shared, n2) = match get_varint32(&rest[n1..]) {
            Some(v) => v,
            None => return self.invalidate(),
        };
        let (value_len, n3) = match get_varint32(&rest[n1 + n2..]) {
            Some(v) => v,
            None => return self.invalidate(),
        };
        let header_len = n1 + n2 + n3;
        let key_delta_start = self.current + header_len;
        let key_delta_end = key_delta_start + non_shared as usize;
        let value_start = key_delta_end;
        let value_end = value_start + value_len as usize;
        if value_end > self.restarts_end {
            return self.invalidate();
        }

        let shared = shared as usize;
        if shared > self.key.len() {
            return self.invalidate();
        }
        self.key.truncate(shared);
        self.key
            .extend_from_slice(&self.data[key_delta_start..key_delta_end]);
        self.value = (value_start, value_end);
        self.record_start = start;
        self.current = value_end;
        self.valid = true;
    }

    fn invalidate(&mut self) {
        self.valid = false;
        self.current = self.restarts_end;
        self.record_start = self.restarts_end;
    }
}

// ------------------------------------------------------------------------------------------------
// Index-value-delta-encoded block iterator (format >= 4)
// ------------------------------------------------------------------------------------------------

/// Iterator over an index block whose values are raw two-varint
/// [`BlockHandle`]s with no explicit value length (format ≥ 4).
pub struct IndexBlockIterator<'a> {
    data: &'a [u8],
    restarts_end: usize,
    num_restarts: usize,
    current: usize,
    /// Byte offset where the current entry begins; mirrors
    /// [`BlockIterator::record_start`] and exists for the same reason —
    /// `prev()` needs the start, not the end, of the current entry.
    record_start: usize,
    key: Vec<u8>,
    handle: BlockHandle,
    valid: bool,
}

impl<'a> IndexBlockIterator<'a> {
    /// Wrap a finished value-delta-encoded index block's raw bytes.
    pub fn new(data: &'a [u8]) -> Self {
        let num_restarts = restart_count(data);
        let restarts_end = data.len().saturating_sub(4 + 4 * num_restarts);
        Self {
            data,
            restarts_end,
            num_restarts,
            current: restarts_end,
            record_start: restarts_end,
            key: Vec::new(),
            handle: BlockHandle::NULL,
            valid: false,
        }
    }

    /// Detect whether `data` looks like a value-delta-encoded index block:
    /// trial-parse the first entry and validate the produced handle
    /// against `file_size` (offset+size ≤ file_size, size > 0, size <
    /// file_size/2), per spec.md §4.3.
    pub fn looks_like_value_delta(data: &[u8], file_size: u64) -> bool {
        let num_restarts = restart_count(data);
        if num_restarts == 0 {
            return false;
        }
        let restarts_end = data.len().saturating_sub(4 + 4 * num_restarts);
        if restarts_end == 0 {
            return false;
        }
        let rest = &data[..restarts_end];
        let Some((shared, n1)) = get_varint32(rest) else {
            return false;
        };
        if shared != 0 {
            return false; // first record must have shared == 0
        }
        let Some((non_shared, n2)) = get_varint32(&rest[n1..]) else {
            return false;
        };
        let key_start = n1 + n2;
        let key_end = key_start + non_shared as usize;
        if key_end > rest.len() {
            return false;
        }
        let Some((handle, _)) = BlockHandle::decode_from(&rest[key_end..]) else {
            return false;
        };
        handle.size > 0
            && handle.size < file_size / 2
            && handle.offset.saturating_add(handle.size) <= file_size
    }

    /// Whether the iterator currently sits on a valid entry.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// The current entry's fully-reconstructed key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The current entry's decoded block handle.
    pub fn handle(&self) -> BlockHandle {
        self.handle
    }

    /// Position at the first entry.
    pub fn seek_to_first(&mut self) {
        self.current = 0;
        self.key.clear();
        self.parse_current();
    }

    /// Position at the last entry.
    pub fn seek_to_last(&mut self) {
        self.seek_to_first();
        let mut last_valid = self.valid;
        let mut last_key = self.key.clone();
        let mut last_handle = self.handle;
        let mut last_current = self.current;
        let mut last_record_start = self.record_start;
        while self.valid {
            last_valid = self.valid;
            last_key = self.key.clone();
            last_handle = self.handle;
            last_current = self.current;
            last_record_start = self.record_start;
            self.next();
        }
        self.valid = last_valid;
        self.key = last_key;
        self.handle = last_handle;
        self.current = last_current;
        self.record_start = last_record_start;
    }

    /// Position at the first entry whose key is ≥ `target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.seek_to_first();
        while self.valid && compare_internal_keys(&self.key, target) == Ordering::Less {
            self.next();
        }
    }

    /// Advance to the next entry.
    pub fn next(&mut self) {
        if !self.valid {
            return;
        }
        self.parse_current();
    }

    /// Move to the previous entry (rescans forward from the block's
    /// start, since the index block has no restart-point array of its
    /// own to binary search).
    pub fn prev(&mut self) {
        if !self.valid {
            return;
        }
        let original = self.record_start;
        if original == 0 {
            self.invalidate();
            return;
        }
        self.seek_to_first();
        let mut last_valid = self.valid;
        let mut last_key = self.key.clone();
        let mut last_handle = self.handle;
        let mut last_current = self.current;
        let mut last_record_start = self.record_start;
        while self.valid && self.record_start < original {
            last_valid = self.valid;
            last_key = self.key.clone();
            last_handle = self.handle;
            last_current = self.current;
            last_record_start = self.record_start;
            self.next();
        }
        self.valid = last_valid;
        self.key = last_key;
        self.handle = last_handle;
        self.current = last_current;
        self.record_start = last_record_start;
    }

    fn parse_current(&mut self) {
        let start = self.current;
        if self.current >= self.restarts_end {
            return self.invalidate();
        }
        let rest = &self.data[self.current..self.restarts_end];
        let Some((shared, n1)) = get_varint32(rest) else {
            return self.invalidate();
        };
        let Some((non_shared, n2)) = get_varint32(&rest[n1..]) else {
            return self.invalidate();
        };
        let header_len = n1 + n2;
        let key_delta_start = self.current + header_len;
        let key_delta_end = key_delta_start + non_shared as usize;
        if key_delta_end > self.restarts_end {
            return self.invalidate();
        }
        let shared = shared as usize;
        if shared > self.key.len() {
            return self.invalidate();
        }
        self.key.truncate(shared);
        self.key
            .extend_from_slice(&self.data[key_delta_start..key_delta_end]);

        let Some((handle, handle_len)) = BlockHandle::decode_from(&self.data[key_delta_end..self.restarts_end]) else {
            return self.invalidate();
        };
        self.handle = handle;
        self.record_start = start;
        self.current = key_delta_end + handle_len;
        self.valid = true;
    }

    fn invalidate(&mut self) {
        self.valid = false;
        self.current = self.restarts_end;
        self.record_start = self.restarts_end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ik(user: &[u8], seq: u64, ty: ValueType) -> Vec<u8> {
        InternalKey::new(user, seq, ty).encoded().to_vec()
    }

    #[test]
    fn internal_key_order_user_key_first() {
        let a = ik(b"a", 10, ValueType::Value);
        let b = ik(b"b", 5, ValueType::Value);
        assert_eq!(compare_internal_keys(&a, &b), Ordering::Less);
    }

    #[test]
    fn internal_key_order_sequence_descending() {
        let newer = ik(b"k", 10, ValueType::Value);
        let older = ik(b"k", 5, ValueType::Value);
        assert_eq!(compare_internal_keys(&newer, &older), Ordering::Less);
    }

    #[test]
    fn internal_key_order_value_type_tiebreak() {
        let del = ik(b"k", 7, ValueType::Deletion);
        let put = ik(b"k", 7, ValueType::Value);
        // Same key, same sequence: value-type descending -> Value(1) before Deletion(0).
        assert_eq!(compare_internal_keys(&put, &del), Ordering::Less);
    }

    #[test]
    fn varint_roundtrip() {
        for v in [0u64, 1, 127, 128, 16384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_varint64(&mut buf, v);
            let (decoded, n) = get_varint64(&buf).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(n, buf.len());
        }
    }

    #[test]
    fn block_handle_roundtrip() {
        let h = BlockHandle { offset: 12345, size: 678 };
        let mut buf = Vec::new();
        h.encode_to(&mut buf);
        let (decoded, n) = BlockHandle::decode_from(&buf).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(n, buf.len());
    }

    fn build_block(entries: &[(Vec<u8>, Vec<u8>)], restart_interval: usize) -> Vec<u8> {
        let mut b = BlockBuilder::new(restart_interval);
        for (k, v) in entries {
            b.add(k, v);
        }
        b.finish()
    }

    #[test]
    fn block_roundtrip_seek_to_first_and_next() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..50)
            .map(|i| (ik(format!("key{i:04}").as_bytes(), 100 - i as u64, ValueType::Value), format!("val{i}").into_bytes()))
            .collect();
        let block = build_block(&entries, 4);
        let mut it = BlockIterator::new(&block);
        it.seek_to_first();
        let mut count = 0;
        let mut last_key: Option<Vec<u8>> = None;
        while it.valid() {
            if let Some(lk) = &last_key {
                assert_eq!(compare_internal_keys(lk, it.key()), Ordering::Less);
            }
            last_key = Some(it.key().to_vec());
            count += 1;
            it.next();
        }
        assert_eq!(count, entries.len());
    }

    #[test]
    fn block_seek_lands_on_least_key_geq_target() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..20)
            .map(|i| (ik(format!("k{i:03}").as_bytes(), 1, ValueType::Value), vec![i as u8]))
            .collect();
        let block = build_block(&entries, 3);
        let target = ik(b"k010", 1, ValueType::Value);
        let mut it = BlockIterator::new(&block);
        it.seek(&target);
        assert!(it.valid());
        assert_eq!(compare_internal_keys(it.key(), &target), Ordering::Greater.then(Ordering::Equal));
    }

    #[test]
    fn block_seek_to_last_and_prev() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..10)
            .map(|i| (ik(format!("k{i}").as_bytes(), 1, ValueType::Value), vec![]))
            .collect();
        let block = build_block(&entries, 2);
        let mut it = BlockIterator::new(&block);
        it.seek_to_last();
        assert!(it.valid());
        assert_eq!(it.key(), entries.last().unwrap().0.as_slice());

        let mut count = 1;
        while it.valid() {
            it.prev();
            if it.valid() {
                count += 1;
            }
        }
        assert_eq!(count, entries.len());
    }

    #[test]
    fn index_block_value_delta_roundtrip() {
        let mut b = BlockBuilder::new(16);
        let handles = [
            BlockHandle { offset: 0, size: 100 },
            BlockHandle { offset: 100, size: 50 },
            BlockHandle { offset: 150, size: 75 },
        ];
        let keys = [b"a".to_vec(), b"m".to_vec(), b"z".to_vec()];
        for (k, h) in keys.iter().zip(handles.iter()) {
            let mut v = Vec::new();
            h.encode_to(&mut v);
            b.add(k, &v);
        }
        let block = b.finish();
        assert!(IndexBlockIterator::looks_like_value_delta(&block, 10_000));

        let mut it = IndexBlockIterator::new(&block);
        it.seek_to_first();
        let mut i = 0;
        while it.valid() {
            assert_eq!(it.key(), keys[i].as_slice());
            assert_eq!(it.handle(), handles[i]);
            it.next();
            i += 1;
        }
        assert_eq!(i, 3);
    }
}
