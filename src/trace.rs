//! Append-only operation trace log and replay.
//!
//! A trace records every mutating (and optionally read) operation the
//! engine performs, tagged with a wall-clock offset, so a workload can
//! later be replayed for debugging or reference-state reconstruction. The
//! on-disk framing mirrors [`crate::wal`]'s append-only, CRC-checked,
//! single-mutex-serialized record log, generalized from recovery-replay
//! semantics (replay into the live engine) to read-only trace-replay
//! semantics (replay into a side reference map, never into the engine
//! itself).
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER: magic(4) version(4) start_time_micros(8) = 16 bytes]
//! [REC_LEN_LE(4)][REC_BYTES][REC_CRC32_LE(4)]
//! [REC_LEN_LE(4)][REC_BYTES][REC_CRC32_LE(4)]
//! ...
//! ```
//!
//! Each record is `[u32 len][type_tag(1) ‖ timestamp_micros(8) ‖ payload][u32 crc32]`,
//! with the CRC computed over `len || type_tag || timestamp_micros || payload`.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Mutex;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, trace, warn};

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Magic constant identifying a trace file (`b"ATRC"`).
const MAGIC: [u8; 4] = *b"ATRC";
/// Current trace format version.
const VERSION: u32 = 1;
/// Encoded header size: `magic(4) + version(4) + start_time_micros(8)`.
const HEADER_SIZE: usize = 16;

/// Errors produced by trace writing or replay.
#[derive(Debug, Error)]
pub enum TraceError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The trace header's magic or version did not match.
    #[error("invalid trace header: {0}")]
    InvalidHeader(String),

    /// A record's CRC32 did not match its stored checksum.
    #[error("checksum mismatch at offset {offset}")]
    ChecksumMismatch {
        /// Byte offset of the corrupted record.
        offset: u64,
    },

    /// The file ended partway through a record.
    #[error("truncated record at offset {offset}")]
    Truncated {
        /// Byte offset where the truncated record begins.
        offset: u64,
    },

    /// Internal invariant violation (poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

/// The kind of operation a [`TraceRecord`] describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceRecordType {
    /// A `put`/`delete` mutation without an explicit sequence number.
    Write {
        /// The key written or deleted.
        key: Vec<u8>,
        /// `Some(value)` for a put, `None` for a delete.
        value: Option<Vec<u8>>,
    },
    /// A mutation carrying the sequence number it was assigned.
    WriteWithSeqno {
        /// The key written or deleted.
        key: Vec<u8>,
        /// `Some(value)` for a put, `None` for a delete.
        value: Option<Vec<u8>>,
        /// The log sequence number assigned to this write.
        seqno: u64,
    },
    /// A point read.
    Get {
        /// The key read.
        key: Vec<u8>,
    },
    /// A scan/iterator seek.
    IterSeek {
        /// The key the iterator was seeked to.
        key: Vec<u8>,
    },
    /// A memtable flush event.
    Flush,
    /// A compaction event.
    Compaction,
    /// A record type this reader does not recognize, preserved verbatim so
    /// newer traces can still be replayed (skipping unknown records) by
    /// older code.
    Unknown {
        /// The raw tag byte that was not recognized.
        tag: u8,
        /// The raw payload bytes following the tag and timestamp.
        payload: Vec<u8>,
    },
}

impl TraceRecordType {
    const TAG_WRITE: u8 = 1;
    const TAG_WRITE_WITH_SEQNO: u8 = 2;
    const TAG_GET: u8 = 3;
    const TAG_ITER_SEEK: u8 = 4;
    const TAG_FLUSH: u8 = 5;
    const TAG_COMPACTION: u8 = 6;

    fn tag(&self) -> u8 {
        match self {
            Self::Write { .. } => Self::TAG_WRITE,
            Self::WriteWithSeqno { .. } => Self::TAG_WRITE_WITH_SEQNO,
            Self::Get { .. } => Self::TAG_GET,
            Self::IterSeek { .. } => Self::TAG_ITER_SEEK,
            Self::Flush => Self::TAG_FLUSH,
            Self::Compaction => Self::TAG_COMPACTION,
            Self::Unknown { tag, .. } => *tag,
        }
    }

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Write { key, value } => encode_key_value(buf, key, value),
            Self::WriteWithSeqno { key, value, seqno } => {
                encode_key_value(buf, key, value);
                buf.extend_from_slice(&seqno.to_le_bytes());
            }
            Self::Get { key } | Self::IterSeek { key } => encode_bytes(buf, key),
            Self::Flush | Self::Compaction => {}
            Self::Unknown { payload, .. } => buf.extend_from_slice(payload),
        }
    }

    fn decode(tag: u8, payload: &[u8]) -> Result<Self, TraceError> {
        let eof = || TraceError::InvalidHeader("record payload truncated".into());
        match tag {
            Self::TAG_WRITE => {
                let (key, value, _) = decode_key_value(payload).ok_or_else(eof)?;
                Ok(Self::Write { key, value })
            }
            Self::TAG_WRITE_WITH_SEQNO => {
                let (key, value, offset) = decode_key_value(payload).ok_or_else(eof)?;
                let seqno_bytes: [u8; 8] = payload.get(offset..offset + 8).and_then(|s| s.try_into().ok()).ok_or_else(eof)?;
                Ok(Self::WriteWithSeqno { key, value, seqno: u64::from_le_bytes(seqno_bytes) })
            }
            Self::TAG_GET => {
                let (key, _) = decode_bytes(payload).ok_or_else(eof)?;
                Ok(Self::Get { key })
            }
            Self::TAG_ITER_SEEK => {
                let (key, _) = decode_bytes(payload).ok_or_else(eof)?;
                Ok(Self::IterSeek { key })
            }
            Self::TAG_FLUSH => Ok(Self::Flush),
            Self::TAG_COMPACTION => Ok(Self::Compaction),
            other => Ok(Self::Unknown { tag: other, payload: payload.to_vec() }),
        }
    }
}

fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn decode_bytes(buf: &[u8]) -> Option<(Vec<u8>, usize)> {
    let len_bytes: [u8; 4] = buf.get(0..4)?.try_into().ok()?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let data = buf.get(4..4 + len)?.to_vec();
    Some((data, 4 + len))
}

fn encode_key_value(buf: &mut Vec<u8>, key: &[u8], value: &Option<Vec<u8>>) {
    encode_bytes(buf, key);
    match value {
        None => buf.push(0),
        Some(v) => {
            buf.push(1);
            encode_bytes(buf, v);
        }
    }
}

fn decode_key_value(buf: &[u8]) -> Option<(Vec<u8>, Option<Vec<u8>>, usize)> {
    let (key, mut offset) = decode_bytes(buf)?;
    let tag = *buf.get(offset)?;
    offset += 1;
    let value = match tag {
        0 => None,
        1 => {
            let (v, n) = decode_bytes(&buf[offset..])?;
            offset += n;
            Some(v)
        }
        _ => return None,
    };
    Some((key, value, offset))
}

/// A single traced operation with its wall-clock offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    /// Microseconds since the trace's `start_time_micros`.
    pub timestamp_micros: u64,
    /// The operation this record describes.
    pub record_type: TraceRecordType,
}

/// Appends [`TraceRecord`]s to a trace file, capping total size at
/// `max_bytes`.
pub struct TraceWriter {
    file: Mutex<File>,
    max_bytes: u64,
    start_time_micros: u64,
    bytes_written: Mutex<u64>,
    truncated: std::sync::atomic::AtomicBool,
    count: std::sync::atomic::AtomicU64,
}

impl TraceWriter {
    /// Creates a new trace file at `path`, truncating any existing file.
    /// `max_bytes` bounds the total size of the trace (header + records);
    /// once reached, further [`Self::append`] calls are silent no-ops and
    /// [`Self::truncated`] returns `true`.
    pub fn create(path: impl AsRef<Path>, max_bytes: u64, start_time_micros: u64) -> Result<Self, TraceError> {
        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.extend_from_slice(&MAGIC);
        header.extend_from_slice(&VERSION.to_le_bytes());
        header.extend_from_slice(&start_time_micros.to_le_bytes());
        file.write_all(&header)?;
        file.sync_all()?;

        debug!(max_bytes, start_time_micros, "trace: writer created");
        Ok(Self {
            file: Mutex::new(file),
            max_bytes,
            start_time_micros,
            bytes_written: Mutex::new(HEADER_SIZE as u64),
            truncated: std::sync::atomic::AtomicBool::new(false),
            count: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Returns the `start_time_micros` recorded in the header.
    pub fn start_time_micros(&self) -> u64 {
        self.start_time_micros
    }

    /// Appends one record. Returns `Ok(false)` without writing anything if
    /// the trace has already hit `max_bytes`.
    pub fn append(&self, record: &TraceRecord) -> Result<bool, TraceError> {
        let mut payload = Vec::new();
        payload.push(record.record_type.tag());
        payload.extend_from_slice(&record.timestamp_micros.to_le_bytes());
        record.record_type.encode_payload(&mut payload);

        let record_len = payload.len() as u32;
        let total = U32_SIZE + payload.len() + U32_SIZE;

        let mut written = self.bytes_written.lock().map_err(|_| TraceError::Internal("bytes_written mutex poisoned".into()))?;
        if self.max_bytes != 0 && *written + total as u64 > self.max_bytes {
            self.truncated.store(true, std::sync::atomic::Ordering::Relaxed);
            warn!(max_bytes = self.max_bytes, "trace: write suppressed, max_bytes reached");
            return Ok(false);
        }

        let mut hasher = Crc32::new();
        hasher.update(&record_len.to_le_bytes());
        hasher.update(&payload);
        let checksum = hasher.finalize();

        let mut guard = self.file.lock().map_err(|_| TraceError::Internal("trace file mutex poisoned".into()))?;
        guard.write_all(&record_len.to_le_bytes())?;
        guard.write_all(&payload)?;
        guard.write_all(&checksum.to_le_bytes())?;
        guard.sync_all()?;
        drop(guard);

        *written += total as u64;
        self.count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        trace!(len = record_len, "trace: record appended");
        Ok(true)
    }

    /// Total bytes written so far, including the header.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.lock().map(|g| *g).unwrap_or(0)
    }

    /// Whether one or more `append` calls were suppressed by `max_bytes`.
    pub fn truncated(&self) -> bool {
        self.truncated.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Number of records successfully appended.
    pub fn count(&self) -> u64 {
        self.count.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Reads and validates a trace file, yielding [`TraceRecord`]s in order.
pub struct TraceReader {
    file: File,
    offset: u64,
    /// `start_time_micros` recorded in the header.
    pub start_time_micros: u64,
}

impl TraceReader {
    /// Opens `path`, validates the header, and positions the reader at the
    /// first record.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let mut file = File::open(path)?;
        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header).map_err(|_| TraceError::InvalidHeader("file shorter than header".into()))?;

        if header[0..4] != MAGIC {
            return Err(TraceError::InvalidHeader("bad magic".into()));
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != VERSION {
            return Err(TraceError::InvalidHeader(format!("unsupported version {version}")));
        }
        let start_time_micros = u64::from_le_bytes(header[8..16].try_into().map_err(|_| TraceError::InvalidHeader("bad header".into()))?);

        Ok(Self { file, offset: HEADER_SIZE as u64, start_time_micros })
    }
}

impl Iterator for TraceReader {
    type Item = Result<TraceRecord, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        let record_start = self.offset;

        let mut len_bytes = [0u8; U32_SIZE];
        match self.file.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return None,
            Err(e) => return Some(Err(TraceError::Io(e))),
        }
        let record_len = u32::from_le_bytes(len_bytes) as usize;

        let mut payload = vec![0u8; record_len];
        if let Err(e) = self.file.read_exact(&mut payload) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Some(Err(TraceError::Truncated { offset: record_start }));
            }
            return Some(Err(TraceError::Io(e)));
        }

        let mut checksum_bytes = [0u8; U32_SIZE];
        if let Err(e) = self.file.read_exact(&mut checksum_bytes) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Some(Err(TraceError::Truncated { offset: record_start }));
            }
            return Some(Err(TraceError::Io(e)));
        }
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        self.offset += (U32_SIZE + record_len + U32_SIZE) as u64;

        let mut hasher = Crc32::new();
        hasher.update(&len_bytes);
        hasher.update(&payload);
        if hasher.finalize() != stored_checksum {
            return Some(Err(TraceError::ChecksumMismatch { offset: record_start }));
        }

        if payload.is_empty() {
            return Some(Err(TraceError::InvalidHeader("empty record payload".into())));
        }
        let tag = payload[0];
        let timestamp_bytes: [u8; 8] = match payload.get(1..9).and_then(|s| s.try_into().ok()) {
            Some(b) => b,
            None => return Some(Err(TraceError::Truncated { offset: record_start })),
        };
        let timestamp_micros = u64::from_le_bytes(timestamp_bytes);

        match TraceRecordType::decode(tag, &payload[9..]) {
            Ok(record_type) => Some(Ok(TraceRecord { timestamp_micros, record_type })),
            Err(e) => Some(Err(e)),
        }
    }
}

/// Callback interface for [`replay`]. Each method defaults to a no-op so
/// implementers only override what they care about.
pub trait TraceHandler {
    /// Handle a [`TraceRecordType::Write`] or [`TraceRecordType::WriteWithSeqno`].
    fn handle_write(&mut self, _key: &[u8], _value: Option<&[u8]>, _seqno: Option<u64>) {}
    /// Handle a [`TraceRecordType::Get`].
    fn handle_get(&mut self, _key: &[u8]) {}
    /// Handle a [`TraceRecordType::IterSeek`].
    fn handle_iter_seek(&mut self, _key: &[u8]) {}
    /// Handle a [`TraceRecordType::Flush`].
    fn handle_flush(&mut self) {}
    /// Handle a [`TraceRecordType::Compaction`].
    fn handle_compaction(&mut self) {}
}

/// A [`TraceHandler`] that merely counts each kind of record, for dry runs
/// that want to know the shape of a trace without acting on it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CountingHandler {
    /// Number of write records seen (with or without an explicit seqno).
    pub writes: u64,
    /// Number of get records seen.
    pub gets: u64,
    /// Number of iterator-seek records seen.
    pub iter_seeks: u64,
    /// Number of flush records seen.
    pub flushes: u64,
    /// Number of compaction records seen.
    pub compactions: u64,
}

impl TraceHandler for CountingHandler {
    fn handle_write(&mut self, _key: &[u8], _value: Option<&[u8]>, _seqno: Option<u64>) {
        self.writes += 1;
    }
    fn handle_get(&mut self, _key: &[u8]) {
        self.gets += 1;
    }
    fn handle_iter_seek(&mut self, _key: &[u8]) {
        self.iter_seeks += 1;
    }
    fn handle_flush(&mut self) {
        self.flushes += 1;
    }
    fn handle_compaction(&mut self) {
        self.compactions += 1;
    }
}

/// Replays every record in `reader` into `handler`, in order.
///
/// `preserve_timing` is accepted for API symmetry with a real-time replay
/// tool; this crate's replay is always immediate (no sleeping between
/// records), since the only consumers are reference-state reconstruction
/// and counting, neither of which cares about wall-clock pacing.
pub fn replay(reader: TraceReader, handler: &mut dyn TraceHandler, preserve_timing: bool) -> Result<u64, TraceError> {
    let _ = preserve_timing;
    let mut n = 0u64;
    for record in reader {
        let record = record?;
        match record.record_type {
            TraceRecordType::Write { key, value } => handler.handle_write(&key, value.as_deref(), None),
            TraceRecordType::WriteWithSeqno { key, value, seqno } => handler.handle_write(&key, value.as_deref(), Some(seqno)),
            TraceRecordType::Get { key } => handler.handle_get(&key),
            TraceRecordType::IterSeek { key } => handler.handle_iter_seek(&key),
            TraceRecordType::Flush => handler.handle_flush(),
            TraceRecordType::Compaction => handler.handle_compaction(),
            TraceRecordType::Unknown { .. } => {}
        }
        n += 1;
    }
    Ok(n)
}

/// Reconstructs the key-value state that would exist after applying only
/// records with `seqno <= cutoff`, per the seqno-prefix replay contract.
/// Records without an explicit seqno (plain [`TraceRecordType::Write`]) are
/// always applied, since they carry no seqno to compare against `cutoff`.
///
/// Returns a map from key to `Some(value)` (put) or `None` (delete).
pub fn replay_seqno_prefix(reader: TraceReader, cutoff: u64) -> Result<BTreeMap<Vec<u8>, Option<Vec<u8>>>, TraceError> {
    let mut state = BTreeMap::new();
    for record in reader {
        let record = record?;
        match record.record_type {
            TraceRecordType::Write { key, value } => {
                state.insert(key, value);
            }
            TraceRecordType::WriteWithSeqno { key, value, seqno } if seqno <= cutoff => {
                state.insert(key, value);
            }
            _ => {}
        }
    }
    Ok(state)
}
