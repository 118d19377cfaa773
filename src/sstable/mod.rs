//! Sorted String Table (SST) module — block-based on-disk format.
//!
//! This module implements an **immutable**, **disk-backed**, and
//! **versioned** sorted string table built from small, independently
//! checksummed and compressed blocks, in the tradition of the LevelDB /
//! RocksDB block-based table format:
//!
//! ```text
//! [data block 0][data block 1]...[data block N]
//! [filter block]                      (optional)
//! [range-deletion block]              (optional)
//! [properties block]
//! [index block]                       (omitted here, registered in metaindex, for format >= 6)
//! [metaindex block]
//! [footer]
//! ```
//!
//! Every block (data, filter, range-deletion, properties, index,
//! metaindex) is independently compressed and trailed by a one-byte
//! compression tag plus a four-byte checksum — see [`crate::block`],
//! [`crate::compression`], and [`crate::checksum`] for the codecs this
//! module composes.
//!
//! Point deletes and range tombstones are stored as typed entries
//! (`ValueType::Deletion` / a dedicated range-deletion block) so that
//! higher layers can prune them during reads and compactions. A
//! whole-table [`crate::filter`] block makes point lookups skip tables
//! that cannot contain a key.
//!
//! # Sub-modules
//!
//! - [`builder`] — [`TableBuilder`] (and the [`SstWriter`] adapter kept
//!   for the engine/compaction call sites) for building tables from
//!   sorted streams.
//! - [`iterator`] — [`TableIterator`] (the format's two-level
//!   index-then-data iterator) and [`ScanIterator`] for range scans.
//!
//! # Concurrency model
//!
//! - SSTs are **immutable** once written, so reads are lock-free.
//! - Multiple readers can safely share one memory-mapped table.
//! - No in-place writes; updates are appended as new SSTs via [`TableBuilder`].

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Re-exports — public API surface
// ------------------------------------------------------------------------------------------------

#[allow(unused_imports)] // public API surface for downstream consumers
pub use crate::engine::{PointEntry, RangeTombstone, Record};
pub use builder::{SstWriter, TableBuilder, TableOptions};
pub use iterator::{ScanIterator, TableIterator};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{fs::File, io, path::Path};

use memmap2::Mmap;
use thiserror::Error;

use crate::block::{self, BlockHandle, InternalKey, ValueType};
use crate::checksum::{self, ChecksumType};
use crate::compression::{self, CompressionError, CompressionTag};
use crate::filter::{FilterError, FilterReader};
use crate::rangedel::{FragmentedList, Fragmenter, TombstoneList};

// ------------------------------------------------------------------------------------------------
// Constants — on-disk format
// ------------------------------------------------------------------------------------------------

/// Magic trailing every footer written by this crate.
pub const CURRENT_MAGIC: u64 = 0x88e2_41b7_85f4_cff7;
/// Magic recognised (but not readable) as belonging to an older footer layout.
pub const LEGACY_MAGIC: u64 = 0xdb47_7524_8b80_fb57;

/// Format versions this crate can read and write.
pub const SUPPORTED_FORMAT_VERSIONS: [u32; 2] = [3, 6];
/// Minimum format version at which the index block may use value-delta encoding.
pub const INDEX_VALUE_DELTA_MIN_FORMAT: u32 = 4;
/// Minimum format version at which block checksums mix in the per-offset context modifier.
pub const CONTEXT_CHECKSUM_MIN_FORMAT: u32 = 6;

const HANDLES_AREA_LEN: usize = 40;
const FOOTER_LENGTH: usize = HANDLES_AREA_LEN + 4 + 1 + 4 + 8;
const BLOCK_TRAILER_LEN: usize = 5; // 1-byte compression tag + 4-byte checksum

const META_PROPERTIES_NAME: &str = "rocksdb.properties";
const META_RANGE_DEL_NAME: &str = "rocksdb.range_del";
const META_INDEX_NAME: &str = "rocksdb.index";
const META_FILTER_PREFIX: &str = "fullfilter.";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SST operations (read, write, build).
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A block failed to compress or decompress.
    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),

    /// The filter block failed to build or parse.
    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    /// Malformed data that isn't covered by a more specific variant.
    #[error("corrupt SST: {0}")]
    Corruption(String),

    /// A block's stored checksum does not match its computed checksum.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// The block's compression tag is not supported at runtime.
    #[error("unsupported compression tag {0}")]
    UnsupportedCompression(u8),

    /// `IndexPartitions > 0` in the properties block; this crate never
    /// writes partitioned indexes and cannot read them.
    #[error("partitioned indexes are not supported")]
    UnsupportedPartitionedIndex,

    /// The footer names a format version this crate does not implement.
    #[error("unsupported format version {0}")]
    UnsupportedFormatVersion(u32),

    /// A caller-supplied argument violated the table's contract (e.g. keys
    /// added out of order).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Properties block
// ------------------------------------------------------------------------------------------------

/// Table-level metadata and statistics, stored as its own block.
///
/// Per-field encoding is fixed-width for `u32`/`u64` fields and
/// varint32-length-prefixed for byte strings — byte-compatible across
/// readers only for these uint64/ASCII-string-shaped properties (see
/// `DESIGN.md`'s Open Question notes on non-UTF-8 property values).
#[derive(Debug, Clone)]
pub struct SSTablePropertiesBlock {
    /// Creation timestamp (UNIX epoch nanos).
    pub creation_timestamp: u64,
    /// Total number of point records (puts + point deletes).
    pub record_count: u64,
    /// Number of point deletions.
    pub tombstone_count: u64,
    /// Number of range tombstones (pre-fragmentation).
    pub range_tombstones_count: u64,
    /// Minimum LSN present in this table.
    pub min_lsn: u64,
    /// Maximum LSN present in this table.
    pub max_lsn: u64,
    /// Minimum timestamp present in this table.
    pub min_timestamp: u64,
    /// Maximum timestamp present in this table.
    pub max_timestamp: u64,
    /// Minimum user key in this table.
    pub min_key: Vec<u8>,
    /// Maximum user key in this table.
    pub max_key: Vec<u8>,
    /// Number of index partitions. Always `0`; a nonzero value read from
    /// disk is rejected with [`SSTableError::UnsupportedPartitionedIndex`].
    pub index_partitions: u32,
    /// Comparator used to order internal keys in this table.
    pub comparator_name: String,
    /// Column family this table belongs to.
    pub column_family_id: u32,
    /// Human-readable column family name.
    pub column_family_name: String,
    /// Name of the filter policy used to build the filter block, if any.
    pub filter_policy_name: String,
}

impl SSTablePropertiesBlock {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u64(&mut buf, self.creation_timestamp);
        put_u64(&mut buf, self.record_count);
        put_u64(&mut buf, self.tombstone_count);
        put_u64(&mut buf, self.range_tombstones_count);
        put_u64(&mut buf, self.min_lsn);
        put_u64(&mut buf, self.max_lsn);
        put_u64(&mut buf, self.min_timestamp);
        put_u64(&mut buf, self.max_timestamp);
        put_bytes(&mut buf, &self.min_key);
        put_bytes(&mut buf, &self.max_key);
        put_u32(&mut buf, self.index_partitions);
        put_bytes(&mut buf, self.comparator_name.as_bytes());
        put_u32(&mut buf, self.column_family_id);
        put_bytes(&mut buf, self.column_family_name.as_bytes());
        put_bytes(&mut buf, self.filter_policy_name.as_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, SSTableError> {
        let mut cur = buf;
        let creation_timestamp = get_u64(&mut cur)?;
        let record_count = get_u64(&mut cur)?;
        let tombstone_count = get_u64(&mut cur)?;
        let range_tombstones_count = get_u64(&mut cur)?;
        let min_lsn = get_u64(&mut cur)?;
        let max_lsn = get_u64(&mut cur)?;
        let min_timestamp = get_u64(&mut cur)?;
        let max_timestamp = get_u64(&mut cur)?;
        let min_key = get_bytes(&mut cur)?;
        let max_key = get_bytes(&mut cur)?;
        let index_partitions = get_u32(&mut cur)?;
        let comparator_name = String::from_utf8_lossy(&get_bytes(&mut cur)?).into_owned();
        let column_family_id = get_u32(&mut cur)?;
        let column_family_name = String::from_utf8_lossy(&get_bytes(&mut cur)?).into_owned();
        let filter_policy_name = String::from_utf8_lossy(&get_bytes(&mut cur)?).into_owned();

        if index_partitions > 0 {
            return Err(SSTableError::UnsupportedPartitionedIndex);
        }

        Ok(Self {
            creation_timestamp,
            record_count,
            tombstone_count,
            range_tombstones_count,
            min_lsn,
            max_lsn,
            min_timestamp,
            max_timestamp,
            min_key,
            max_key,
            index_partitions,
            comparator_name,
            column_family_id,
            column_family_name,
            filter_policy_name,
        })
    }
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    block::put_varint32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

fn get_u32(cur: &mut &[u8]) -> Result<u32, SSTableError> {
    if cur.len() < 4 {
        return Err(SSTableError::Corruption("truncated u32 property".into()));
    }
    let (head, rest) = cur.split_at(4);
    *cur = rest;
    Ok(u32::from_le_bytes(head.try_into().unwrap()))
}

fn get_u64(cur: &mut &[u8]) -> Result<u64, SSTableError> {
    if cur.len() < 8 {
        return Err(SSTableError::Corruption("truncated u64 property".into()));
    }
    let (head, rest) = cur.split_at(8);
    *cur = rest;
    Ok(u64::from_le_bytes(head.try_into().unwrap()))
}

fn get_bytes(cur: &mut &[u8]) -> Result<Vec<u8>, SSTableError> {
    let (len, n) = block::get_varint32(cur)
        .ok_or_else(|| SSTableError::Corruption("truncated property length".into()))?;
    let len = len as usize;
    if cur.len() < n + len {
        return Err(SSTableError::Corruption("truncated property bytes".into()));
    }
    let bytes = cur[n..n + len].to_vec();
    *cur = &cur[n + len..];
    Ok(bytes)
}

// ------------------------------------------------------------------------------------------------
// Metaindex
// ------------------------------------------------------------------------------------------------

fn encode_metaindex(entries: &[(String, BlockHandle)]) -> Vec<u8> {
    let mut buf = Vec::new();
    block::put_varint32(&mut buf, entries.len() as u32);
    for (name, handle) in entries {
        put_bytes(&mut buf, name.as_bytes());
        handle.encode_to(&mut buf);
    }
    buf
}

fn decode_metaindex(buf: &[u8]) -> Result<Vec<(String, BlockHandle)>, SSTableError> {
    let mut cur = buf;
    let (count, n) = block::get_varint32(cur)
        .ok_or_else(|| SSTableError::Corruption("truncated metaindex count".into()))?;
    cur = &cur[n..];
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_bytes = get_bytes(&mut cur)?;
        let name = String::from_utf8_lossy(&name_bytes).into_owned();
        let (handle, n) = BlockHandle::decode_from(cur)
            .ok_or_else(|| SSTableError::Corruption("truncated metaindex handle".into()))?;
        cur = &cur[n..];
        out.push((name, handle));
    }
    Ok(out)
}

// ------------------------------------------------------------------------------------------------
// Footer
// ------------------------------------------------------------------------------------------------

pub(crate) struct Footer {
    pub(crate) metaindex_handle: BlockHandle,
    pub(crate) legacy_index_handle: BlockHandle,
    pub(crate) format_version: u32,
    pub(crate) checksum_type: ChecksumType,
    pub(crate) base_context_checksum: u32,
}

impl Footer {
    fn encode(&self) -> Vec<u8> {
        let mut handles = Vec::with_capacity(HANDLES_AREA_LEN);
        self.metaindex_handle.encode_to(&mut handles);
        self.legacy_index_handle.encode_to(&mut handles);
        handles.resize(HANDLES_AREA_LEN, 0);

        let mut buf = Vec::with_capacity(FOOTER_LENGTH);
        buf.extend_from_slice(&handles);
        buf.extend_from_slice(&self.format_version.to_le_bytes());
        buf.push(self.checksum_type.tag());
        buf.extend_from_slice(&self.base_context_checksum.to_le_bytes());
        buf.extend_from_slice(&CURRENT_MAGIC.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, SSTableError> {
        if buf.len() != FOOTER_LENGTH {
            return Err(SSTableError::Corruption("short footer".into()));
        }
        let magic = u64::from_le_bytes(buf[buf.len() - 8..].try_into().unwrap());
        if magic == LEGACY_MAGIC {
            return Err(SSTableError::UnsupportedFormatVersion(0));
        }
        if magic != CURRENT_MAGIC {
            return Err(SSTableError::Corruption("bad magic number".into()));
        }

        let handles = &buf[..HANDLES_AREA_LEN];
        let (metaindex_handle, n1) = BlockHandle::decode_from(handles)
            .ok_or_else(|| SSTableError::Corruption("bad metaindex handle".into()))?;
        let (legacy_index_handle, _) = BlockHandle::decode_from(&handles[n1..])
            .ok_or_else(|| SSTableError::Corruption("bad index handle".into()))?;

        let mut off = HANDLES_AREA_LEN;
        let format_version = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let checksum_tag = buf[off];
        off += 1;
        let base_context_checksum = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());

        if !SUPPORTED_FORMAT_VERSIONS.contains(&format_version) {
            return Err(SSTableError::UnsupportedFormatVersion(format_version));
        }
        let checksum_type = ChecksumType::from_tag(checksum_tag)
            .ok_or_else(|| SSTableError::Corruption("unknown checksum type tag".into()))?;

        Ok(Self {
            metaindex_handle,
            legacy_index_handle,
            format_version,
            checksum_type,
            base_context_checksum,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// GetResult
// ------------------------------------------------------------------------------------------------

/// Result of a single key lookup in an SST.
#[derive(Debug, PartialEq, Clone)]
pub enum GetResult {
    /// A value stored in this SST.
    Put {
        /// Stored value.
        value: Vec<u8>,
        /// LSN of this version.
        lsn: u64,
        /// Timestamp of this version.
        timestamp: u64,
    },
    /// A point delete for this key.
    Delete {
        /// LSN of the delete.
        lsn: u64,
        /// Timestamp of the delete.
        timestamp: u64,
    },
    /// The key falls inside a range deletion.
    RangeDelete {
        /// LSN of the range tombstone.
        lsn: u64,
        /// Timestamp of the range tombstone.
        timestamp: u64,
    },
    /// This SST has no information about the key.
    NotFound,
}

impl GetResult {
    /// Returns the LSN associated with this get result.
    pub fn lsn(&self) -> u64 {
        match self {
            Self::Put { lsn, .. } => *lsn,
            Self::Delete { lsn, .. } => *lsn,
            Self::RangeDelete { lsn, .. } => *lsn,
            Self::NotFound => 0,
        }
    }

    /// Returns the timestamp associated with this get result.
    pub fn timestamp(&self) -> u64 {
        match self {
            Self::Put { timestamp, .. } => *timestamp,
            Self::Delete { timestamp, .. } => *timestamp,
            Self::RangeDelete { timestamp, .. } => *timestamp,
            Self::NotFound => 0,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// SSTable — immutable reader (spec.md §4.7 "Table Reader")
// ------------------------------------------------------------------------------------------------

/// A fully memory-mapped, immutable block-based SST.
///
/// Aliased as [`Table`] to match the reader-facing name used elsewhere in
/// this crate's design notes; kept as `SSTable` here since `engine` and
/// `compaction` address it by that name throughout.
pub struct SSTable {
    /// Unique identifier assigned by the engine (from the manifest).
    /// Set to 0 by [`SSTable::open`] — the engine sets the correct value
    /// after loading.
    pub id: u64,
    /// Memory-mapped file containing the full SST bytes.
    pub mmap: Mmap,
    /// Parsed properties block.
    pub properties: SSTablePropertiesBlock,

    format_version: u32,
    checksum_type: ChecksumType,
    base_context_checksum: u32,
    file_size: u64,

    index_block: Vec<u8>,

    filter: FilterReader,

    raw_range_tombstones: Vec<RawRangeTombstone>,
    range_tombstones: FragmentedList,
}

/// A range tombstone as read off disk, still carrying its original LSN and
/// wall-clock timestamp (the block format only stores a `sequence`; the
/// timestamp travels in the record's value payload — see `builder.rs`).
struct RawRangeTombstone {
    start: Vec<u8>,
    end: Vec<u8>,
    lsn: u64,
    timestamp: u64,
}

/// Alias matching the reader's conceptual name in the design notes.
pub type Table = SSTable;

impl SSTable {
    /// Returns the on-disk file size of this SST in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Whether `key` *might* exist in this table according to the filter
    /// block. Returns `true` ("maybe present") when there is no filter or
    /// it cannot be excluded.
    pub fn bloom_may_contain(&self, key: &[u8]) -> bool {
        self.filter.may_contain_user_key(key)
    }

    /// Alias for [`Self::bloom_may_contain`] matching spec.md's reader
    /// operation name.
    pub fn key_may_match(&self, user_key: &[u8]) -> bool {
        self.bloom_may_contain(user_key)
    }

    /// Whether this table stores any range tombstones.
    pub fn has_range_tombstones(&self) -> bool {
        !self.raw_range_tombstones.is_empty()
    }

    /// Returns an iterator over the range tombstones stored in this table,
    /// in the engine's `RangeTombstone` shape.
    pub fn range_tombstone_iter(&self) -> impl Iterator<Item = crate::engine::RangeTombstone> + '_ {
        self.raw_range_tombstones.iter().map(|rt| crate::engine::RangeTombstone {
            start: rt.start.clone(),
            end: rt.end.clone(),
            lsn: rt.lsn,
            timestamp: rt.timestamp,
        })
    }

    /// Returns the fragmented, non-overlapping range-tombstone list for
    /// `O(log n)` coverage queries (see [`crate::rangedel`]).
    pub fn get_range_tombstone_list(&self) -> &FragmentedList {
        &self.range_tombstones
    }

    /// Returns the range tombstones stored in this table (same values as
    /// [`Self::range_tombstone_iter`], collected eagerly).
    pub fn get_range_tombstones(&self) -> Vec<crate::engine::RangeTombstone> {
        self.range_tombstone_iter().collect()
    }

    /// A two-level (index-then-data) iterator over every internal key in
    /// this table, in ascending internal-key order.
    pub fn new_iterator(&self) -> iterator::TableIterator<'_> {
        iterator::TableIterator::new(self)
    }

    /// Opens an SST from disk and loads its properties, index, filter, and
    /// range-deletion blocks. See module docs for the pipeline.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SSTableError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let file_size = mmap.len() as u64;

        if mmap.len() < FOOTER_LENGTH {
            return Err(SSTableError::Corruption("file too small for footer".into()));
        }
        let footer = Footer::decode(&mmap[mmap.len() - FOOTER_LENGTH..])?;

        let read_block_raw = |handle: &BlockHandle| -> Result<Vec<u8>, SSTableError> {
            read_and_verify_block(
                &mmap,
                handle,
                file_size,
                footer.checksum_type,
                footer.base_context_checksum,
            )
        };

        let metaindex_bytes = read_block_raw(&footer.metaindex_handle)?;
        let metaindex = decode_metaindex(&metaindex_bytes)?;

        let mut properties_handle = None;
        let mut range_del_handle = None;
        let mut filter_handle = None;
        let mut index_handle = footer.legacy_index_handle;

        for (name, handle) in &metaindex {
            if name == META_PROPERTIES_NAME {
                properties_handle = Some(*handle);
            } else if name == META_RANGE_DEL_NAME {
                range_del_handle = Some(*handle);
            } else if name == META_INDEX_NAME {
                index_handle = *handle;
            } else if name.starts_with(META_FILTER_PREFIX) {
                filter_handle = Some(*handle);
            }
        }

        let properties = match properties_handle {
            Some(h) => SSTablePropertiesBlock::decode(&read_block_raw(&h)?)?,
            None => return Err(SSTableError::Corruption("SST missing properties block".into())),
        };

        if index_handle.is_null() {
            return Err(SSTableError::Corruption("SST missing index block".into()));
        }
        let index_block = read_block_raw(&index_handle)?;

        let filter = match filter_handle {
            Some(h) => match read_block_raw(&h) {
                Ok(bytes) => FilterReader::from_bytes(&bytes),
                Err(_) => FilterReader::from_bytes(&[]), // best-effort: missing filter never fails Open
            },
            None => FilterReader::from_bytes(&[]),
        };

        let (raw_range_tombstones, range_tombstones) = match range_del_handle {
            Some(h) => {
                let bytes = read_block_raw(&h)?;
                decode_range_deletions(&bytes)?
            }
            None => (Vec::new(), FragmentedList::empty()),
        };

        Ok(Self {
            id: 0,
            mmap,
            properties,
            format_version: footer.format_version,
            checksum_type: footer.checksum_type,
            base_context_checksum: footer.base_context_checksum,
            file_size,
            index_block,
            filter,
            raw_range_tombstones,
            range_tombstones,
        })
    }

    /// Performs a single-table lookup of `key`. Returns the "raw MVCC"
    /// result from this table alone; higher layers merge across tables.
    pub fn get(&self, key: &[u8]) -> Result<GetResult, SSTableError> {
        let range_info = self.covering_range_for_key(key);

        if !self.filter.may_contain_user_key(key) {
            return Ok(match range_info {
                Some((lsn, timestamp)) => GetResult::RangeDelete { lsn, timestamp },
                None => GetResult::NotFound,
            });
        }

        let target = InternalKey::new(key, u64::MAX, ValueType::Other(0xFF));
        let mut it = self.new_iterator();
        it.seek(target.encoded());

        let point = if it.valid() {
            let found = InternalKey::from_encoded(it.key().to_vec())
                .ok_or_else(|| SSTableError::Corruption("short internal key in block".into()))?;
            if found.user_key() == key {
                Some(decode_point_entry(&found, it.value())?)
            } else {
                None
            }
        } else {
            None
        };

        Ok(merge_point_and_range(point, range_info))
    }

    /// Returns a forward scan over `[start_key, end_key)`, yielding
    /// unresolved MVCC [`Record`]s (point entries and range tombstones
    /// interleaved); visibility resolution is the caller's job.
    pub fn scan(
        &self,
        start_key: &[u8],
        end_key: &[u8],
    ) -> Result<impl Iterator<Item = Record> + '_, SSTableError> {
        iterator::ScanIterator::new(self, start_key.to_vec(), end_key.to_vec())
    }

    fn covering_range_for_key(&self, key: &[u8]) -> Option<(u64, u64)> {
        let mut res: Option<(u64, u64)> = None;
        for rt in &self.raw_range_tombstones {
            if key >= rt.start.as_slice() && key < rt.end.as_slice() {
                res = Some(match res {
                    Some((prev_lsn, prev_ts)) => {
                        if rt.lsn > prev_lsn || (rt.lsn == prev_lsn && rt.timestamp > prev_ts) {
                            (rt.lsn, rt.timestamp)
                        } else {
                            (prev_lsn, prev_ts)
                        }
                    }
                    None => (rt.lsn, rt.timestamp),
                });
            }
        }
        res
    }

    pub(crate) fn read_block(&self, handle: &BlockHandle) -> Result<Vec<u8>, SSTableError> {
        read_and_verify_block(&self.mmap, handle, self.file_size, self.checksum_type, self.base_context_checksum)
    }

    pub(crate) fn index_block_bytes(&self) -> &[u8] {
        &self.index_block
    }
}

fn merge_point_and_range(point: Option<GetResult>, range_info: Option<(u64, u64)>) -> GetResult {
    match (point, range_info) {
        (None, None) => GetResult::NotFound,
        (Some(r), None) => r,
        (None, Some((lsn, timestamp))) => GetResult::RangeDelete { lsn, timestamp },
        (Some(point), Some((r_lsn, r_ts))) => {
            let (p_lsn, p_ts) = (point.lsn(), point.timestamp());
            if r_lsn > p_lsn || (r_lsn == p_lsn && r_ts > p_ts) {
                GetResult::RangeDelete { lsn: r_lsn, timestamp: r_ts }
            } else {
                point
            }
        }
    }
}

/// Decode a point internal key + value-payload pair into a [`GetResult`].
/// `value` is `timestamp(8B LE) ‖ payload`, where `payload` is the stored
/// value for `Value` entries and empty for `Deletion` entries.
pub(crate) fn decode_point_entry(key: &InternalKey, value: &[u8]) -> Result<GetResult, SSTableError> {
    if value.len() < 8 {
        return Err(SSTableError::Corruption("short point value payload".into()));
    }
    let timestamp = u64::from_le_bytes(value[..8].try_into().unwrap());
    let lsn = key.sequence();
    match key.value_type() {
        ValueType::Value => Ok(GetResult::Put { value: value[8..].to_vec(), lsn, timestamp }),
        ValueType::Deletion => Ok(GetResult::Delete { lsn, timestamp }),
        other => Err(SSTableError::Corruption(format!("unexpected value type {other:?} in data block"))),
    }
}

/// Decode the range-deletion block's raw bytes into both the original
/// (lsn, timestamp)-carrying tombstones and their fragmented form.
fn decode_range_deletions(bytes: &[u8]) -> Result<(Vec<RawRangeTombstone>, FragmentedList), SSTableError> {
    let mut raw = Vec::new();
    let mut list = TombstoneList::new();
    let mut it = block::BlockIterator::new(bytes);
    it.seek_to_first();
    while it.valid() {
        let key = InternalKey::from_encoded(it.key().to_vec())
            .ok_or_else(|| SSTableError::Corruption("short range-deletion key".into()))?;
        if key.value_type() != ValueType::RangeDeletion {
            return Err(SSTableError::Corruption("non-tombstone entry in range-deletion block".into()));
        }
        let value = it.value();
        if value.len() < 8 {
            return Err(SSTableError::Corruption("short range-deletion value".into()));
        }
        let timestamp = u64::from_le_bytes(value[..8].try_into().unwrap());
        let end = value[8..].to_vec();
        let start = key.user_key().to_vec();
        let lsn = key.sequence();

        list.add(start.clone(), end.clone(), lsn);
        raw.push(RawRangeTombstone { start, end, lsn, timestamp });
        it.next();
    }
    let fragmented = Fragmenter::fragment(&list);
    Ok((raw, fragmented))
}

/// Validate, read, checksum-verify, and decompress one block.
///
/// Mirrors spec.md §4.7's block-read path: bounds check, single read of
/// block-plus-trailer, checksum (with the format-≥-6 context modifier),
/// then decompression (consuming a varint32 uncompressed-size prefix for
/// codecs that don't embed their own size).
pub(crate) fn read_and_verify_block(
    mmap: &[u8],
    handle: &BlockHandle,
    file_size: u64,
    checksum_type: ChecksumType,
    base_context_checksum: u32,
) -> Result<Vec<u8>, SSTableError> {
    let offset = handle.offset;
    let size = handle.size;
    if size == 0 {
        return Ok(Vec::new());
    }
    if size > (256 << 20) {
        return Err(SSTableError::Corruption("block size exceeds 256MiB".into()));
    }
    let end = offset
        .checked_add(size)
        .and_then(|v| v.checked_add(BLOCK_TRAILER_LEN as u64))
        .ok_or_else(|| SSTableError::Corruption("block handle overflow".into()))?;
    if end > file_size {
        return Err(SSTableError::Corruption("block extends past end of file".into()));
    }

    let start = offset as usize;
    let content_end = start + size as usize;
    let trailer_end = content_end + BLOCK_TRAILER_LEN;
    let content = &mmap[start..content_end];
    let compression_tag = mmap[content_end];
    let stored_checksum = u32::from_le_bytes(mmap[content_end + 1..trailer_end].try_into().unwrap());

    let computed = checksum::block_checksum(checksum_type, content, compression_tag, base_context_checksum, offset);
    if computed != stored_checksum {
        return Err(SSTableError::ChecksumMismatch);
    }

    let tag = CompressionTag::from_u8(compression_tag)
        .ok_or(SSTableError::UnsupportedCompression(compression_tag))?;

    if tag.embeds_size() {
        Ok(compression::decompress(tag, content, None)?)
    } else {
        let (expected_size, n) = block::get_varint32(content)
            .ok_or_else(|| SSTableError::Corruption("missing uncompressed-size prefix".into()))?;
        Ok(compression::decompress(tag, &content[n..], Some(expected_size as usize))?)
    }
}
