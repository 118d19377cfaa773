//! Table builder — builds a complete block-based SST from sorted streams.
//!
//! [`TableBuilder`] is the low-level, streaming builder: callers add point
//! entries and range tombstones one at a time (point entries in ascending
//! internal-key order), and it flushes data blocks as they fill, building
//! the filter, range-deletion, properties, index, and metaindex blocks at
//! [`TableBuilder::finish`].
//!
//! [`SstWriter`] is a thin adapter kept for the engine and compaction call
//! sites: it accepts the same two sorted streams the original writer
//! required ([`PointEntry`]/[`RangeTombstone`]) and drives a
//! [`TableBuilder`] underneath, writing to a `.tmp` file and renaming it
//! into place once the table is complete.

use std::{
    fs::OpenOptions,
    io::{BufWriter, Write},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use rand::Rng;

use crate::block::{self, BlockBuilder, BlockHandle, IndexBlockBuilder, InternalKey, ValueType};
use crate::checksum::{self, ChecksumType};
use crate::compression::{self, CompressionTag};
use crate::engine::{PointEntry, RangeTombstone};
use crate::filter::FilterBuilder;

use super::{
    encode_metaindex, Footer, SSTableError, SSTablePropertiesBlock, BLOCK_TRAILER_LEN,
    CONTEXT_CHECKSUM_MIN_FORMAT, INDEX_VALUE_DELTA_MIN_FORMAT, META_FILTER_PREFIX, META_INDEX_NAME,
    META_PROPERTIES_NAME, META_RANGE_DEL_NAME,
};

/// Converts a bits-per-key budget into the false-positive rate a bloom
/// filter sized with that many bits per key achieves at its optimal hash
/// count: `p ≈ 0.6185^(bits_per_key)`.
fn fp_rate_for_bits_per_key(bits_per_key: u32) -> f64 {
    0.6185_f64.powf(bits_per_key as f64)
}

/// Knobs controlling how a table is built. Defaults match spec.md §4's
/// recommended values.
#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Target uncompressed size of each data block before it is flushed.
    pub block_size: usize,
    /// Emit a restart point every this many records within a block.
    pub restart_interval: usize,
    /// On-disk format version; must be `3` or `6`.
    pub format_version: u32,
    /// Checksum algorithm used for every block trailer.
    pub checksum_type: ChecksumType,
    /// Column family this table belongs to.
    pub column_family_id: u32,
    /// Human-readable column family name.
    pub column_family_name: String,
    /// Comparator name recorded in the properties block.
    pub comparator_name: String,
    /// Bits per key budget for the whole-table filter. `0` disables the filter.
    pub filter_bits_per_key: u32,
    /// Filter policy name recorded in the metaindex and properties block.
    pub filter_policy_name: String,
    /// Compression applied to data blocks. Metadata blocks are always stored uncompressed.
    pub compression: CompressionTag,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            restart_interval: 16,
            format_version: 6,
            checksum_type: ChecksumType::Crc32c,
            column_family_id: 0,
            column_family_name: "default".to_string(),
            comparator_name: "leveldb.BytewiseComparator".to_string(),
            filter_bits_per_key: 10,
            filter_policy_name: "leveldb.BuiltinBloomFilter2".to_string(),
            compression: CompressionTag::None,
        }
    }
}

#[derive(Default)]
struct BuildStats {
    record_count: u64,
    tombstone_count: u64,
    range_tombstones_count: u64,
    min_lsn: u64,
    max_lsn: u64,
    min_timestamp: u64,
    max_timestamp: u64,
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,
}

impl BuildStats {
    fn observe_point(&mut self, user_key: &[u8], lsn: u64, timestamp: u64) {
        self.record_count += 1;
        self.min_lsn = if self.record_count == 1 { lsn } else { self.min_lsn.min(lsn) };
        self.max_lsn = self.max_lsn.max(lsn);
        self.min_timestamp = if self.record_count == 1 { timestamp } else { self.min_timestamp.min(timestamp) };
        self.max_timestamp = self.max_timestamp.max(timestamp);
        match &self.min_key {
            Some(k) if k.as_slice() <= user_key => {}
            _ => self.min_key = Some(user_key.to_vec()),
        }
        match &self.max_key {
            Some(k) if k.as_slice() >= user_key => {}
            _ => self.max_key = Some(user_key.to_vec()),
        }
    }
}

/// Streaming builder for one block-based SST. See module docs.
pub struct TableBuilder<W: Write> {
    writer: W,
    options: TableOptions,
    data_block: BlockBuilder,
    index_block: IndexBlockBuilder,
    range_tombstones: Vec<(Vec<u8>, Vec<u8>, u64, u64)>,
    filter_keys: Vec<Vec<u8>>,
    last_key: Vec<u8>,
    has_last_key: bool,
    num_entries: u64,
    offset: u64,
    base_context_checksum: u32,
    status: Result<(), String>,
    finished: bool,
    stats: BuildStats,
    creation_timestamp: u64,
}

impl<W: Write> TableBuilder<W> {
    /// Start a new table, writing to `writer`.
    pub fn new(writer: W, options: TableOptions) -> Result<Self, SSTableError> {
        let base_context_checksum = if options.format_version >= CONTEXT_CHECKSUM_MIN_FORMAT {
            loop {
                let v: u32 = rand::rng().random();
                if v != 0 {
                    break v;
                }
            }
        } else {
            0
        };
        let restart_interval = options.restart_interval;
        Ok(Self {
            writer,
            data_block: BlockBuilder::new(restart_interval),
            index_block: IndexBlockBuilder::new(restart_interval),
            range_tombstones: Vec::new(),
            filter_keys: Vec::new(),
            last_key: Vec::new(),
            has_last_key: false,
            num_entries: 0,
            offset: 0,
            base_context_checksum,
            status: Ok(()),
            finished: false,
            stats: BuildStats::default(),
            creation_timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0),
            options,
        })
    }

    /// Number of point entries added so far.
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far.
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    /// The first error encountered, if any. Once set, further `add*` calls
    /// are no-ops that keep returning it.
    pub fn status(&self) -> Result<(), SSTableError> {
        self.status.clone().map_err(SSTableError::InvalidArgument)
    }

    /// Add a live value for `user_key` at `sequence`/`timestamp`.
    ///
    /// Keys (by internal-key order: user key ascending, then sequence
    /// descending) must be added in strictly ascending order.
    pub fn add_put(&mut self, user_key: &[u8], value: &[u8], sequence: u64, timestamp: u64) -> Result<(), SSTableError> {
        let mut payload = Vec::with_capacity(8 + value.len());
        payload.extend_from_slice(&timestamp.to_le_bytes());
        payload.extend_from_slice(value);
        self.add_point(InternalKey::new(user_key, sequence, ValueType::Value), &payload, timestamp, false)
    }

    /// Add a point deletion for `user_key` at `sequence`/`timestamp`.
    pub fn add_delete(&mut self, user_key: &[u8], sequence: u64, timestamp: u64) -> Result<(), SSTableError> {
        let payload = timestamp.to_le_bytes().to_vec();
        self.add_point(InternalKey::new(user_key, sequence, ValueType::Deletion), &payload, timestamp, true)
    }

    /// Add a low-level internal-key/value-payload record directly.
    fn add_point(&mut self, key: InternalKey, payload: &[u8], timestamp: u64, is_tombstone: bool) -> Result<(), SSTableError> {
        self.check_ok()?;
        if self.has_last_key && block::compare_internal_keys(&self.last_key, key.encoded()) != std::cmp::Ordering::Less {
            return self.fail("keys added to TableBuilder out of order".into());
        }

        self.data_block.add(key.encoded(), payload);
        self.filter_keys.push(key.user_key().to_vec());
        self.stats.observe_point(key.user_key(), key.sequence(), timestamp);
        if is_tombstone {
            self.stats.tombstone_count += 1;
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key.encoded());
        self.has_last_key = true;
        self.num_entries += 1;

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    /// Record a range deletion covering `[start, end)` at `sequence`/`timestamp`.
    ///
    /// A 4-arg signature — `start, end, sequence, timestamp` — rather than
    /// the 3-arg form a single-version key model would suggest, since this
    /// format folds the engine's separate LSN/timestamp pair into
    /// `sequence` (internal-key ordering) plus a timestamp carried in the
    /// record's value payload; see `DESIGN.md`.
    pub fn add_range_tombstone(&mut self, start: &[u8], end: &[u8], sequence: u64, timestamp: u64) -> Result<(), SSTableError> {
        self.check_ok()?;
        if start >= end {
            return self.fail("range tombstone start must be < end".into());
        }
        self.range_tombstones.push((start.to_vec(), end.to_vec(), sequence, timestamp));
        self.stats.range_tombstones_count += 1;
        Ok(())
    }

    fn flush_data_block(&mut self) -> Result<(), SSTableError> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let restart_interval = self.options.restart_interval;
        let finished = std::mem::replace(&mut self.data_block, BlockBuilder::new(restart_interval));
        let bytes = finished.finish();
        let handle = self.write_block(&bytes, self.options.compression != CompressionTag::None)?;
        self.index_block.add(&self.last_key, handle);
        Ok(())
    }

    /// Flush any remaining data, build the filter/range-deletion/properties/
    /// index/metaindex blocks, and write the footer.
    pub fn finish(mut self) -> Result<(), SSTableError> {
        self.check_ok()?;
        self.finished = true;
        self.flush_data_block()?;

        let filter_handle = if self.options.filter_bits_per_key > 0 && !self.filter_keys.is_empty() {
            let fp_rate = fp_rate_for_bits_per_key(self.options.filter_bits_per_key);
            let mut fb = FilterBuilder::new(self.filter_keys.len(), fp_rate)?;
            for key in &self.filter_keys {
                fb.add_user_key(key);
            }
            Some(self.write_block(&fb.finish(), false)?)
        } else {
            None
        };

        let range_del_handle = if !self.range_tombstones.is_empty() {
            let mut sorted = std::mem::take(&mut self.range_tombstones);
            sorted.sort_by(|a, b| a.0.cmp(&b.0).then(b.2.cmp(&a.2)));
            let mut block = BlockBuilder::new(self.options.restart_interval);
            for (start, end, sequence, timestamp) in &sorted {
                let key = InternalKey::new(start, *sequence, ValueType::RangeDeletion);
                let mut value = Vec::with_capacity(8 + end.len());
                value.extend_from_slice(&timestamp.to_le_bytes());
                value.extend_from_slice(end);
                block.add(key.encoded(), &value);
            }
            Some(self.write_block(&block.finish(), false)?)
        } else {
            None
        };

        let properties = SSTablePropertiesBlock {
            creation_timestamp: self.creation_timestamp,
            record_count: self.stats.record_count,
            tombstone_count: self.stats.tombstone_count,
            range_tombstones_count: self.stats.range_tombstones_count,
            min_lsn: self.stats.min_lsn,
            max_lsn: self.stats.max_lsn,
            min_timestamp: self.stats.min_timestamp,
            max_timestamp: self.stats.max_timestamp,
            min_key: self.stats.min_key.clone().unwrap_or_default(),
            max_key: self.stats.max_key.clone().unwrap_or_default(),
            index_partitions: 0,
            comparator_name: self.options.comparator_name.clone(),
            column_family_id: self.options.column_family_id,
            column_family_name: self.options.column_family_name.clone(),
            filter_policy_name: if filter_handle.is_some() { self.options.filter_policy_name.clone() } else { String::new() },
        };
        let properties_handle = self.write_block(&properties.encode(), false)?;

        let index_bytes = std::mem::replace(&mut self.index_block, IndexBlockBuilder::new(self.options.restart_interval)).finish();
        let index_handle = self.write_block(&index_bytes, false)?;

        let index_in_metaindex = self.options.format_version >= INDEX_VALUE_DELTA_MIN_FORMAT;

        let mut metaindex_entries = vec![(META_PROPERTIES_NAME.to_string(), properties_handle)];
        if let Some(h) = range_del_handle {
            metaindex_entries.push((META_RANGE_DEL_NAME.to_string(), h));
        }
        if let Some(h) = filter_handle {
            metaindex_entries.push((format!("{META_FILTER_PREFIX}{}", self.options.filter_policy_name), h));
        }
        if index_in_metaindex {
            metaindex_entries.push((META_INDEX_NAME.to_string(), index_handle));
        }
        metaindex_entries.sort_by(|a, b| a.0.cmp(&b.0));

        let metaindex_handle = self.write_block(&encode_metaindex(&metaindex_entries), false)?;

        let footer = Footer {
            metaindex_handle,
            legacy_index_handle: if index_in_metaindex { BlockHandle::NULL } else { index_handle },
            format_version: self.options.format_version,
            checksum_type: self.options.checksum_type,
            base_context_checksum: self.base_context_checksum,
        };
        let footer_bytes = footer.encode();
        self.writer.write_all(&footer_bytes)?;
        self.offset += footer_bytes.len() as u64;
        self.writer.flush()?;
        Ok(())
    }

    /// Discard this builder without writing a footer. The writer is simply
    /// dropped; any bytes already written are the caller's responsibility
    /// to clean up (the [`SstWriter`] adapter never calls this — it writes
    /// to a `.tmp` path and only renames it into place on success).
    pub fn abandon(mut self) {
        self.finished = true;
        self.status = Err("abandoned".to_string());
    }

    fn write_block(&mut self, content: &[u8], compress: bool) -> Result<BlockHandle, SSTableError> {
        let tag = if compress { self.options.compression } else { CompressionTag::None };
        let (final_tag, payload) = if tag == CompressionTag::None {
            (CompressionTag::None, content.to_vec())
        } else {
            match compression::compress(tag, content) {
                Ok(compressed) if compressed.len() < content.len() => {
                    let mut payload = Vec::with_capacity(compressed.len() + 5);
                    if !tag.embeds_size() {
                        block::put_varint32(&mut payload, content.len() as u32);
                    }
                    payload.extend_from_slice(&compressed);
                    (tag, payload)
                }
                _ => (CompressionTag::None, content.to_vec()),
            }
        };

        let offset = self.offset;
        let checksum = checksum::block_checksum(
            self.options.checksum_type,
            &payload,
            final_tag as u8,
            self.base_context_checksum,
            offset,
        );
        self.writer.write_all(&payload)?;
        self.writer.write_all(&[final_tag as u8])?;
        self.writer.write_all(&checksum.to_le_bytes())?;
        self.offset += payload.len() as u64 + BLOCK_TRAILER_LEN as u64;

        Ok(BlockHandle { offset, size: payload.len() as u64 })
    }

    fn check_ok(&self) -> Result<(), SSTableError> {
        if self.finished {
            return Err(SSTableError::InvalidArgument("TableBuilder already finished".into()));
        }
        self.status.clone().map_err(SSTableError::InvalidArgument)
    }

    fn fail(&mut self, msg: String) -> Result<(), SSTableError> {
        self.status = Err(msg.clone());
        Err(SSTableError::InvalidArgument(msg))
    }
}

/// Thin adapter preserving the call shape `SstWriter::new(path).build(...)`
/// used by `engine::mod` and `compaction::mod` — writes atomically via a
/// `.tmp` file renamed into place once [`TableBuilder::finish`] succeeds.
pub struct SstWriter<P: AsRef<Path>> {
    path: P,
}

impl<P: AsRef<Path>> SstWriter<P> {
    /// Target the final SST path. Nothing is written until [`Self::build`].
    pub fn new(path: P) -> Self {
        Self { path }
    }

    /// Build the table from sorted point-entry and range-tombstone streams.
    /// Both streams must be in ascending-key order, exactly as produced by
    /// a memtable flush or a compaction merge.
    pub fn build(
        self,
        point_entries: impl Iterator<Item = PointEntry>,
        _point_count: usize,
        range_tombstones: impl Iterator<Item = RangeTombstone>,
        _range_count: usize,
    ) -> Result<(), SSTableError> {
        let final_path = self.path.as_ref();
        let tmp_path = final_path.with_extension("tmp");

        let file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp_path)?;
        let sync_handle = file.try_clone()?;
        let writer = BufWriter::new(file);
        let mut builder = TableBuilder::new(writer, TableOptions::default())?;

        for pe in point_entries {
            match pe.value {
                Some(value) => builder.add_put(&pe.key, &value, pe.lsn, pe.timestamp)?,
                None => builder.add_delete(&pe.key, pe.lsn, pe.timestamp)?,
            }
        }
        for rt in range_tombstones {
            builder.add_range_tombstone(&rt.start, &rt.end, rt.lsn, rt.timestamp)?;
        }

        builder.finish()?;
        sync_handle.sync_all()?;

        std::fs::rename(&tmp_path, final_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sstable::{GetResult, SSTable};
    use tempfile::NamedTempFile;

    #[test]
    fn builder_rejects_out_of_order_keys() {
        let tmp = NamedTempFile::new().unwrap();
        let mut builder = TableBuilder::new(tmp.reopen().unwrap(), TableOptions::default()).unwrap();
        builder.add_put(b"b", b"1", 1, 1).unwrap();
        let err = builder.add_put(b"a", b"2", 2, 2).unwrap_err();
        assert!(matches!(err, SSTableError::InvalidArgument(_)));
    }

    #[test]
    fn builder_rejects_degenerate_range_tombstone() {
        let tmp = NamedTempFile::new().unwrap();
        let mut builder = TableBuilder::new(tmp.reopen().unwrap(), TableOptions::default()).unwrap();
        let err = builder.add_range_tombstone(b"z", b"a", 1, 1).unwrap_err();
        assert!(matches!(err, SSTableError::InvalidArgument(_)));
    }

    #[test]
    fn finished_table_round_trips_through_sstable_open() {
        let tmp = NamedTempFile::new().unwrap();
        let mut builder = TableBuilder::new(tmp.reopen().unwrap(), TableOptions::default()).unwrap();
        for i in 0..200u64 {
            let key = format!("key{i:05}");
            builder.add_put(key.as_bytes(), b"value", i, i).unwrap();
        }
        builder.finish().unwrap();

        let table = SSTable::open(tmp.path()).unwrap();
        assert_eq!(table.properties.record_count, 200);
        assert_eq!(table.properties.min_key, b"key00000");
        assert_eq!(table.properties.max_key, b"key00199");
    }

    #[test]
    fn sst_writer_writes_atomically_via_tmp_rename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.sst");
        let points = vec![PointEntry { key: b"a".to_vec(), value: Some(b"1".to_vec()), lsn: 1, timestamp: 1 }];
        let ranges: Vec<RangeTombstone> = Vec::new();

        SstWriter::new(&path).build(points.into_iter(), 1, ranges.into_iter(), 0).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let table = SSTable::open(&path).unwrap();
        assert_eq!(table.get(b"a").unwrap(), GetResult::Put { value: b"1".to_vec(), lsn: 1, timestamp: 1 });
    }
}
