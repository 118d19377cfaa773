//! Table-level iterators: a two-level index-then-data cursor
//! ([`TableIterator`]) and a range scan that merges point entries with
//! range tombstones ([`ScanIterator`]), generalizing the teacher's single
//! merge-scan iterator to the block-based format.

use crate::block::{self, BlockHandle, IndexBlockIterator, InternalKey, ValueType};
use crate::engine::{PointEntry, RangeTombstone, Record};

use super::{decode_point_entry, GetResult, SSTable, SSTableError};

/// A two-level iterator: walks the index block to find each data block in
/// turn, then walks that block's records in ascending internal-key order.
///
/// Does not hold a live [`block::BlockIterator`] across calls — each step
/// re-seeks a transient one against the owned, already-decompressed block
/// bytes using the last-yielded key, which keeps the struct free of
/// self-referential lifetimes at the cost of an extra `O(log b)` reseek
/// per record (`b` = records per block).
pub struct TableIterator<'a> {
    table: &'a SSTable,
    index_iter: IndexBlockIterator<'a>,
    current_block: Option<Vec<u8>>,
    current_key: Vec<u8>,
    current_value: Vec<u8>,
    valid: bool,
}

impl<'a> TableIterator<'a> {
    pub(crate) fn new(table: &'a SSTable) -> Self {
        Self {
            table,
            index_iter: IndexBlockIterator::new(table.index_block_bytes()),
            current_block: None,
            current_key: Vec::new(),
            current_value: Vec::new(),
            valid: false,
        }
    }

    /// Whether the iterator currently sits on a valid record.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// The current record's encoded internal key.
    pub fn key(&self) -> &[u8] {
        &self.current_key
    }

    /// The current record's value bytes.
    pub fn value(&self) -> &[u8] {
        &self.current_value
    }

    /// Position at the first record in the table.
    pub fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.load_block_and_position(None);
    }

    /// Position at the last record in the table.
    pub fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.load_last_block_and_position();
    }

    /// Position at the first record whose internal key is ≥ `target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.load_block_and_position(Some(target.to_vec()));
    }

    /// Advance to the next record.
    pub fn next(&mut self) {
        if !self.valid {
            return;
        }
        let bytes = match self.current_block.take() {
            Some(b) => b,
            None => {
                self.invalidate();
                return;
            }
        };
        let mut it = block::BlockIterator::new(&bytes);
        it.seek(&self.current_key);
        it.next();
        if it.valid() {
            self.current_key = it.key().to_vec();
            self.current_value = it.value().to_vec();
            self.current_block = Some(bytes);
        } else {
            drop(it);
            drop(bytes);
            self.index_iter.next();
            self.load_block_and_position(None);
        }
    }

    /// Move to the previous record. On crossing a data block's start,
    /// steps the index iterator back and repositions at the previous
    /// block's last record — symmetric to how `next()` crosses a block
    /// end by stepping the index iterator forward.
    pub fn prev(&mut self) {
        if !self.valid {
            return;
        }
        let bytes = match self.current_block.take() {
            Some(b) => b,
            None => {
                self.invalidate();
                return;
            }
        };
        let mut it = block::BlockIterator::new(&bytes);
        it.seek(&self.current_key);
        it.prev();
        if it.valid() {
            self.current_key = it.key().to_vec();
            self.current_value = it.value().to_vec();
            self.current_block = Some(bytes);
        } else {
            drop(it);
            drop(bytes);
            self.index_iter.prev();
            self.load_last_block_and_position();
        }
    }

    fn load_block_and_position(&mut self, target: Option<Vec<u8>>) {
        loop {
            if !self.index_iter.valid() {
                self.invalidate();
                return;
            }
            let handle: BlockHandle = self.index_iter.handle();
            let bytes = match self.table.read_block(&handle) {
                Ok(b) => b,
                Err(_) => {
                    self.invalidate();
                    return;
                }
            };
            let mut it = block::BlockIterator::new(&bytes);
            match &target {
                Some(t) => it.seek(t),
                None => it.seek_to_first(),
            }
            if it.valid() {
                self.current_key = it.key().to_vec();
                self.current_value = it.value().to_vec();
                self.current_block = Some(bytes);
                self.valid = true;
                return;
            }
            self.index_iter.next();
        }
    }

    /// Like `load_block_and_position`, but walks the index iterator
    /// *backward* over empty blocks and positions at each candidate
    /// block's last record rather than its first.
    fn load_last_block_and_position(&mut self) {
        loop {
            if !self.index_iter.valid() {
                self.invalidate();
                return;
            }
            let handle: BlockHandle = self.index_iter.handle();
            let bytes = match self.table.read_block(&handle) {
                Ok(b) => b,
                Err(_) => {
                    self.invalidate();
                    return;
                }
            };
            let mut it = block::BlockIterator::new(&bytes);
            it.seek_to_last();
            if it.valid() {
                self.current_key = it.key().to_vec();
                self.current_value = it.value().to_vec();
                self.current_block = Some(bytes);
                self.valid = true;
                return;
            }
            self.index_iter.prev();
        }
    }

    fn invalidate(&mut self) {
        self.valid = false;
        self.current_block = None;
        self.current_key.clear();
        self.current_value.clear();
    }
}

/// Forward range scan over `[start_key, end_key)`, merging this table's
/// point entries with its range tombstones in `(user key ascending, lsn
/// descending)` order — the same merge-by-key-then-recency rule the
/// engine uses across memtables and SSTs.
pub struct ScanIterator<'a> {
    point_iter: TableIterator<'a>,
    point_done: bool,
    pending_point: Option<PointEntry>,
    range_tombstones: std::vec::IntoIter<RangeTombstone>,
    pending_range: Option<RangeTombstone>,
    end_key: Vec<u8>,
}

impl<'a> ScanIterator<'a> {
    pub(crate) fn new(table: &'a SSTable, start_key: Vec<u8>, end_key: Vec<u8>) -> Result<Self, SSTableError> {
        let mut point_iter = table.new_iterator();
        let seek_target = InternalKey::new(&start_key, u64::MAX, ValueType::Other(0xFF));
        point_iter.seek(seek_target.encoded());

        let mut range_tombstones: Vec<RangeTombstone> = table
            .range_tombstone_iter()
            .filter(|rt| rt.start.as_slice() < end_key.as_slice() && rt.end.as_slice() > start_key.as_slice())
            .collect();
        range_tombstones.sort_by(|a, b| a.start.cmp(&b.start).then(b.lsn.cmp(&a.lsn)));

        let mut iter = Self {
            point_iter,
            point_done: false,
            pending_point: None,
            range_tombstones: range_tombstones.into_iter(),
            pending_range: None,
            end_key,
        };
        iter.fill_point()?;
        iter.pending_range = iter.range_tombstones.next();
        Ok(iter)
    }

    fn fill_point(&mut self) -> Result<(), SSTableError> {
        if self.point_done {
            self.pending_point = None;
            return Ok(());
        }
        if !self.point_iter.valid() {
            self.point_done = true;
            self.pending_point = None;
            return Ok(());
        }
        let key = InternalKey::from_encoded(self.point_iter.key().to_vec())
            .ok_or_else(|| SSTableError::Corruption("short internal key in block".into()))?;
        if key.user_key() >= self.end_key.as_slice() {
            self.point_done = true;
            self.pending_point = None;
            return Ok(());
        }
        let result = decode_point_entry(&key, self.point_iter.value())?;
        self.pending_point = Some(match result {
            GetResult::Put { value, lsn, timestamp } => {
                PointEntry { key: key.user_key().to_vec(), value: Some(value), lsn, timestamp }
            }
            GetResult::Delete { lsn, timestamp } => {
                PointEntry { key: key.user_key().to_vec(), value: None, lsn, timestamp }
            }
            _ => unreachable!("decode_point_entry only returns Put/Delete"),
        });
        self.point_iter.next();
        Ok(())
    }
}

impl Iterator for ScanIterator<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Self::Item> {
        match (&self.pending_point, &self.pending_range) {
            (None, None) => None,
            (Some(p), None) => Some(self.take_point(p.clone())),
            (None, Some(r)) => Some(self.take_range(r.clone())),
            (Some(p), Some(r)) => {
                if p.key.as_slice() < r.start.as_slice() || (p.key == r.start && p.lsn >= r.lsn) {
                    Some(self.take_point(p.clone()))
                } else {
                    Some(self.take_range(r.clone()))
                }
            }
        }
    }
}

impl ScanIterator<'_> {
    fn take_point(&mut self, p: PointEntry) -> Record {
        let record = match p.value {
            Some(value) => Record::Put { key: p.key, value, lsn: p.lsn, timestamp: p.timestamp },
            None => Record::Delete { key: p.key, lsn: p.lsn, timestamp: p.timestamp },
        };
        // A post-yield decode error just ends the scan early rather than panicking mid-iteration.
        let _ = self.fill_point();
        record
    }

    fn take_range(&mut self, r: RangeTombstone) -> Record {
        self.pending_range = self.range_tombstones.next();
        Record::RangeDelete { start: r.start, end: r.end, lsn: r.lsn, timestamp: r.timestamp }
    }
}
