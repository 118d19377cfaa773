//! Refcounted, bounded cache of open [`SSTable`] handles.
//!
//! Opening an SSTable means `mmap`-ing its file and parsing its footer,
//! metaindex, properties, filter, and range-deletion blocks. Compaction and
//! point lookups both need the same tables repeatedly, so this module keeps
//! a bounded set of them open and shares the parsed [`SSTable`] across
//! callers via reference-counted handles.
//!
//! # Design
//!
//! `TableCache` is a single `Mutex`-guarded map from `file_number` to
//! [`CacheEntry`], plus a `Vec<u64>` recording the LRU order (most-recently
//! used at the back). A `Vec`-backed LRU list is `O(n)` to reorder on every
//! hit, which is fine at the table counts this crate deals with (tens to
//! low thousands of SSTables); a real intrusive doubly-linked list would
//! only pay for itself at far larger scale.
//!
//! Callers never see a bare `Arc<SSTable>` — they get a [`TableHandle`]
//! whose `Drop` calls [`TableCache::release`], so a table can never be
//! evicted while someone holds a reference to it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, trace};

use crate::sstable::{SSTable, SSTableError};

/// Errors produced by [`TableCache`] operations.
#[derive(Debug, Error)]
pub enum TableCacheError {
    /// Failed to open the underlying SSTable.
    #[error("failed to open table {file_number}: {source}")]
    Open {
        /// The file number that failed to open.
        file_number: u64,
        /// The underlying SSTable error.
        #[source]
        source: SSTableError,
    },

    /// Internal invariant violation (poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Filesystem access injected into [`TableCache`] so tests can substitute a
/// tempdir-backed or in-memory implementation without real eviction races.
pub trait TableCacheFs: Send + Sync {
    /// Opens the SSTable for `file_number` located at `path`.
    fn open_table(&self, file_number: u64, path: &Path) -> Result<SSTable, SSTableError>;
}

/// Default filesystem implementation: opens the table with [`SSTable::open`].
#[derive(Debug, Default)]
pub struct RealTableCacheFs;

impl TableCacheFs for RealTableCacheFs {
    fn open_table(&self, file_number: u64, path: &Path) -> Result<SSTable, SSTableError> {
        let mut table = SSTable::open(path)?;
        table.id = file_number;
        Ok(table)
    }
}

struct CacheEntry {
    table: Arc<SSTable>,
    path: PathBuf,
    refs: usize,
}

struct Inner {
    entries: HashMap<u64, CacheEntry>,
    lru: Vec<u64>,
    capacity: usize,
}

impl Inner {
    fn touch(&mut self, file_number: u64) {
        if let Some(pos) = self.lru.iter().position(|n| *n == file_number) {
            self.lru.remove(pos);
        }
        self.lru.push(file_number);
    }

    fn forget(&mut self, file_number: u64) {
        if let Some(pos) = self.lru.iter().position(|n| *n == file_number) {
            self.lru.remove(pos);
        }
    }

    /// Evicts the least-recently-used entry with zero outstanding refs, if
    /// the cache is over capacity. Entries still referenced by a live
    /// [`TableHandle`] are skipped.
    fn evict_if_over_capacity(&mut self) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() > self.capacity {
            let Some(victim) = self.lru.iter().copied().find(|n| {
                self.entries.get(n).map(|e| e.refs == 0).unwrap_or(false)
            }) else {
                break;
            };
            self.forget(victim);
            self.entries.remove(&victim);
            trace!(file_number = victim, "table_cache: evicted over capacity");
        }
    }
}

/// Bounded, refcounted cache of open [`SSTable`] handles, keyed by the
/// manifest's `file_number`.
pub struct TableCache {
    inner: Mutex<Inner>,
    fs: Box<dyn TableCacheFs>,
}

impl TableCache {
    /// Creates a new cache that keeps at most `capacity` tables open at
    /// once (`0` means unbounded — entries are only dropped on explicit
    /// [`Self::evict`] or [`Self::close`]).
    pub fn new(capacity: usize) -> Self {
        Self::with_fs(capacity, Box::new(RealTableCacheFs))
    }

    /// Creates a cache backed by a custom [`TableCacheFs`] implementation,
    /// for tests.
    pub fn with_fs(capacity: usize, fs: Box<dyn TableCacheFs>) -> Self {
        Self {
            inner: Mutex::new(Inner { entries: HashMap::new(), lru: Vec::new(), capacity }),
            fs,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, TableCacheError> {
        self.inner.lock().map_err(|_| TableCacheError::Internal("table_cache mutex poisoned".into()))
    }

    /// Returns a handle to the table for `file_number`, opening and caching
    /// it on a miss. On a hit, bumps the entry to the head of the LRU order.
    pub fn get(&self, file_number: u64, path: &Path) -> Result<TableHandle<'_>, TableCacheError> {
        let mut guard = self.lock()?;

        if let Some(entry) = guard.entries.get_mut(&file_number) {
            entry.refs += 1;
            let table = Arc::clone(&entry.table);
            guard.touch(file_number);
            trace!(file_number, "table_cache: hit");
            return Ok(TableHandle { cache: self, file_number, table });
        }

        drop(guard);
        let table = self
            .fs
            .open_table(file_number, path)
            .map_err(|source| TableCacheError::Open { file_number, source })?;
        let table = Arc::new(table);

        let mut guard = self.lock()?;
        // Another thread may have raced us to open the same table; prefer
        // whichever entry is already resident so only one `SSTable` survives.
        let resident = guard.entries.entry(file_number).or_insert_with(|| CacheEntry {
            table: Arc::clone(&table),
            path: path.to_path_buf(),
            refs: 0,
        });
        resident.refs += 1;
        let table = Arc::clone(&resident.table);
        guard.touch(file_number);
        guard.evict_if_over_capacity();
        debug!(file_number, path = %path.display(), "table_cache: opened and cached");

        Ok(TableHandle { cache: self, file_number, table })
    }

    /// Decrements the reference count for `file_number`. Called by
    /// [`TableHandle::drop`]; not normally called directly.
    fn release(&self, file_number: u64) {
        let Ok(mut guard) = self.lock() else { return };
        if let Some(entry) = guard.entries.get_mut(&file_number) {
            entry.refs = entry.refs.saturating_sub(1);
        }
        guard.evict_if_over_capacity();
    }

    /// Unconditionally removes `file_number` from the cache, regardless of
    /// its refcount. Outstanding [`TableHandle`]s keep their own `Arc` and
    /// remain valid; the table is simply no longer found on the next
    /// [`Self::get`]. Used when a compaction drops an SSTable.
    pub fn evict(&self, file_number: u64) -> Result<(), TableCacheError> {
        let mut guard = self.lock()?;
        guard.forget(file_number);
        guard.entries.remove(&file_number);
        debug!(file_number, "table_cache: evicted");
        Ok(())
    }

    /// Drops every cached table, regardless of refcount. Call this when
    /// shutting the engine down.
    pub fn close(&self) -> Result<(), TableCacheError> {
        let mut guard = self.lock()?;
        guard.entries.clear();
        guard.lru.clear();
        Ok(())
    }

    /// Returns the number of distinct tables currently resident.
    pub fn len(&self) -> Result<usize, TableCacheError> {
        Ok(self.lock()?.entries.len())
    }

    /// Returns `true` if no tables are currently resident.
    pub fn is_empty(&self) -> Result<bool, TableCacheError> {
        Ok(self.len()? == 0)
    }

    /// Returns the on-disk path of a resident table, if cached.
    pub fn path_of(&self, file_number: u64) -> Result<Option<PathBuf>, TableCacheError> {
        Ok(self.lock()?.entries.get(&file_number).map(|e| e.path.clone()))
    }
}

/// RAII guard over a cached [`SSTable`]. Dereferences to the table; calls
/// [`TableCache::release`] on drop so the entry becomes eligible for
/// eviction once every handle is gone.
pub struct TableHandle<'a> {
    cache: &'a TableCache,
    file_number: u64,
    table: Arc<SSTable>,
}

impl std::ops::Deref for TableHandle<'_> {
    type Target = SSTable;

    fn deref(&self) -> &Self::Target {
        &self.table
    }
}

impl Drop for TableHandle<'_> {
    fn drop(&mut self) {
        self.cache.release(self.file_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{PointEntry, RangeTombstone};
    use crate::sstable::SstWriter;
    use tempfile::TempDir;

    fn write_table(dir: &Path, file_number: u64) -> PathBuf {
        let path = dir.join(format!("{file_number:06}.sst"));
        let entries = vec![PointEntry { key: b"k".to_vec(), value: Some(b"v".to_vec()), lsn: 1, timestamp: 1 }];
        SstWriter::new(&path)
            .build(entries.into_iter(), 1, Vec::<RangeTombstone>::new().into_iter(), 0)
            .unwrap();
        path
    }

    #[test]
    fn miss_then_hit_reuses_same_table() {
        let tmp = TempDir::new().unwrap();
        let path = write_table(tmp.path(), 1);
        let cache = TableCache::new(0);

        let h1 = cache.get(1, &path).unwrap();
        assert_eq!(cache.len().unwrap(), 1);
        let h2 = cache.get(1, &path).unwrap();
        assert!(Arc::ptr_eq(&h1.table, &h2.table));
        drop(h1);
        drop(h2);
    }

    #[test]
    fn evict_removes_entry_but_outstanding_handle_stays_valid() {
        let tmp = TempDir::new().unwrap();
        let path = write_table(tmp.path(), 1);
        let cache = TableCache::new(0);

        let handle = cache.get(1, &path).unwrap();
        cache.evict(1).unwrap();
        assert_eq!(cache.len().unwrap(), 0);
        assert_eq!(handle.get(b"k").unwrap(), crate::sstable::GetResult::Put { value: b"v".to_vec(), lsn: 1, timestamp: 1 });
    }

    #[test]
    fn capacity_bound_evicts_unreferenced_lru_entry() {
        let tmp = TempDir::new().unwrap();
        let p1 = write_table(tmp.path(), 1);
        let p2 = write_table(tmp.path(), 2);
        let cache = TableCache::new(1);

        let h1 = cache.get(1, &p1).unwrap();
        drop(h1);
        let _h2 = cache.get(2, &p2).unwrap();

        assert_eq!(cache.len().unwrap(), 1);
        assert!(cache.path_of(1).unwrap().is_none());
        assert!(cache.path_of(2).unwrap().is_some());
    }

    #[test]
    fn close_drops_every_entry() {
        let tmp = TempDir::new().unwrap();
        let path = write_table(tmp.path(), 1);
        let cache = TableCache::new(0);
        let handle = cache.get(1, &path).unwrap();
        drop(handle);
        cache.close().unwrap();
        assert_eq!(cache.len().unwrap(), 0);
    }
}
