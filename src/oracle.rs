//! Expected-state model used by the stress harness to validate the engine
//! against an independent in-memory reference.
//!
//! The oracle holds one `value_base` + flag set per `(column_family, key)`,
//! striped across `2^log2_locks` independent locks so concurrent stress
//! workers touching unrelated keys don't serialize on each other. Every
//! mutation goes through a `Prepare* -> Commit`/`Rollback` handshake so the
//! oracle's state always reflects exactly what the engine was *told* to do,
//! never what it is assumed to have done.
//!
//! Persistence follows the same atomic `.tmp` -> `rename` -> directory
//! `fsync` discipline as [`crate::manifest::Manifest::checkpoint`], encoded
//! with the crate's own [`crate::encoding`] framework rather than an
//! external serialization crate, for the same "we own this wire format"
//! reason `encoding/mod.rs` documents.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::RwLock;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info};

use crate::encoding::{self, Decode, Encode, EncodingError};

/// Errors produced by oracle operations.
#[derive(Debug, Error)]
pub enum OracleError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding/decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The loaded snapshot's checksum did not match its contents.
    #[error("oracle snapshot checksum mismatch")]
    ChecksumMismatch,

    /// Internal invariant violation (poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Snapshot of a single key's expected state.
///
/// `value_base` is a per-key monotonically-increasing tag identifying which
/// logical write is expected to be currently visible. `exists`/`deleted`
/// are the committed state; `pending_write`/`pending_delete` mark an
/// in-flight mutation that has not yet been committed or rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExpectedValue {
    /// Monotonically-increasing tag of the expected logical write.
    pub value_base: u32,
    /// Whether the key is expected to currently hold a value.
    pub exists: bool,
    /// Whether the key is expected to have been deleted.
    pub deleted: bool,
    /// An uncommitted put is in flight for this key.
    pub pending_write: bool,
    /// An uncommitted delete is in flight for this key.
    pub pending_delete: bool,
}

impl Encode for ExpectedValue {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.value_base.encode_to(buf)?;
        self.exists.encode_to(buf)?;
        self.deleted.encode_to(buf)?;
        self.pending_write.encode_to(buf)?;
        self.pending_delete.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for ExpectedValue {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (value_base, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (exists, n) = bool::decode_from(&buf[offset..])?;
        offset += n;
        let (deleted, n) = bool::decode_from(&buf[offset..])?;
        offset += n;
        let (pending_write, n) = bool::decode_from(&buf[offset..])?;
        offset += n;
        let (pending_delete, n) = bool::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { value_base, exists, deleted, pending_write, pending_delete }, offset))
    }
}

type StripeMap = HashMap<(u32, Vec<u8>), ExpectedValue>;

/// Fixed array of striped locks holding the expected state of every
/// `(column_family, key)` pair touched by the stress harness.
pub struct Oracle {
    stripes: Vec<RwLock<StripeMap>>,
    log2_locks: u32,
    mask: usize,
}

enum PendingKind {
    Put { next_value_base: u32 },
    Delete,
}

/// A handle over an in-flight mutation, returned by [`Oracle::prepare_put`]
/// / [`Oracle::prepare_delete`]. Holds the stripe's write lock until
/// [`Self::commit`] or [`Self::rollback`] consumes it, so at most one
/// pending mutation can be outstanding per stripe at a time.
pub struct PendingValue<'a> {
    guard: std::sync::RwLockWriteGuard<'a, StripeMap>,
    key: (u32, Vec<u8>),
    kind: PendingKind,
}

impl<'a> PendingValue<'a> {
    /// For a pending put, the `value_base` that will become visible on
    /// commit. `None` for a pending delete.
    pub fn next_value_base(&self) -> Option<u32> {
        match self.kind {
            PendingKind::Put { next_value_base } => Some(next_value_base),
            PendingKind::Delete => None,
        }
    }

    /// Commits the prepared mutation: a put becomes `exists` with its
    /// `value_base` advanced; a delete becomes `deleted`.
    pub fn commit(mut self) {
        if let Some(entry) = self.guard.get_mut(&self.key) {
            match self.kind {
                PendingKind::Put { next_value_base } => {
                    entry.exists = true;
                    entry.deleted = false;
                    entry.value_base = next_value_base;
                    entry.pending_write = false;
                }
                PendingKind::Delete => {
                    entry.exists = false;
                    entry.deleted = true;
                    entry.pending_delete = false;
                }
            }
        }
    }

    /// Rolls back the prepared mutation: the pending flag is cleared and
    /// no other state changes, leaving `Get` identical to before `prepare`.
    pub fn rollback(mut self) {
        if let Some(entry) = self.guard.get_mut(&self.key) {
            match self.kind {
                PendingKind::Put { .. } => entry.pending_write = false,
                PendingKind::Delete => entry.pending_delete = false,
            }
        }
    }
}

impl Drop for PendingValue<'_> {
    fn drop(&mut self) {
        // Safety net: if neither `commit` nor `rollback` ran (e.g. the
        // handle was dropped after a panic), don't leave the key stuck
        // with a pending flag set.
        if let Some(entry) = self.guard.get_mut(&self.key) {
            entry.pending_write = false;
            entry.pending_delete = false;
        }
    }
}

impl Oracle {
    /// Creates a new oracle with `2^log2_locks` stripes, all keys starting
    /// in the "never existed" state.
    pub fn new(log2_locks: u32) -> Self {
        let n = 1usize << log2_locks;
        Self {
            stripes: (0..n).map(|_| RwLock::new(HashMap::new())).collect(),
            log2_locks,
            mask: n - 1,
        }
    }

    fn stripe_index(&self, cf: u32, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        cf.hash(&mut hasher);
        key.hash(&mut hasher);
        (hasher.finish() as usize) & self.mask
    }

    fn lock_write(&self, idx: usize) -> std::sync::RwLockWriteGuard<'_, StripeMap> {
        self.stripes[idx].write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_read(&self, idx: usize) -> std::sync::RwLockReadGuard<'_, StripeMap> {
        self.stripes[idx].read().unwrap_or_else(|e| e.into_inner())
    }

    /// Read-only snapshot of a key's expected state. Never blocks behind a
    /// held [`PendingValue`] longer than it takes that writer to finish.
    pub fn get(&self, cf: u32, key: &[u8]) -> ExpectedValue {
        let idx = self.stripe_index(cf, key);
        let guard = self.lock_read(idx);
        guard.get(&(cf, key.to_vec())).copied().unwrap_or_default()
    }

    /// Begins a put: marks `pending_write` and hands back a handle carrying
    /// the value_base this put will commit as.
    pub fn prepare_put(&self, cf: u32, key: &[u8]) -> PendingValue<'_> {
        let idx = self.stripe_index(cf, key);
        let mut guard = self.lock_write(idx);
        let map_key = (cf, key.to_vec());
        let current = guard.get(&map_key).copied().unwrap_or_default();
        let next_value_base = current.value_base.wrapping_add(1);
        let entry = guard.entry(map_key.clone()).or_default();
        entry.pending_write = true;
        PendingValue { guard, key: map_key, kind: PendingKind::Put { next_value_base } }
    }

    /// Begins a delete: marks `pending_delete`.
    pub fn prepare_delete(&self, cf: u32, key: &[u8]) -> PendingValue<'_> {
        let idx = self.stripe_index(cf, key);
        let mut guard = self.lock_write(idx);
        let map_key = (cf, key.to_vec());
        guard.entry(map_key.clone()).or_default().pending_delete = true;
        PendingValue { guard, key: map_key, kind: PendingKind::Delete }
    }

    /// Number of stripes (`2^log2_locks`).
    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// Iterates every `(cf, key, ExpectedValue)` triple currently tracked,
    /// locking one stripe at a time. Used by final verification and by
    /// [`Self::save_to_file`].
    pub fn for_each<F: FnMut(u32, &[u8], ExpectedValue)>(&self, mut f: F) {
        for stripe in &self.stripes {
            let guard = stripe.read().unwrap_or_else(|e| e.into_inner());
            for ((cf, key), value) in guard.iter() {
                f(*cf, key, *value);
            }
        }
    }

    /// Atomically persists the oracle's full state to `path` via a
    /// `.tmp` file, `fsync`, `rename`, then an `fsync` of the parent
    /// directory — the same discipline [`crate::manifest::Manifest::checkpoint`]
    /// uses for its snapshot file.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), OracleError> {
        let path = path.as_ref();
        let mut entries = Vec::new();
        self.for_each(|cf, key, value| entries.push(OracleEntry { cf, key: key.to_vec(), value }));

        let snapshot = OracleSnapshot { log2_locks: self.log2_locks, entries, checksum: 0 };
        let mut bytes = encoding::encode_to_vec(&snapshot)?;

        let mut hasher = Crc32::new();
        hasher.update(&bytes);
        let checksum = hasher.finalize();
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(&checksum.to_le_bytes());

        let tmp_path = path.with_extension("tmp");
        {
            let mut f = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        if let Some(dir) = path.parent() {
            if dir.as_os_str().len() > 0 {
                File::open(dir)?.sync_all()?;
            }
        }

        debug!(path = %path.display(), entries = snapshot.entries.len(), "oracle: snapshot saved");
        Ok(())
    }

    /// Loads an oracle previously written by [`Self::save_to_file`].
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, OracleError> {
        let mut file = File::open(path.as_ref())?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let (snapshot, _) = encoding::decode_from_slice::<OracleSnapshot>(&bytes)?;

        let verify = OracleSnapshot { log2_locks: snapshot.log2_locks, entries: snapshot.entries.clone(), checksum: 0 };
        let verify_bytes = encoding::encode_to_vec(&verify)?;
        let mut hasher = Crc32::new();
        hasher.update(&verify_bytes);
        if hasher.finalize() != snapshot.checksum {
            return Err(OracleError::ChecksumMismatch);
        }

        let oracle = Oracle::new(snapshot.log2_locks);
        for entry in snapshot.entries {
            let idx = oracle.stripe_index(entry.cf, &entry.key);
            oracle.stripes[idx].write().map_err(|_| OracleError::Internal("stripe mutex poisoned".into()))?.insert((entry.cf, entry.key), entry.value);
        }

        info!(path = %path.as_ref().display(), "oracle: snapshot loaded");
        Ok(oracle)
    }
}

struct OracleEntry {
    cf: u32,
    key: Vec<u8>,
    value: ExpectedValue,
}

impl Clone for OracleEntry {
    fn clone(&self) -> Self {
        Self { cf: self.cf, key: self.key.clone(), value: self.value }
    }
}

impl Encode for OracleEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.cf.encode_to(buf)?;
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for OracleEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (cf, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = ExpectedValue::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { cf, key, value }, offset))
    }
}

struct OracleSnapshot {
    log2_locks: u32,
    entries: Vec<OracleEntry>,
    checksum: u32,
}

impl Encode for OracleSnapshot {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.log2_locks.encode_to(buf)?;
        encoding::encode_vec(&self.entries, buf)?;
        self.checksum.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for OracleSnapshot {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (log2_locks, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (entries, n) = encoding::decode_vec::<OracleEntry>(&buf[offset..])?;
        offset += n;
        let (checksum, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { log2_locks, entries, checksum }, offset))
    }
}

/// True iff the key provably existed for the entire window spanning `pre`
/// and `post` — neither snapshot is ambiguous (mid-transition) and both
/// report `exists`.
pub fn must_have_existed(pre: &ExpectedValue, post: &ExpectedValue) -> bool {
    !is_inconclusive(pre) && !is_inconclusive(post) && pre.exists && post.exists
}

/// True iff the key provably did not exist for the entire window — the
/// symmetric counterpart of [`must_have_existed`].
pub fn must_have_not_existed(pre: &ExpectedValue, post: &ExpectedValue) -> bool {
    !is_inconclusive(pre) && !is_inconclusive(post) && !pre.exists && !post.exists
}

fn is_inconclusive(v: &ExpectedValue) -> bool {
    v.pending_write || v.pending_delete
}

/// True iff `observed` lies within `[min(pre, post), max(pre, post)]` of
/// `value_base`, or the window is inconclusive (a pending flag was set on
/// either snapshot, so no range can be asserted).
pub fn in_expected_value_base_range(observed: u32, pre: &ExpectedValue, post: &ExpectedValue) -> bool {
    if is_inconclusive(pre) || is_inconclusive(post) {
        return true;
    }
    let lo = pre.value_base.min(post.value_base);
    let hi = pre.value_base.max(post.value_base);
    observed >= lo && observed <= hi
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_put_marks_exists_and_advances_value_base() {
        let oracle = Oracle::new(4);
        let pv = oracle.prepare_put(0, b"k");
        assert_eq!(pv.next_value_base(), Some(1));
        pv.commit();

        let v = oracle.get(0, b"k");
        assert!(v.exists);
        assert!(!v.pending_write);
        assert_eq!(v.value_base, 1);
    }

    #[test]
    fn rollback_put_leaves_state_unchanged() {
        let oracle = Oracle::new(4);
        let before = oracle.get(0, b"k");
        let pv = oracle.prepare_put(0, b"k");
        pv.rollback();
        let after = oracle.get(0, b"k");
        assert_eq!(before, after);
    }

    #[test]
    fn delete_over_existing_key_sets_deleted() {
        let oracle = Oracle::new(4);
        oracle.prepare_put(0, b"k").commit();
        oracle.prepare_delete(0, b"k").commit();

        let v = oracle.get(0, b"k");
        assert!(!v.exists);
        assert!(v.deleted);
    }

    #[test]
    fn value_base_strictly_increases_across_successive_commits() {
        let oracle = Oracle::new(4);
        let mut last = 0u32;
        for _ in 0..5 {
            let pv = oracle.prepare_put(0, b"k");
            let next = pv.next_value_base().unwrap();
            pv.commit();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn classification_helpers_match_contract() {
        let absent = ExpectedValue::default();
        let present = ExpectedValue { value_base: 3, exists: true, ..Default::default() };
        let pending = ExpectedValue { pending_write: true, ..Default::default() };

        assert!(must_have_not_existed(&absent, &absent));
        assert!(!must_have_existed(&absent, &absent));
        assert!(must_have_existed(&present, &present));
        assert!(!must_have_existed(&absent, &pending));
        assert!(in_expected_value_base_range(3, &present, &present));
        assert!(!in_expected_value_base_range(7, &present, &present));
        assert!(in_expected_value_base_range(999, &pending, &present));
    }

    #[test]
    fn save_and_load_round_trips_state() {
        let oracle = Oracle::new(3);
        oracle.prepare_put(0, b"a").commit();
        oracle.prepare_put(0, b"b").commit();
        oracle.prepare_delete(0, b"b").commit();

        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("oracle.bin");
        oracle.save_to_file(&path).unwrap();

        let loaded = Oracle::load_from_file(&path).unwrap();
        assert_eq!(loaded.get(0, b"a"), oracle.get(0, b"a"));
        assert_eq!(loaded.get(0, b"b"), oracle.get(0, b"b"));
    }

    #[test]
    fn load_rejects_corrupted_snapshot() {
        let oracle = Oracle::new(2);
        oracle.prepare_put(0, b"a").commit();
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("oracle.bin");
        oracle.save_to_file(&path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = Oracle::load_from_file(&path).unwrap_err();
        assert!(matches!(err, OracleError::ChecksumMismatch));
    }
}
