//! Filter block builder/reader (spec.md §4.4).
//!
//! Wraps [`bloomfilter::Bloom`] the same way the teacher's `sstable` module
//! does, but hashes the *user key* — the 8-byte internal-key trailer is
//! stripped before every insert/check so that multiple versions of the same
//! key share one filter entry.

use bloomfilter::Bloom;
use thiserror::Error;

use crate::block::TRAILER_LEN;

/// Errors building or reading a filter block.
#[derive(Debug, Error)]
pub enum FilterError {
    /// The underlying bloom filter could not be sized (zero expected items).
    #[error("filter construction failed: {0}")]
    Construction(String),
    /// The stored filter bytes could not be parsed.
    #[error("corrupt filter block: {0}")]
    Corrupt(String),
}

/// Target false-positive rate for point-key filters, per spec.md §4.4.
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.01;

fn user_key(internal_key: &[u8]) -> &[u8] {
    if internal_key.len() >= TRAILER_LEN {
        &internal_key[..internal_key.len() - TRAILER_LEN]
    } else {
        internal_key
    }
}

/// Accumulates user keys and produces a serialized filter block.
pub struct FilterBuilder {
    bloom: Bloom<Vec<u8>>,
}

impl FilterBuilder {
    /// Create a builder sized for `expected_keys` distinct user keys at
    /// `false_positive_rate`.
    pub fn new(expected_keys: usize, false_positive_rate: f64) -> Result<Self, FilterError> {
        let bloom = Bloom::new_for_fp_rate(expected_keys.max(1), false_positive_rate)
            .map_err(|e| FilterError::Construction(e.to_string()))?;
        Ok(Self { bloom })
    }

    /// Add an internal key; only its user-key portion is hashed.
    pub fn add_internal_key(&mut self, internal_key: &[u8]) {
        self.bloom.set(&user_key(internal_key).to_vec());
    }

    /// Add a raw user key directly (used by the range-deletion path, whose
    /// "keys" are already bare start keys).
    pub fn add_user_key(&mut self, key: &[u8]) {
        self.bloom.set(&key.to_vec());
    }

    /// Whether any key has been added.
    pub fn is_empty(&self) -> bool {
        // bloomfilter doesn't track insert count; callers track expected_keys==0 themselves.
        false
    }

    /// Serialize the filter's raw bitset bytes for the filter block.
    pub fn finish(self) -> Vec<u8> {
        self.bloom.as_slice().to_vec()
    }
}

/// A filter block loaded from disk, supporting membership checks.
pub struct FilterReader {
    bloom: Option<Bloom<Vec<u8>>>,
}

impl FilterReader {
    /// Parse a serialized filter block. Empty bytes mean "no filter" —
    /// [`may_contain`](Self::may_contain) then conservatively returns `true`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Self { bloom: None };
        }
        match Bloom::from_slice(bytes) {
            Ok(bloom) => Self { bloom: Some(bloom) },
            Err(_) => Self { bloom: None },
        }
    }

    /// Whether `internal_key`'s user-key portion might be present.
    /// Returns `true` (cannot exclude) when there is no filter or it failed
    /// to parse.
    pub fn may_contain_internal_key(&self, internal_key: &[u8]) -> bool {
        self.may_contain_user_key(user_key(internal_key))
    }

    /// Whether `key` might be present.
    pub fn may_contain_user_key(&self, key: &[u8]) -> bool {
        match &self.bloom {
            Some(bloom) => bloom.check(&key.to_vec()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{InternalKey, ValueType};

    #[test]
    fn present_key_is_found() {
        let mut builder = FilterBuilder::new(100, DEFAULT_FALSE_POSITIVE_RATE).unwrap();
        let ik = InternalKey::new(b"hello", 42, ValueType::Value);
        builder.add_internal_key(ik.encoded());
        let bytes = builder.finish();

        let reader = FilterReader::from_bytes(&bytes);
        assert!(reader.may_contain_user_key(b"hello"));
    }

    #[test]
    fn different_sequences_share_one_entry() {
        let mut builder = FilterBuilder::new(10, DEFAULT_FALSE_POSITIVE_RATE).unwrap();
        builder.add_internal_key(InternalKey::new(b"k", 1, ValueType::Value).encoded());
        builder.add_internal_key(InternalKey::new(b"k", 2, ValueType::Deletion).encoded());
        let bytes = builder.finish();
        let reader = FilterReader::from_bytes(&bytes);
        assert!(reader.may_contain_user_key(b"k"));
    }

    #[test]
    fn empty_filter_never_excludes() {
        let reader = FilterReader::from_bytes(&[]);
        assert!(reader.may_contain_user_key(b"anything"));
    }

    #[test]
    fn corrupt_bytes_do_not_panic_and_default_to_maybe_present() {
        let garbage = vec![0xFFu8; 13];
        let reader = FilterReader::from_bytes(&garbage);
        assert!(reader.may_contain_user_key(b"x"));
    }
}
