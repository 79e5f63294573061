//! arck-cht: concurrent chained hash table.
//!
//! Maps byte-string keys (directory entry names) to a pair of 64-bit
//! values. Every bucket carries its own lock; a table can be resized
//! while in use, and an entry can be moved between two tables (or two
//! keys of one table) in a single observable step.
//!
//! ```ignore
//! use arck_cht::{ChainHash, ChtOptions};
//!
//! let table = ChainHash::new(64, ChtOptions::default());
//! table.insert(b"hello", 255, 7, 0)?;
//! assert_eq!(table.lookup(b"hello", 255)?, Some((7, 0)));
//! ```

pub mod bucket;
pub mod dirent;
mod iter;
pub mod sync;
pub mod table;

pub use bucket::ChItem;
pub use dirent::{DirentIter, RawDirent, END_OF_DIR};
pub use table::{BucketTxn, ChainHash, ChtOptions, ChtStats, DstMode, Replaced};

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChtError {
    #[error("key already exists")]
    AlreadyExists,

    #[error("key not found")]
    NotFound,

    #[error("destination key not found")]
    DestinationMissing,

    #[error("table is not empty")]
    NotEmpty,

    #[error("table has been killed")]
    Dead,

    #[error("buffer too small for the next directory entry")]
    BufferTooSmall,
}

pub type Result<T> = std::result::Result<T, ChtError>;

/// FNV-1a hash of a key.
#[inline]
pub fn fnv1a_hash(key: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in key {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Significant part of a key: up to the first NUL, capped at `max_size` bytes.
#[inline]
pub fn clamp_key(key: &[u8], max_size: usize) -> &[u8] {
    let limit = key.len().min(max_size);
    let end = key[..limit].iter().position(|&b| b == 0).unwrap_or(limit);
    &key[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a_hash(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_hash(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn test_clamp_key_stops_at_nul() {
        assert_eq!(clamp_key(b"abc\0def", 255), b"abc");
        assert_eq!(clamp_key(b"abcdef", 3), b"abc");
        assert_eq!(clamp_key(b"ab", 16), b"ab");
        assert_eq!(clamp_key(b"\0", 16), b"");
    }

    #[test]
    fn test_clamped_keys_hash_equal() {
        assert_eq!(
            fnv1a_hash(clamp_key(b"name\0junk", 255)),
            fnv1a_hash(clamp_key(b"name", 255))
        );
    }
}
