//! Items, chains and bucket arrays.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arck_config::LockMode;

use crate::sync::BucketLock;

/// A stored entry. The key and its hash are fixed at insert time; the two
/// values can be updated in place by anyone holding a reference.
#[derive(Debug)]
pub struct ChItem {
    hash: u64,
    key: Box<[u8]>,
    val: AtomicU64,
    val2: AtomicU64,
}

impl ChItem {
    pub(crate) fn new(hash: u64, key: &[u8], val: u64, val2: u64) -> Arc<Self> {
        Arc::new(Self {
            hash,
            key: key.into(),
            val: AtomicU64::new(val),
            val2: AtomicU64::new(val2),
        })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn val(&self) -> u64 {
        self.val.load(Ordering::Acquire)
    }

    pub fn val2(&self) -> u64 {
        self.val2.load(Ordering::Acquire)
    }

    pub fn values(&self) -> (u64, u64) {
        (self.val(), self.val2())
    }

    pub fn set_val(&self, val: u64) {
        self.val.store(val, Ordering::Release);
    }

    pub fn set_val2(&self, val2: u64) {
        self.val2.store(val2, Ordering::Release);
    }

    pub(crate) fn matches(&self, hash: u64, key: &[u8]) -> bool {
        self.hash == hash && &*self.key == key
    }
}

/// Contents of one bucket.
///
/// A dead chain has been emptied by a migration or a kill; whoever finds
/// one must reload the table layout before trying again.
#[derive(Debug, Default)]
pub(crate) struct Chain {
    pub dead: bool,
    pub items: Vec<Arc<ChItem>>,
}

impl Chain {
    pub fn position(&self, hash: u64, key: &[u8]) -> Option<usize> {
        self.items.iter().position(|item| item.matches(hash, key))
    }

    pub fn get(&self, hash: u64, key: &[u8]) -> Option<&Arc<ChItem>> {
        self.items.iter().find(|item| item.matches(hash, key))
    }
}

/// A power-of-two array of buckets.
///
/// `epoch` grows with each resize of the owning table and orders arrays
/// for locking: an older array's buckets are always locked first.
pub(crate) struct BucketArray {
    pub epoch: u64,
    buckets: Box<[BucketLock<Chain>]>,
}

impl BucketArray {
    pub fn new(epoch: u64, nbuckets: usize, mode: LockMode) -> Self {
        debug_assert!(nbuckets.is_power_of_two());
        let buckets = (0..nbuckets)
            .map(|_| BucketLock::new(mode, Chain::default()))
            .collect();
        Self { epoch, buckets }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// log2 of the bucket count.
    pub fn bits(&self) -> u32 {
        self.buckets.len().trailing_zeros()
    }

    pub fn index(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    pub fn bucket(&self, index: usize) -> &BucketLock<Chain> {
        &self.buckets[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &BucketLock<Chain>> {
        self.buckets.iter()
    }
}
