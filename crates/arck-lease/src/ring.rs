//! Rings shared between the controller and one trust group.
//!
//! A ring is a memory region (anonymous, or a file mapped by both parties)
//! read and written only through atomics. The client updates its lease ring
//! around every access to an inode's mapping; the controller tests it before
//! revoking, and clears map-ring bits to revoke.
//!
//! Nothing here is enforced: a client that ignores the protocol can only
//! fault itself, since the controller also expires leases by timeout.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use arck_config::AdmissionMode;
use memmap2::MmapMut;
use thiserror::Error;

/// Counter value claimed by the controller while it revokes a mapping.
pub const SENTINEL: u8 = 0xFF;

/// Most critical sections one group may have open on one inode.
pub const MAX_NESTING: u8 = SENTINEL - 1;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("inode {0} is being revoked")]
    Revoking(u32),

    #[error("inode {0} is not mapped")]
    Unmapped(u32),

    #[error("critical section counter of inode {0} is saturated")]
    Saturated(u32),

    #[error("inode {ino} is outside the ring capacity of {capacity}")]
    OutOfRange { ino: u32, capacity: usize },
}

/// Memory backing a ring, viewed as atomics.
pub struct RingRegion {
    mmap: MmapMut,
}

fn round_to_words(len: usize) -> usize {
    len.max(1).div_ceil(8) * 8
}

impl RingRegion {
    /// Private zeroed region.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        let mmap = MmapMut::map_anon(round_to_words(len))?;
        Ok(Self { mmap })
    }

    /// Region backed by `path`, created and zero-extended if short. Two
    /// mappings of one file observe each other's updates.
    pub fn file_backed(path: &Path, len: usize) -> io::Result<Self> {
        let len = round_to_words(len);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < len as u64 {
            file.set_len(len as u64)?;
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { mmap })
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    fn byte(&self, index: usize) -> &AtomicU8 {
        debug_assert!(index < self.mmap.len());
        unsafe { &*(self.mmap.as_ptr().add(index) as *const AtomicU8) }
    }

    /// Mappings are page aligned, so every 8-byte word is aligned.
    fn word(&self, index: usize) -> &AtomicU64 {
        debug_assert!(index * 8 + 8 <= self.mmap.len());
        unsafe { &*(self.mmap.as_ptr().add(index * 8) as *const AtomicU64) }
    }
}

/// One bit per inode.
pub struct BitRing {
    region: RingRegion,
    capacity: usize,
}

impl BitRing {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            region: RingRegion::anonymous(capacity.div_ceil(64) * 8)?,
            capacity,
        })
    }

    pub fn open(path: &Path, capacity: usize) -> io::Result<Self> {
        Ok(Self {
            region: RingRegion::file_backed(path, capacity.div_ceil(64) * 8)?,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn locate(&self, ino: u32) -> Result<(&AtomicU64, u64), RingError> {
        let index = ino as usize;
        if index >= self.capacity {
            return Err(RingError::OutOfRange {
                ino,
                capacity: self.capacity,
            });
        }
        Ok((self.region.word(index / 64), 1u64 << (index % 64)))
    }

    /// False for inodes outside the ring.
    pub fn test(&self, ino: u32) -> bool {
        self.locate(ino)
            .map(|(word, mask)| word.load(Ordering::Acquire) & mask != 0)
            .unwrap_or(false)
    }

    /// Set the bit; returns its previous value.
    pub fn set(&self, ino: u32) -> Result<bool, RingError> {
        let (word, mask) = self.locate(ino)?;
        Ok(word.fetch_or(mask, Ordering::AcqRel) & mask != 0)
    }

    /// Clear the bit; returns its previous value.
    pub fn clear(&self, ino: u32) -> Result<bool, RingError> {
        let (word, mask) = self.locate(ino)?;
        Ok(word.fetch_and(!mask, Ordering::AcqRel) & mask != 0)
    }
}

/// One critical-section counter byte per inode, with `SENTINEL` reserved
/// for the controller.
pub struct CounterRing {
    region: RingRegion,
    capacity: usize,
}

impl CounterRing {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            region: RingRegion::anonymous(capacity)?,
            capacity,
        })
    }

    pub fn open(path: &Path, capacity: usize) -> io::Result<Self> {
        Ok(Self {
            region: RingRegion::file_backed(path, capacity)?,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn counter(&self, ino: u32) -> Result<&AtomicU8, RingError> {
        let index = ino as usize;
        if index >= self.capacity {
            return Err(RingError::OutOfRange {
                ino,
                capacity: self.capacity,
            });
        }
        Ok(self.region.byte(index))
    }

    /// Current counter value; 0 for inodes outside the ring.
    pub fn load(&self, ino: u32) -> u8 {
        self.counter(ino)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Client: open a critical section. Refused while the sentinel is set.
    pub fn enter(&self, ino: u32) -> Result<(), RingError> {
        let counter = self.counter(ino)?;
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| match c {
                SENTINEL | MAX_NESTING => None,
                c => Some(c + 1),
            })
            .map(|_| ())
            .map_err(|current| {
                if current == SENTINEL {
                    RingError::Revoking(ino)
                } else {
                    RingError::Saturated(ino)
                }
            })
    }

    /// Client: close a critical section opened by `enter`.
    pub fn exit(&self, ino: u32) {
        if let Ok(counter) = self.counter(ino) {
            let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| match c {
                0 | SENTINEL => None,
                c => Some(c - 1),
            });
        }
    }

    /// Controller: claim an idle counter (0 -> SENTINEL). Fails if any
    /// critical section is open, or the counter is already claimed.
    pub fn try_claim(&self, ino: u32) -> bool {
        self.counter(ino)
            .map(|c| {
                c.compare_exchange(0, SENTINEL, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })
            .unwrap_or(false)
    }

    /// Controller: hand a claimed counter back (SENTINEL -> 0).
    pub fn release_claim(&self, ino: u32) -> bool {
        self.counter(ino)
            .map(|c| {
                c.compare_exchange(SENTINEL, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })
            .unwrap_or(false)
    }
}

/// A trust group's usage ring, in the shape its admission mode expects.
pub enum LeaseRing {
    Bits(BitRing),
    Counters(CounterRing),
}

impl LeaseRing {
    pub fn new(mode: AdmissionMode, capacity: usize) -> io::Result<Self> {
        Ok(match mode {
            AdmissionMode::PlainBit => LeaseRing::Bits(BitRing::new(capacity)?),
            AdmissionMode::Sentinel => LeaseRing::Counters(CounterRing::new(capacity)?),
        })
    }

    pub fn open(mode: AdmissionMode, path: &Path, capacity: usize) -> io::Result<Self> {
        Ok(match mode {
            AdmissionMode::PlainBit => LeaseRing::Bits(BitRing::open(path, capacity)?),
            AdmissionMode::Sentinel => LeaseRing::Counters(CounterRing::open(path, capacity)?),
        })
    }

    pub fn mode(&self) -> AdmissionMode {
        match self {
            LeaseRing::Bits(_) => AdmissionMode::PlainBit,
            LeaseRing::Counters(_) => AdmissionMode::Sentinel,
        }
    }

    /// Whether the group currently reports use of `ino`.
    pub fn in_use(&self, ino: u32) -> bool {
        match self {
            LeaseRing::Bits(bits) => bits.test(ino),
            LeaseRing::Counters(counters) => !matches!(counters.load(ino), 0 | SENTINEL),
        }
    }
}
