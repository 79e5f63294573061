//! # arck-lease
//!
//! Lease coherence between the controller and trust groups that map file
//! data directly.
//!
//! A trust group may use an inode's mapping only while it holds a lease and
//! its map bit is set. Before handing the inode to someone else the
//! controller tests the owner's lease ring, clears the owner's map bit, and
//! only then grants. The ring handshake is cooperative; the lease period is
//! the backstop for clients that never clear their ring.

pub mod admission;
pub mod clock;
pub mod lease;
pub mod manager;
pub mod ring;
pub mod shadow;
pub mod tgroup;

use thiserror::Error;

pub use admission::{Admission, Verdict};
pub use clock::{CycleCounter, ManualClock, MonotonicClock};
pub use lease::{Lease, LeaseSnapshot, LeaseState, MAX_OWNERS};
pub use manager::{Access, InodeResolver, LeaseManager, LeaseStats, MetadataCheck, NoopCheck};
pub use ring::{BitRing, CounterRing, LeaseRing, RingError, SENTINEL};
pub use shadow::{InodeError, ShadowInode, ShadowInodeTable, NAME_MAX};
pub use tgroup::{CriticalSection, GroupError, TgId, TrustGroup, TrustGroupTable};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LeaseError {
    /// The request conflicts with the caller's own ownership.
    #[error("invalid request for the caller's current ownership")]
    InvalidRequest,

    #[error("inode is held by an unexpired lease")]
    Busy,

    #[error("all {} reader slots are taken", MAX_OWNERS)]
    CapacityExceeded,

    #[error("no inode {0}")]
    UnknownInode(u32),

    #[error("trust group {0} is not registered")]
    UnknownGroup(TgId),
}

impl LeaseError {
    /// Worth retrying as is.
    pub fn is_transient(&self) -> bool {
        matches!(self, LeaseError::Busy)
    }
}
