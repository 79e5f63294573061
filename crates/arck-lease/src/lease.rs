//! Per-inode lease record.
//!
//! The book is only touched under the lease's spin lock and every operation
//! on it is bounded by `MAX_OWNERS`. Owner handles leave the book by value
//! so their last reference is dropped after the lock is released.

use std::mem;
use std::sync::Arc;

use arck_cht::sync::SpinLock;

use crate::tgroup::{TgId, TrustGroup};

/// Most trust groups that may share a read lease.
pub const MAX_OWNERS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Unowned,
    ReadOwned,
    WriteOwned,
}

pub(crate) struct OwnerSlot {
    pub(crate) group: Arc<TrustGroup>,
    /// Clock reading of the last acquire or renew.
    pub(crate) stamp: u64,
}

impl OwnerSlot {
    pub(crate) fn new(group: Arc<TrustGroup>, stamp: u64) -> Self {
        Self { group, stamp }
    }

    pub(crate) fn id(&self) -> TgId {
        self.group.id()
    }
}

/// Owner handles evicted from a book, to be dropped outside the lock.
pub(crate) type Evicted = [Option<OwnerSlot>; MAX_OWNERS];

pub(crate) struct LeaseBook {
    state: LeaseState,
    slots: [Option<OwnerSlot>; MAX_OWNERS],
    len: usize,
    /// Set once the owning inode is unlinked; no further grants.
    retired: bool,
}

impl LeaseBook {
    const fn new() -> Self {
        Self {
            state: LeaseState::Unowned,
            slots: [None, None, None, None, None, None, None, None],
            len: 0,
            retired: false,
        }
    }

    pub(crate) fn state(&self) -> LeaseState {
        self.state
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len == MAX_OWNERS
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    pub(crate) fn owners(&self) -> impl Iterator<Item = &OwnerSlot> {
        self.slots[..self.len].iter().flatten()
    }

    pub(crate) fn owner(&self, index: usize) -> Option<&OwnerSlot> {
        self.slots[..self.len].get(index)?.as_ref()
    }

    pub(crate) fn position(&self, id: TgId) -> Option<usize> {
        self.owners().position(|slot| slot.id() == id)
    }

    pub(crate) fn renew(&mut self, index: usize, stamp: u64) -> bool {
        match self.slots[..self.len].get_mut(index) {
            Some(Some(slot)) => {
                slot.stamp = stamp;
                true
            }
            _ => false,
        }
    }

    /// Add a reader. Only valid on a `ReadOwned` book with a free slot.
    pub(crate) fn push(&mut self, slot: OwnerSlot) -> Result<(), OwnerSlot> {
        if self.state != LeaseState::ReadOwned || self.is_full() {
            return Err(slot);
        }
        self.slots[self.len] = Some(slot);
        self.len += 1;
        self.debug_check();
        Ok(())
    }

    /// Remove the owner at `index`, shifting later owners down so their
    /// relative order is kept. The book becomes `Unowned` when empty.
    pub(crate) fn remove(&mut self, index: usize) -> Option<OwnerSlot> {
        if index >= self.len {
            return None;
        }
        let slot = self.slots[index].take();
        self.slots[index..self.len].rotate_left(1);
        self.len -= 1;
        if self.len == 0 {
            self.state = LeaseState::Unowned;
        }
        self.debug_check();
        slot
    }

    /// Replace every owner with `grantee` (or none) in `state`.
    pub(crate) fn reset(&mut self, state: LeaseState, grantee: Option<OwnerSlot>) -> Evicted {
        let evicted = mem::take(&mut self.slots);
        self.len = 0;
        self.state = LeaseState::Unowned;
        if let Some(slot) = grantee {
            self.slots[0] = Some(slot);
            self.len = 1;
            self.state = state;
        }
        self.debug_check();
        evicted
    }

    fn debug_check(&self) {
        debug_assert!(self.len <= MAX_OWNERS);
        debug_assert_eq!(self.len == 0, self.state == LeaseState::Unowned);
        debug_assert!(self.state != LeaseState::WriteOwned || self.len == 1);
        debug_assert!(self.slots[..self.len].iter().all(Option::is_some));
        debug_assert!(self.slots[self.len..].iter().all(Option::is_none));
    }
}

/// Point-in-time copy of a lease, taken outside its lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseSnapshot {
    pub state: LeaseState,
    /// Owners in grant order with their last acquire/renew stamp.
    pub owners: Vec<(TgId, u64)>,
}

impl LeaseSnapshot {
    pub fn holds(&self, id: TgId) -> bool {
        self.owners.iter().any(|(owner, _)| *owner == id)
    }
}

pub struct Lease {
    book: SpinLock<LeaseBook>,
}

impl Default for Lease {
    fn default() -> Self {
        Self::new()
    }
}

impl Lease {
    pub const fn new() -> Self {
        Self {
            book: SpinLock::new(LeaseBook::new()),
        }
    }

    /// Run `f` with the book locked. `f` must not block, allocate or take
    /// another lease.
    pub(crate) fn with_book<R>(&self, f: impl FnOnce(&mut LeaseBook) -> R) -> R {
        let mut book = self.book.lock();
        f(&mut book)
    }

    pub fn state(&self) -> LeaseState {
        self.book.lock().state
    }

    pub fn is_held(&self) -> bool {
        self.book.lock().len > 0
    }

    pub fn snapshot(&self) -> LeaseSnapshot {
        let mut owners = [(TgId(0), 0u64); MAX_OWNERS];
        let (state, len) = self.with_book(|book| {
            for (out, slot) in owners.iter_mut().zip(book.owners()) {
                *out = (slot.id(), slot.stamp);
            }
            (book.state, book.len)
        });
        LeaseSnapshot {
            state,
            owners: owners[..len].to_vec(),
        }
    }

    /// Refuse all future grants unless no one holds the lease. Returns
    /// whether the lease is now retired.
    pub(crate) fn try_retire(&self) -> bool {
        self.with_book(|book| {
            if book.len > 0 {
                return false;
            }
            book.retired = true;
            true
        })
    }

    /// Ready a retired lease for a new inode incarnation.
    pub(crate) fn revive(&self) {
        let evicted = self.with_book(|book| {
            book.retired = false;
            book.reset(LeaseState::Unowned, None)
        });
        drop(evicted);
    }
}
