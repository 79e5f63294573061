//! Trust groups: client library instances that map files directly.
//!
//! Each group exposes two rings to the controller. The controller reads the
//! lease ring and clears map-ring bits; the client drives its lease ring
//! through [`TrustGroup::enter`] and the [`CriticalSection`] guard.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use arck_cht::sync::SpinLock;
use arck_config::AdmissionMode;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use crate::ring::{BitRing, LeaseRing, RingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TgId(pub u32);

impl fmt::Display for TgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tg{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("trust group {0} is already registered")]
    Duplicate(TgId),

    #[error("ring setup failed: {0}")]
    Io(#[from] io::Error),
}

pub struct TrustGroup {
    id: TgId,
    lease_ring: LeaseRing,
    map_ring: BitRing,
    /// Per-inode counts of open critical sections, kept on the client side
    /// for the plain-bit ring (one bit cannot count).
    plain_users: SpinLock<Vec<u16>>,
}

impl fmt::Debug for TrustGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustGroup")
            .field("id", &self.id)
            .field("mode", &self.lease_ring.mode())
            .field("capacity", &self.map_ring.capacity())
            .finish()
    }
}

impl TrustGroup {
    /// Group with private anonymous rings covering inodes `0..capacity`.
    pub fn new(id: TgId, mode: AdmissionMode, capacity: usize) -> io::Result<Self> {
        Ok(Self::with_rings(
            id,
            LeaseRing::new(mode, capacity)?,
            BitRing::new(capacity)?,
        ))
    }

    /// Group whose rings live in files under `dir`, so another process
    /// mapping the same files shares them.
    pub fn open(id: TgId, mode: AdmissionMode, capacity: usize, dir: &Path) -> io::Result<Self> {
        let lease_path = dir.join(format!("{id}.lease"));
        let map_path = dir.join(format!("{id}.map"));
        Ok(Self::with_rings(
            id,
            LeaseRing::open(mode, &lease_path, capacity)?,
            BitRing::open(&map_path, capacity)?,
        ))
    }

    fn with_rings(id: TgId, lease_ring: LeaseRing, map_ring: BitRing) -> Self {
        let plain_users = match lease_ring {
            LeaseRing::Bits(_) => vec![0; map_ring.capacity()],
            LeaseRing::Counters(_) => Vec::new(),
        };
        Self {
            id,
            lease_ring,
            map_ring,
            plain_users: SpinLock::new(plain_users),
        }
    }

    pub fn id(&self) -> TgId {
        self.id
    }

    pub fn mode(&self) -> AdmissionMode {
        self.lease_ring.mode()
    }

    pub fn capacity(&self) -> usize {
        self.map_ring.capacity()
    }

    pub fn lease_ring(&self) -> &LeaseRing {
        &self.lease_ring
    }

    pub fn map_ring(&self) -> &BitRing {
        &self.map_ring
    }

    pub fn is_mapped(&self, ino: u32) -> bool {
        self.map_ring.test(ino)
    }

    /// Controller side: the group may now map `ino`.
    pub fn map(&self, ino: u32) -> Result<(), RingError> {
        self.map_ring.set(ino).map(|_| ())
    }

    /// Controller side: revoke the mapping of `ino`. Returns whether it
    /// was mapped.
    pub fn unmap(&self, ino: u32) -> Result<bool, RingError> {
        self.map_ring.clear(ino)
    }

    /// Client side: announce use of `ino`'s mapping.
    ///
    /// Use is marked first and the mapping checked second, so a controller
    /// that saw the inode idle has already cleared the map bit by the time
    /// this check runs.
    pub fn enter(&self, ino: u32) -> Result<CriticalSection<'_>, RingError> {
        match &self.lease_ring {
            LeaseRing::Counters(counters) => counters.enter(ino)?,
            LeaseRing::Bits(bits) => {
                let mut users = self.plain_users.lock();
                let count = users.get_mut(ino as usize).ok_or(RingError::OutOfRange {
                    ino,
                    capacity: self.map_ring.capacity(),
                })?;
                if *count == u16::MAX {
                    return Err(RingError::Saturated(ino));
                }
                *count += 1;
                if *count == 1 {
                    bits.set(ino)?;
                }
            }
        }

        let section = CriticalSection { group: self, ino };
        if !self.map_ring.test(ino) {
            return Err(RingError::Unmapped(ino));
        }
        Ok(section)
    }

    fn exit(&self, ino: u32) {
        match &self.lease_ring {
            LeaseRing::Counters(counters) => counters.exit(ino),
            LeaseRing::Bits(bits) => {
                let mut users = self.plain_users.lock();
                if let Some(count) = users.get_mut(ino as usize) {
                    if *count > 0 {
                        *count -= 1;
                        if *count == 0 {
                            let _ = bits.clear(ino);
                        }
                    }
                }
            }
        }
    }
}

/// An open critical section on one inode; closed on drop.
#[must_use = "the critical section closes as soon as the guard is dropped"]
pub struct CriticalSection<'a> {
    group: &'a TrustGroup,
    ino: u32,
}

impl CriticalSection<'_> {
    pub fn ino(&self) -> u32 {
        self.ino
    }
}

impl fmt::Debug for CriticalSection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CriticalSection")
            .field("group", &self.group.id)
            .field("ino", &self.ino)
            .finish()
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        self.group.exit(self.ino);
    }
}

/// Registered trust groups by id.
#[derive(Default)]
pub struct TrustGroupTable {
    groups: DashMap<TgId, Arc<TrustGroup>>,
}

impl TrustGroupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, group: TrustGroup) -> Result<Arc<TrustGroup>, GroupError> {
        match self.groups.entry(group.id()) {
            Entry::Occupied(_) => Err(GroupError::Duplicate(group.id())),
            Entry::Vacant(slot) => {
                let group = Arc::new(group);
                slot.insert(group.clone());
                Ok(group)
            }
        }
    }

    pub fn get(&self, id: TgId) -> Option<Arc<TrustGroup>> {
        self.groups.get(&id).map(|entry| entry.value().clone())
    }

    pub fn unregister(&self, id: TgId) -> Option<Arc<TrustGroup>> {
        self.groups.remove(&id).map(|(_, group)| group)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn ids(&self) -> Vec<TgId> {
        let mut ids: Vec<TgId> = self.groups.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::SENTINEL;
    use tempfile::TempDir;

    #[test]
    fn test_enter_requires_mapping() {
        let group = TrustGroup::new(TgId(1), AdmissionMode::Sentinel, 16).unwrap();
        assert_eq!(group.enter(3).unwrap_err(), RingError::Unmapped(3));
        assert!(!group.lease_ring().in_use(3));

        group.map(3).unwrap();
        let cs = group.enter(3).unwrap();
        assert_eq!(cs.ino(), 3);
        assert!(group.lease_ring().in_use(3));
        drop(cs);
        assert!(!group.lease_ring().in_use(3));
    }

    #[test]
    fn test_enter_refused_while_claimed() {
        let group = TrustGroup::new(TgId(1), AdmissionMode::Sentinel, 16).unwrap();
        group.map(5).unwrap();
        let LeaseRing::Counters(counters) = group.lease_ring() else {
            panic!("sentinel group must carry a counter ring");
        };
        assert!(counters.try_claim(5));
        assert_eq!(group.enter(5).unwrap_err(), RingError::Revoking(5));
        assert_eq!(counters.load(5), SENTINEL);
    }

    #[test]
    fn test_plain_bit_nesting() {
        let group = TrustGroup::new(TgId(2), AdmissionMode::PlainBit, 16).unwrap();
        group.map(1).unwrap();
        let outer = group.enter(1).unwrap();
        let inner = group.enter(1).unwrap();
        drop(inner);
        assert!(group.lease_ring().in_use(1));
        drop(outer);
        assert!(!group.lease_ring().in_use(1));
    }

    #[test]
    fn test_unmap_reports_previous() {
        let group = TrustGroup::new(TgId(3), AdmissionMode::PlainBit, 8).unwrap();
        assert!(!group.unmap(2).unwrap());
        group.map(2).unwrap();
        assert!(group.unmap(2).unwrap());
        assert!(!group.is_mapped(2));
    }

    #[test]
    fn test_file_backed_group_rings() {
        let dir = TempDir::new().unwrap();
        let controller = TrustGroup::open(TgId(9), AdmissionMode::Sentinel, 32, dir.path()).unwrap();
        let client = TrustGroup::open(TgId(9), AdmissionMode::Sentinel, 32, dir.path()).unwrap();
        controller.map(4).unwrap();
        let _cs = client.enter(4).unwrap();
        assert!(controller.lease_ring().in_use(4));
        assert!(dir.path().join("tg9.lease").exists());
    }

    #[test]
    fn test_table_register_and_lookup() {
        let table = TrustGroupTable::new();
        let group = TrustGroup::new(TgId(1), AdmissionMode::Sentinel, 4).unwrap();
        table.register(group).unwrap();
        let again = TrustGroup::new(TgId(1), AdmissionMode::Sentinel, 4).unwrap();
        assert!(matches!(
            table.register(again),
            Err(GroupError::Duplicate(TgId(1)))
        ));
        assert_eq!(table.get(TgId(1)).unwrap().id(), TgId(1));
        assert!(table.get(TgId(2)).is_none());
        assert_eq!(table.ids(), vec![TgId(1)]);
        assert!(table.unregister(TgId(1)).is_some());
        assert!(table.is_empty());
    }
}
