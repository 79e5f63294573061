//! Lease manager: acquire, renew and release on behalf of trust groups.
//!
//! Every decision about one inode is taken under that inode's lease lock.
//! Ring updates (claims, map bits) are atomics and are done under the same
//! lock so that a competing acquisition never sees half a revocation.
//! Logging and dropping owner handles happen after the lock is released.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arck_config::{AdmissionMode, LeaseConfig};
use arck_config::{log_lease_debug, log_lease_info, log_lease_trace};
use tracing::field::{debug, display};

use crate::admission::{self, Admission, Verdict};
use crate::clock::{CycleCounter, MonotonicClock};
use crate::lease::{Evicted, Lease, LeaseBook, LeaseSnapshot, LeaseState, OwnerSlot, MAX_OWNERS};
use crate::tgroup::{GroupError, TgId, TrustGroup, TrustGroupTable};
use crate::LeaseError;

/// Resolves an inode number to its lease.
pub trait InodeResolver: Send + Sync {
    fn lease(&self, ino: u32) -> Option<&Lease>;

    /// Inode numbers are below this bound; rings are sized to it.
    fn capacity(&self) -> usize;
}

impl<T: InodeResolver + ?Sized> InodeResolver for Arc<T> {
    fn lease(&self, ino: u32) -> Option<&Lease> {
        (**self).lease(ino)
    }

    fn capacity(&self) -> usize {
        (**self).capacity()
    }
}

/// Hook run whenever an inode leaves the hands of a writer, since a faulty
/// writer may have left its metadata inconsistent.
///
/// Runs under the lease lock: it must be bounded and must not block.
pub trait MetadataCheck: Send + Sync {
    fn verify(&self, ino: u32, writer: TgId);
}

#[derive(Debug, Default)]
pub struct NoopCheck;

impl MetadataCheck for NoopCheck {
    fn verify(&self, _ino: u32, _writer: TgId) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl Access {
    fn state(self) -> LeaseState {
        match self {
            Access::Read => LeaseState::ReadOwned,
            Access::Write => LeaseState::WriteOwned,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    grants: AtomicU64,
    busy: AtomicU64,
    invalid: AtomicU64,
    revocations: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LeaseStats {
    pub grants: u64,
    pub busy: u64,
    pub invalid: u64,
    /// Mappings taken away from previous owners.
    pub revocations: u64,
}

struct Grant {
    revoked: u64,
    evicted: Evicted,
}

pub struct LeaseManager<I, C = MonotonicClock> {
    inodes: I,
    clock: C,
    groups: TrustGroupTable,
    admission: Box<dyn Admission>,
    period: u64,
    mcheck: Box<dyn MetadataCheck>,
    counters: Counters,
}

impl<I: InodeResolver, C: CycleCounter> LeaseManager<I, C> {
    pub fn new(inodes: I, clock: C, config: &LeaseConfig) -> Self {
        log_lease_info!(
            "Lease manager started",
            admission = debug(config.admission),
            period_ms = config.period_ms,
            capacity = inodes.capacity(),
        );
        Self {
            inodes,
            clock,
            groups: TrustGroupTable::new(),
            admission: admission::for_mode(config.admission),
            period: config.period_ticks(),
            mcheck: Box::new(NoopCheck),
            counters: Counters::default(),
        }
    }

    pub fn with_metadata_check(mut self, check: impl MetadataCheck + 'static) -> Self {
        self.mcheck = Box::new(check);
        self
    }

    pub fn inodes(&self) -> &I {
        &self.inodes
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn admission_mode(&self) -> AdmissionMode {
        self.admission.mode()
    }

    /// Lease period in clock ticks.
    pub fn period(&self) -> u64 {
        self.period
    }

    pub fn groups(&self) -> &TrustGroupTable {
        &self.groups
    }

    /// Register a trust group with private rings sized to the inode table.
    pub fn register_group(&self, id: TgId) -> Result<Arc<TrustGroup>, GroupError> {
        let group = TrustGroup::new(id, self.admission.mode(), self.inodes.capacity())?;
        let group = self.groups.register(group)?;
        log_lease_debug!("Trust group registered", tgroup = id.0);
        Ok(group)
    }

    /// Register a trust group whose rings are files under `dir`.
    pub fn register_group_at(&self, id: TgId, dir: &Path) -> Result<Arc<TrustGroup>, GroupError> {
        let group = TrustGroup::open(id, self.admission.mode(), self.inodes.capacity(), dir)?;
        let group = self.groups.register(group)?;
        log_lease_debug!("Trust group registered", tgroup = id.0, dir = display(dir.display()));
        Ok(group)
    }

    /// Forget a trust group. Leases it still holds stay in place until they
    /// expire or are released.
    pub fn unregister_group(&self, id: TgId) -> Option<Arc<TrustGroup>> {
        let group = self.groups.unregister(id);
        if group.is_some() {
            log_lease_debug!("Trust group unregistered", tgroup = id.0);
        }
        group
    }

    pub fn acquire_write(&self, ino: u32, caller: TgId) -> Result<(), LeaseError> {
        self.acquire(ino, caller, Access::Write)
    }

    pub fn acquire_read(&self, ino: u32, caller: TgId) -> Result<(), LeaseError> {
        self.acquire(ino, caller, Access::Read)
    }

    /// Give up `caller`'s lease on `ino` and its mapping.
    pub fn release(&self, ino: u32, caller: TgId) -> Result<(), LeaseError> {
        let lease = self.lease(ino)?;
        let result = lease.with_book(|book| -> Result<_, LeaseError> {
            let index = book.position(caller).ok_or(LeaseError::InvalidRequest)?;
            if book.state() == LeaseState::WriteOwned {
                self.mcheck.verify(ino, caller);
            }
            let slot = book.remove(index);
            if let Some(slot) = &slot {
                let _ = slot.group.unmap(ino);
            }
            Ok((slot, book.state()))
        });

        match result {
            Ok((slot, state)) => {
                drop(slot);
                log_lease_debug!("Lease released", ino = ino, tgroup = caller.0, state = debug(state));
                Ok(())
            }
            Err(err) => {
                self.count_failure(err);
                log_lease_trace!("Release refused", ino = ino, tgroup = caller.0, error = display(err));
                Err(err)
            }
        }
    }

    /// Restart the lease period of `caller`'s lease on `ino`.
    pub fn renew(&self, ino: u32, caller: TgId) -> Result<(), LeaseError> {
        let lease = self.lease(ino)?;
        let now = self.clock.now();
        let renewed = lease.with_book(|book| match book.position(caller) {
            Some(index) => book.renew(index, now),
            None => false,
        });
        if renewed {
            log_lease_trace!("Lease renewed", ino = ino, tgroup = caller.0);
            Ok(())
        } else {
            self.count_failure(LeaseError::InvalidRequest);
            Err(LeaseError::InvalidRequest)
        }
    }

    pub fn snapshot(&self, ino: u32) -> Result<LeaseSnapshot, LeaseError> {
        Ok(self.lease(ino)?.snapshot())
    }

    pub fn stats(&self) -> LeaseStats {
        LeaseStats {
            grants: self.counters.grants.load(Ordering::Relaxed),
            busy: self.counters.busy.load(Ordering::Relaxed),
            invalid: self.counters.invalid.load(Ordering::Relaxed),
            revocations: self.counters.revocations.load(Ordering::Relaxed),
        }
    }

    fn lease(&self, ino: u32) -> Result<&Lease, LeaseError> {
        self.inodes.lease(ino).ok_or(LeaseError::UnknownInode(ino))
    }

    fn count_failure(&self, err: LeaseError) {
        let counter = match err {
            LeaseError::Busy => &self.counters.busy,
            LeaseError::InvalidRequest => &self.counters.invalid,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn acquire(&self, ino: u32, caller: TgId, want: Access) -> Result<(), LeaseError> {
        let group = self
            .groups
            .get(caller)
            .ok_or(LeaseError::UnknownGroup(caller))?;
        if ino as usize >= group.capacity() {
            return Err(LeaseError::UnknownInode(ino));
        }
        let lease = self.lease(ino)?;
        let now = self.clock.now();

        let result = lease.with_book(|book| -> Result<Grant, LeaseError> {
            let claimed = self.admit(book, ino, caller, want, now)?;
            Ok(self.grant(book, ino, OwnerSlot::new(group, now), want, &claimed))
        });

        match result {
            Ok(grant) => {
                self.counters.grants.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .revocations
                    .fetch_add(grant.revoked, Ordering::Relaxed);
                let previous = grant.evicted.iter().flatten().count();
                drop(grant.evicted);
                log_lease_debug!(
                    "Lease granted",
                    ino = ino,
                    tgroup = caller.0,
                    access = debug(want),
                    previous = previous,
                    revoked = grant.revoked,
                );
                Ok(())
            }
            Err(err) => {
                self.count_failure(err);
                log_lease_trace!(
                    "Lease refused",
                    ino = ino,
                    tgroup = caller.0,
                    access = debug(want),
                    error = display(err),
                );
                Err(err)
            }
        }
    }

    /// Decide whether `caller` may take `want` access. On success returns
    /// which owners were claimed; on failure every claim is already undone.
    fn admit(
        &self,
        book: &LeaseBook,
        ino: u32,
        caller: TgId,
        want: Access,
        now: u64,
    ) -> Result<[bool; MAX_OWNERS], LeaseError> {
        let mut claimed = [false; MAX_OWNERS];
        if book.is_retired() {
            return Err(LeaseError::UnknownInode(ino));
        }
        if book.state() == LeaseState::Unowned {
            return Ok(claimed);
        }

        // Readers joining readers never need to revoke anyone.
        let check_expiry = want == Access::Write || book.state() == LeaseState::WriteOwned;
        for (index, owner) in book.owners().enumerate() {
            // Includes read-to-write upgrade, which is not supported.
            if owner.id() == caller {
                self.release_claims(book, ino, &claimed);
                return Err(LeaseError::InvalidRequest);
            }
            if !check_expiry || owner.stamp.saturating_add(self.period) < now {
                continue;
            }
            match self.admission.check(&owner.group, ino) {
                Verdict::Idle => {}
                Verdict::Claimed => claimed[index] = true,
                Verdict::Active => {
                    self.release_claims(book, ino, &claimed);
                    return Err(LeaseError::Busy);
                }
            }
        }

        if want == Access::Read && book.state() == LeaseState::ReadOwned && book.is_full() {
            self.release_claims(book, ino, &claimed);
            return Err(LeaseError::CapacityExceeded);
        }
        Ok(claimed)
    }

    fn grant(
        &self,
        book: &mut LeaseBook,
        ino: u32,
        grantee: OwnerSlot,
        want: Access,
        claimed: &[bool; MAX_OWNERS],
    ) -> Grant {
        let group = grantee.group.clone();

        if want == Access::Read && book.state() == LeaseState::ReadOwned {
            // Capacity was checked by `admit`.
            let pushed = book.push(grantee).is_ok();
            debug_assert!(pushed);
            let _ = group.map(ino);
            return Grant {
                revoked: 0,
                evicted: Evicted::default(),
            };
        }

        if book.state() == LeaseState::WriteOwned {
            if let Some(writer) = book.owner(0) {
                self.mcheck.verify(ino, writer.id());
            }
        }

        let mut revoked = 0;
        for owner in book.owners() {
            if owner.group.unmap(ino).unwrap_or(false) {
                revoked += 1;
            }
        }
        // Previous owners are unmapped; they may enter again and fault.
        self.release_claims(book, ino, claimed);

        let _ = group.map(ino);
        let evicted = book.reset(want.state(), Some(grantee));
        Grant { revoked, evicted }
    }

    fn release_claims(&self, book: &LeaseBook, ino: u32, claimed: &[bool; MAX_OWNERS]) {
        for (owner, _) in book.owners().zip(claimed).filter(|(_, claimed)| **claimed) {
            self.admission.release(&owner.group, ino);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    struct Leases(Vec<Lease>);

    impl Leases {
        fn new(n: usize) -> Self {
            Self((0..n).map(|_| Lease::new()).collect())
        }
    }

    impl InodeResolver for Leases {
        fn lease(&self, ino: u32) -> Option<&Lease> {
            self.0.get(ino as usize)
        }

        fn capacity(&self) -> usize {
            self.0.len()
        }
    }

    fn manager(mode: AdmissionMode) -> LeaseManager<Leases, Arc<ManualClock>> {
        let config = LeaseConfig {
            period_ms: 1,
            admission: mode,
        };
        LeaseManager::new(Leases::new(16), Arc::new(ManualClock::new(0)), &config)
    }

    #[test]
    fn test_write_then_busy_then_handoff() {
        let m = manager(AdmissionMode::Sentinel);
        let a = m.register_group(TgId(1)).unwrap();
        m.register_group(TgId(2)).unwrap();

        m.acquire_write(3, TgId(1)).unwrap();
        assert!(a.is_mapped(3));
        let cs = a.enter(3).unwrap();
        assert_eq!(m.acquire_write(3, TgId(2)), Err(LeaseError::Busy));
        drop(cs);

        m.acquire_write(3, TgId(2)).unwrap();
        assert!(!a.is_mapped(3));
        assert!(a.enter(3).is_err());
        let stats = m.stats();
        assert_eq!(stats.grants, 2);
        assert_eq!(stats.busy, 1);
        assert_eq!(stats.revocations, 1);
    }

    #[test]
    fn test_readers_share_without_checks() {
        let m = manager(AdmissionMode::PlainBit);
        let a = m.register_group(TgId(1)).unwrap();
        m.register_group(TgId(2)).unwrap();
        m.acquire_read(0, TgId(1)).unwrap();
        let _cs = a.enter(0).unwrap();
        m.acquire_read(0, TgId(2)).unwrap();
        let snap = m.snapshot(0).unwrap();
        assert_eq!(snap.state, LeaseState::ReadOwned);
        assert!(snap.holds(TgId(1)) && snap.holds(TgId(2)));
    }

    #[test]
    fn test_upgrade_is_refused() {
        let m = manager(AdmissionMode::Sentinel);
        m.register_group(TgId(1)).unwrap();
        m.acquire_read(2, TgId(1)).unwrap();
        assert_eq!(m.acquire_write(2, TgId(1)), Err(LeaseError::InvalidRequest));
        assert_eq!(m.acquire_read(2, TgId(1)), Err(LeaseError::InvalidRequest));
        assert_eq!(m.snapshot(2).unwrap().state, LeaseState::ReadOwned);
    }

    #[test]
    fn test_timeout_overrides_active_ring() {
        let m = manager(AdmissionMode::Sentinel);
        let a = m.register_group(TgId(1)).unwrap();
        m.register_group(TgId(2)).unwrap();
        m.acquire_write(1, TgId(1)).unwrap();
        let _cs = a.enter(1).unwrap();

        m.clock().advance(m.period());
        assert_eq!(m.acquire_write(1, TgId(2)), Err(LeaseError::Busy));
        m.clock().advance(1);
        m.acquire_write(1, TgId(2)).unwrap();
        assert!(!a.is_mapped(1));
    }

    #[test]
    fn test_busy_releases_earlier_claims() {
        let m = manager(AdmissionMode::Sentinel);
        let a = m.register_group(TgId(1)).unwrap();
        let b = m.register_group(TgId(2)).unwrap();
        m.register_group(TgId(3)).unwrap();
        m.acquire_read(4, TgId(1)).unwrap();
        m.acquire_read(4, TgId(2)).unwrap();
        let _cs = b.enter(4).unwrap();

        // A is claimed first, then B is found active.
        assert_eq!(m.acquire_write(4, TgId(3)), Err(LeaseError::Busy));
        let _again = a.enter(4).unwrap();
    }

    #[test]
    fn test_release_requires_ownership() {
        let m = manager(AdmissionMode::PlainBit);
        let a = m.register_group(TgId(1)).unwrap();
        assert_eq!(m.release(0, TgId(1)), Err(LeaseError::InvalidRequest));
        m.acquire_write(0, TgId(1)).unwrap();
        m.release(0, TgId(1)).unwrap();
        assert!(!a.is_mapped(0));
        assert_eq!(m.snapshot(0).unwrap().state, LeaseState::Unowned);
        assert_eq!(m.renew(0, TgId(1)), Err(LeaseError::InvalidRequest));
    }

    #[test]
    fn test_renew_refreshes_stamp() {
        let m = manager(AdmissionMode::PlainBit);
        m.register_group(TgId(1)).unwrap();
        m.acquire_read(5, TgId(1)).unwrap();
        m.clock().set(77);
        m.renew(5, TgId(1)).unwrap();
        assert_eq!(m.snapshot(5).unwrap().owners, vec![(TgId(1), 77)]);
    }

    #[test]
    fn test_unknown_inode_and_group() {
        let m = manager(AdmissionMode::PlainBit);
        m.register_group(TgId(1)).unwrap();
        assert_eq!(m.acquire_write(99, TgId(1)), Err(LeaseError::UnknownInode(99)));
        assert_eq!(m.acquire_write(0, TgId(8)), Err(LeaseError::UnknownGroup(TgId(8))));
        assert!(matches!(
            m.register_group(TgId(1)),
            Err(GroupError::Duplicate(TgId(1)))
        ));
    }

    #[test]
    fn test_metadata_check_on_writer_exit() {
        use std::sync::Mutex;

        #[derive(Default)]
        struct Record(Mutex<Vec<(u32, TgId)>>);
        impl MetadataCheck for Arc<Record> {
            fn verify(&self, ino: u32, writer: TgId) {
                self.0.lock().unwrap().push((ino, writer));
            }
        }

        let record = Arc::new(Record::default());
        let m = manager(AdmissionMode::Sentinel).with_metadata_check(record.clone());
        m.register_group(TgId(1)).unwrap();
        m.register_group(TgId(2)).unwrap();

        m.acquire_read(6, TgId(1)).unwrap();
        m.acquire_write(6, TgId(2)).unwrap();
        m.acquire_write(6, TgId(1)).unwrap();
        m.release(6, TgId(1)).unwrap();
        assert_eq!(
            *record.0.lock().unwrap(),
            vec![(6, TgId(2)), (6, TgId(1))]
        );
    }
}
