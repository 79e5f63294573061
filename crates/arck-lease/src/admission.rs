//! Admission tests: may the controller take an inode away from an owner
//! whose lease has not timed out?

use arck_config::AdmissionMode;

use crate::ring::LeaseRing;
use crate::tgroup::TrustGroup;

/// Outcome of testing one owner's lease ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The owner is inside a critical section on the inode.
    Active,
    /// The owner is not using the inode; nothing was claimed.
    Idle,
    /// The owner was idle and is now blocked from entering until the claim
    /// is released.
    Claimed,
}

pub trait Admission: Send + Sync {
    fn mode(&self) -> AdmissionMode;

    /// Test `group`'s lease ring for `ino`.
    fn check(&self, group: &TrustGroup, ino: u32) -> Verdict;

    /// Drop a claim taken by a `Claimed` verdict.
    fn release(&self, group: &TrustGroup, ino: u32);
}

/// Test-then-revoke on a single usage bit. A client may re-enter between
/// the test and the unmap; it then sees the map bit cleared on its own
/// check and backs off.
#[derive(Debug, Default)]
pub struct PlainBit;

impl Admission for PlainBit {
    fn mode(&self) -> AdmissionMode {
        AdmissionMode::PlainBit
    }

    fn check(&self, group: &TrustGroup, ino: u32) -> Verdict {
        match group.lease_ring() {
            LeaseRing::Bits(bits) if !bits.test(ino) => Verdict::Idle,
            _ => Verdict::Active,
        }
    }

    fn release(&self, _group: &TrustGroup, _ino: u32) {}
}

/// Claim the owner's counter with a 0 -> SENTINEL CAS, so no critical
/// section can start until the claim is released.
#[derive(Debug, Default)]
pub struct Sentinel;

impl Admission for Sentinel {
    fn mode(&self) -> AdmissionMode {
        AdmissionMode::Sentinel
    }

    fn check(&self, group: &TrustGroup, ino: u32) -> Verdict {
        match group.lease_ring() {
            LeaseRing::Counters(counters) if counters.try_claim(ino) => Verdict::Claimed,
            _ => Verdict::Active,
        }
    }

    fn release(&self, group: &TrustGroup, ino: u32) {
        if let LeaseRing::Counters(counters) = group.lease_ring() {
            counters.release_claim(ino);
        }
    }
}

pub fn for_mode(mode: AdmissionMode) -> Box<dyn Admission> {
    match mode {
        AdmissionMode::PlainBit => Box::new(PlainBit),
        AdmissionMode::Sentinel => Box::new(Sentinel),
    }
}
