//! Self-checking stress runs over the hash table and the lease manager.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use arck_cht::{ChainHash, ChtError, ChtOptions, DirentIter, DstMode, END_OF_DIR};
use arck_config::{log_ctl_info, AdmissionMode, InodeConfig, LeaseConfig, LockMode, TableConfig};
use arck_lease::{
    LeaseError, LeaseManager, LeaseState, MonotonicClock, ShadowInodeTable, TgId, MAX_OWNERS,
    NAME_MAX,
};

/// Small xorshift generator; stress runs only need cheap spread.
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1)
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n.max(1)
    }
}

#[derive(Debug, Clone)]
pub struct TableStress {
    pub threads: usize,
    pub keys: usize,
    pub lock_mode: LockMode,
    pub table: TableConfig,
}

#[derive(Debug, Default)]
pub struct TableReport {
    pub elapsed: Duration,
    pub operations: u64,
    pub entries: usize,
    pub nbuckets: usize,
    pub moves: u64,
    pub violations: Vec<String>,
}

impl TableReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

impl fmt::Display for TableReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "table stress: {} ops in {:?}", self.operations, self.elapsed)?;
        writeln!(f, "  entries:    {}", self.entries)?;
        writeln!(f, "  buckets:    {}", self.nbuckets)?;
        writeln!(f, "  moves:      {}", self.moves)?;
        write!(f, "  violations: {}", self.violations.len())?;
        for violation in &self.violations {
            write!(f, "\n    {violation}")?;
        }
        Ok(())
    }
}

/// Each thread churns its own key range while moving shared keys between
/// two tables; afterwards sizes, lookups and both iterators must agree.
pub fn run_table_stress(opts: &TableStress) -> Result<TableReport> {
    let config = TableConfig {
        lock_mode: opts.lock_mode,
        ..opts.table.clone()
    };
    let main = ChainHash::init(0, &config);
    let side = ChainHash::new(config.buckets_for(0), ChtOptions::from(&config));
    let operations = AtomicU64::new(0);
    let moves = AtomicU64::new(0);
    let threads = opts.threads.max(1);
    let keys = opts.keys.max(1);

    log_ctl_info!("Table stress started", threads = threads, keys = keys);
    let start = Instant::now();

    for t in 0..threads {
        main.insert(format!("shared-{t}").as_bytes(), NAME_MAX, t as u64, 0)
            .context("seeding shared keys")?;
    }

    thread::scope(|scope| -> Result<()> {
        let workers: Vec<_> = (0..threads)
            .map(|t| {
                let (main, side, operations, moves) = (&main, &side, &operations, &moves);
                scope.spawn(move || -> Result<(), String> {
                    let mut rng = XorShift::new(t as u64 + 1);
                    for i in 0..keys {
                        let key = format!("t{t}-{i}");
                        main.insert(key.as_bytes(), NAME_MAX, i as u64, t as u64)
                            .map_err(|e| format!("insert {key}: {e}"))?;
                        match main.lookup(key.as_bytes(), NAME_MAX) {
                            Ok(Some((v, v2))) if v == i as u64 && v2 == t as u64 => {}
                            other => return Err(format!("lookup {key} after insert: {other:?}")),
                        }
                        if i % 2 == 1 {
                            let got = main.remove(key.as_bytes(), NAME_MAX);
                            if got != Ok(Some((i as u64, t as u64))) {
                                return Err(format!("remove {key}: {got:?}"));
                            }
                        }

                        // Shuttle a shared key between the two tables.
                        let shared = format!("shared-{}", rng.below(threads as u64));
                        let (src, dst) = if rng.below(2) == 0 { (main, side) } else { (side, main) };
                        match ChainHash::replace_from(
                            dst,
                            shared.as_bytes(),
                            DstMode::MustNotExist,
                            src,
                            shared.as_bytes(),
                            i as u64,
                            0,
                            NAME_MAX,
                        ) {
                            Ok(_) => {
                                moves.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(ChtError::NotFound) | Err(ChtError::AlreadyExists) => {}
                            Err(err) => return Err(format!("move {shared}: {err}")),
                        }
                        operations.fetch_add(3, Ordering::Relaxed);
                    }
                    Ok(())
                })
            })
            .collect();

        for worker in workers {
            match worker.join() {
                Ok(Ok(())) => {}
                Ok(Err(violation)) => anyhow::bail!("worker failed: {violation}"),
                Err(_) => anyhow::bail!("worker panicked"),
            }
        }
        Ok(())
    })?;

    let elapsed = start.elapsed();
    while main.is_resizing() {
        main.migrate(usize::MAX);
    }
    let mut report = TableReport {
        elapsed,
        operations: operations.load(Ordering::Relaxed),
        entries: main.len(),
        nbuckets: main.nbuckets(),
        moves: moves.load(Ordering::Relaxed),
        violations: Vec::new(),
    };

    let survivors = threads * keys.div_ceil(2);
    let mut shared_seen = 0;
    for t in 0..threads {
        let key = format!("shared-{t}");
        let here = main.lookup(key.as_bytes(), NAME_MAX)?.is_some();
        let there = side.lookup(key.as_bytes(), NAME_MAX)?.is_some();
        if here == there {
            report.violations.push(format!("{key} present in both tables or neither"));
        }
        shared_seen += usize::from(here);
    }
    if main.len() != survivors + shared_seen {
        report.violations.push(format!(
            "size {} but {} entries expected",
            main.len(),
            survivors + shared_seen
        ));
    }

    let mut enumerated = 0;
    let mut prev: Option<Vec<u8>> = None;
    while let Some(key) = main.enumerate(prev.as_deref(), NAME_MAX)? {
        enumerated += 1;
        prev = Some(key);
    }
    if enumerated != main.len() {
        report
            .violations
            .push(format!("enumerate saw {enumerated} of {} entries", main.len()));
    }

    let mut listed = 0;
    let mut offset = 0;
    let mut buf = vec![0u8; 4096];
    while offset != END_OF_DIR {
        let n = main.getdents(NAME_MAX, &mut offset, &mut buf)?;
        listed += DirentIter::new(&buf[..n]).count();
    }
    if listed != main.len() {
        report
            .violations
            .push(format!("getdents listed {listed} of {} entries", main.len()));
    }

    Ok(report)
}

#[derive(Debug, Clone)]
pub struct LeaseStress {
    pub groups: u32,
    pub inodes: u32,
    pub rounds: usize,
    pub lease: LeaseConfig,
    pub table: TableConfig,
}

#[derive(Debug, Default)]
pub struct LeaseReport {
    pub elapsed: Duration,
    pub admission: Option<AdmissionMode>,
    pub grants: u64,
    pub busy: u64,
    pub revocations: u64,
    pub sections: u64,
    /// Critical sections that overlapped a conflicting one. Expected to be
    /// possible under the plain-bit protocol only.
    pub overlaps: u64,
    pub violations: Vec<String>,
}

impl LeaseReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

impl fmt::Display for LeaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "lease stress ({:?}) in {:?}", self.admission, self.elapsed)?;
        writeln!(f, "  grants:      {}", self.grants)?;
        writeln!(f, "  busy:        {}", self.busy)?;
        writeln!(f, "  revocations: {}", self.revocations)?;
        writeln!(f, "  sections:    {}", self.sections)?;
        writeln!(f, "  overlaps:    {}", self.overlaps)?;
        write!(f, "  violations:  {}", self.violations.len())?;
        for violation in &self.violations {
            write!(f, "\n    {violation}")?;
        }
        Ok(())
    }
}

/// Per-inode occupancy: -1 while a writer is inside, else the reader count.
struct Occupancy(Vec<AtomicI64>);

impl Occupancy {
    fn enter(&self, ino: u32, write: bool) -> bool {
        let cell = &self.0[ino as usize];
        if write {
            cell.compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        } else {
            cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n >= 0).then_some(n + 1))
                .is_ok()
        }
    }

    fn exit(&self, ino: u32, write: bool) {
        let cell = &self.0[ino as usize];
        if write {
            cell.store(0, Ordering::Release);
        } else {
            cell.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Groups race for leases on a few inodes and use them only inside
/// critical sections; conflicting sections must never overlap.
pub fn run_lease_stress(opts: &LeaseStress) -> Result<LeaseReport> {
    let groups = opts.groups.max(1);
    let ninodes = opts.inodes.max(1);
    let table = Arc::new(ShadowInodeTable::new(
        &InodeConfig {
            capacity: ninodes as usize + 1,
        },
        &opts.table,
    ));
    let inos = (0..ninodes)
        .map(|i| table.create(format!("file-{i}").as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .context("creating shadow inodes")?;
    let manager = LeaseManager::new(table.clone(), MonotonicClock::new(), &opts.lease);
    let occupancy = Occupancy((0..=ninodes).map(|_| AtomicI64::new(0)).collect());
    let sections = AtomicU64::new(0);
    let overlaps = AtomicU64::new(0);
    let failures = AtomicUsize::new(0);

    let members = (0..groups)
        .map(|id| manager.register_group(TgId(id)))
        .collect::<Result<Vec<_>, _>>()
        .context("registering trust groups")?;

    log_ctl_info!(
        "Lease stress started",
        groups = groups,
        inodes = ninodes,
        rounds = opts.rounds,
    );
    let start = Instant::now();

    thread::scope(|scope| {
        for group in &members {
            let (manager, inos, occupancy) = (&manager, &inos, &occupancy);
            let (sections, overlaps, failures) = (&sections, &overlaps, &failures);
            scope.spawn(move || {
                let mut rng = XorShift::new(u64::from(group.id().0) + 17);
                for _ in 0..opts.rounds {
                    let ino = inos[rng.below(inos.len() as u64) as usize];
                    let write = rng.below(4) == 0;
                    let granted = if write {
                        manager.acquire_write(ino, group.id())
                    } else {
                        manager.acquire_read(ino, group.id())
                    };
                    match granted {
                        Ok(()) | Err(LeaseError::Busy) | Err(LeaseError::InvalidRequest) => {}
                        Err(LeaseError::CapacityExceeded) if !write => {}
                        Err(_) => {
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }

                    // Use whatever access the group currently holds.
                    let held = match manager.snapshot(ino) {
                        Ok(snap) if snap.holds(group.id()) => Some(snap.state == LeaseState::WriteOwned),
                        _ => None,
                    };
                    if let (Some(as_writer), Ok(cs)) = (held, group.enter(ino)) {
                        if occupancy.enter(ino, as_writer) {
                            sections.fetch_add(1, Ordering::Relaxed);
                            thread::yield_now();
                            occupancy.exit(ino, as_writer);
                        } else {
                            overlaps.fetch_add(1, Ordering::Relaxed);
                        }
                        drop(cs);
                    }

                    if rng.below(3) == 0 {
                        let _ = manager.release(ino, group.id());
                    }
                }
            });
        }
    });

    let stats = manager.stats();
    let mut report = LeaseReport {
        elapsed: start.elapsed(),
        admission: Some(manager.admission_mode()),
        grants: stats.grants,
        busy: stats.busy,
        revocations: stats.revocations,
        sections: sections.load(Ordering::Relaxed),
        overlaps: overlaps.load(Ordering::Relaxed),
        violations: Vec::new(),
    };

    let failures = failures.load(Ordering::Relaxed);
    if failures > 0 {
        report.violations.push(format!("{failures} unexpected lease errors"));
    }
    if report.overlaps > 0 && manager.admission_mode() == AdmissionMode::Sentinel {
        report
            .violations
            .push(format!("{} conflicting critical sections overlapped", report.overlaps));
    }

    for &ino in &inos {
        let snap = manager.snapshot(ino)?;
        let shape_ok = match snap.state {
            LeaseState::Unowned => snap.owners.is_empty(),
            LeaseState::WriteOwned => snap.owners.len() == 1,
            LeaseState::ReadOwned => !snap.owners.is_empty() && snap.owners.len() <= MAX_OWNERS,
        };
        if !shape_ok {
            report.violations.push(format!("inode {ino}: malformed lease {snap:?}"));
        }
        for (owner, _) in &snap.owners {
            manager.release(ino, *owner)?;
        }
        for group in &members {
            if group.is_mapped(ino) {
                report
                    .violations
                    .push(format!("inode {ino}: {} still mapped after release", group.id()));
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xorshift_spreads() {
        let mut rng = XorShift::new(0);
        let picks: std::collections::HashSet<u64> = (0..64).map(|_| rng.below(8)).collect();
        assert!(picks.len() > 4);
    }

    #[test]
    fn test_small_table_stress_is_clean() {
        let report = run_table_stress(&TableStress {
            threads: 3,
            keys: 200,
            lock_mode: LockMode::RwLock,
            table: TableConfig {
                size_classes: vec![4],
                ..TableConfig::default()
            },
        })
        .unwrap();
        assert!(report.is_clean(), "{report}");
        assert!(report.nbuckets > 4);
    }

    #[test]
    fn test_small_lease_stress_is_clean() {
        let report = run_lease_stress(&LeaseStress {
            groups: 4,
            inodes: 3,
            rounds: 300,
            lease: LeaseConfig {
                period_ms: 60_000,
                admission: AdmissionMode::Sentinel,
            },
            table: TableConfig::default(),
        })
        .unwrap();
        assert!(report.is_clean(), "{report}");
        assert_eq!(report.overlaps, 0);
        assert!(report.grants > 0);
    }
}
