//! The chained hash table.
//!
//! # Layout
//!
//! A table is either `Stable` (one bucket array), `Resizing` (the old array
//! is drained into one twice its size, one bucket at a time), or `Dead`.
//! While resizing, a key lives in its old bucket until that bucket is
//! migrated; new inserts go straight to the new array. A migrated or killed
//! bucket is flagged dead, and anyone who finds a dead bucket (or sees the
//! layout generation move under it) drops its locks and retries.
//!
//! # Lock order
//!
//! Buckets are locked in `(table id, array epoch, bucket index)` order.
//! Every path that holds more than one bucket lock (multi-key operations,
//! migration, kill, iteration) follows it.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use arck_config::{log_cht_debug, log_cht_info, log_cht_trace, LockMode, TableConfig};
use crossbeam::utils::Backoff;
use parking_lot::{Mutex, RwLock};

use crate::bucket::{BucketArray, ChItem, Chain};
use crate::sync::{BucketLock, BucketWriteGuard};
use crate::{clamp_key, fnv1a_hash, ChtError, Result};

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Construction-time knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChtOptions {
    pub lock_mode: LockMode,
    /// Average chain length that triggers a resize.
    pub max_load: usize,
    pub auto_resize: bool,
    /// Buckets each writer migrates while a resize is open. With zero,
    /// writers never help: an automatic resize migrates everything at once
    /// and manual epochs are left to explicit `migrate`/`resize` calls.
    pub migrate_step: usize,
}

impl From<&TableConfig> for ChtOptions {
    fn from(config: &TableConfig) -> Self {
        Self {
            lock_mode: config.lock_mode,
            max_load: config.max_load.max(1),
            auto_resize: config.auto_resize,
            migrate_step: config.migrate_step,
        }
    }
}

impl Default for ChtOptions {
    fn default() -> Self {
        Self::from(&TableConfig::default())
    }
}

/// Whether `replace_from` expects the destination key to be present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DstMode {
    /// Fail with `AlreadyExists` if the destination is taken.
    MustNotExist,
    /// Replace the destination; fail with `DestinationMissing` if absent.
    Overwrite,
}

/// Result of a successful `replace_from`.
#[derive(Debug)]
pub struct Replaced {
    /// The entry now stored under the destination key.
    pub item: Arc<ChItem>,
    /// Values of the destination entry that was overwritten.
    pub displaced: Option<(u64, u64)>,
}

#[derive(Debug, Clone)]
pub struct ChtStats {
    pub nbuckets: usize,
    pub entries: usize,
    pub load_factor: f64,
    pub max_chain: usize,
    pub avg_chain: f64,
    pub resizing: bool,
    pub generation: u64,
}

pub(crate) enum Layout {
    Stable(Arc<BucketArray>),
    Resizing {
        old: Arc<BucketArray>,
        new: Arc<BucketArray>,
        cursor: AtomicUsize,
    },
    Dead,
}

impl Layout {
    /// Buckets that may hold a key with `hash`, or `None` once dead.
    fn home(&self, table: u64, hash: u64) -> Option<Home<'_>> {
        match self {
            Layout::Stable(array) => Some(Home {
                older: None,
                current: Slot::new(table, array, hash),
            }),
            Layout::Resizing { old, new, .. } => Some(Home {
                older: Some(Slot::new(table, old, hash)),
                current: Slot::new(table, new, hash),
            }),
            Layout::Dead => None,
        }
    }

    /// Live arrays, oldest first.
    pub(crate) fn arrays(&self) -> Vec<&BucketArray> {
        match self {
            Layout::Stable(array) => vec![&**array],
            Layout::Resizing { old, new, .. } => vec![&**old, &**new],
            Layout::Dead => Vec::new(),
        }
    }
}

#[derive(Clone, Copy)]
struct Slot<'l> {
    table: u64,
    array: &'l BucketArray,
    index: usize,
}

impl<'l> Slot<'l> {
    fn new(table: u64, array: &'l BucketArray, hash: u64) -> Self {
        Self {
            table,
            array,
            index: array.index(hash),
        }
    }

    fn order(&self) -> (u64, u64, usize) {
        (self.table, self.array.epoch, self.index)
    }

    fn lock(&self) -> &'l BucketLock<Chain> {
        self.array.bucket(self.index)
    }
}

struct Home<'l> {
    older: Option<Slot<'l>>,
    current: Slot<'l>,
}

/// A key's buckets after locking, as positions in `Locked::guards`.
#[derive(Clone, Copy)]
struct ResolvedHome {
    /// Old-array bucket, if not yet migrated.
    older: Option<usize>,
    current: usize,
    hash: u64,
}

/// Layout of one table as seen at a point in time.
pub(crate) struct Snapshot<'t> {
    pub table: &'t ChainHash,
    pub seq: u64,
    pub layout: Arc<Layout>,
}

/// Snapshots of the tables taking part in one operation, indexed like the
/// slice given to `take`.
struct Snapshots<'t> {
    snaps: Vec<Snapshot<'t>>,
}

impl<'t> Snapshots<'t> {
    fn take(tables: &[&'t ChainHash]) -> Self {
        let mut snaps: Vec<Snapshot<'t>> = Vec::with_capacity(tables.len());
        for table in tables {
            let snap = match snaps.iter().find(|s| s.table.id == table.id) {
                Some(seen) => Snapshot {
                    table: seen.table,
                    seq: seen.seq,
                    layout: seen.layout.clone(),
                },
                None => table.snapshot(),
            };
            snaps.push(snap);
        }
        Self { snaps }
    }

    /// Lock the home buckets of `keys` (snapshot index, hash) in global
    /// order. `Ok(None)` means the layout moved underneath; wait and retry.
    fn lock<'s, G>(
        &'s self,
        keys: &[(usize, u64)],
        lock: impl Fn(&'s BucketLock<Chain>) -> G,
    ) -> Result<Option<Locked<G>>>
    where
        G: Deref<Target = Chain>,
    {
        let mut homes = Vec::with_capacity(keys.len());
        for &(snap, hash) in keys {
            let snap = &self.snaps[snap];
            homes.push(snap.layout.home(snap.table.id, hash).ok_or(ChtError::Dead)?);
        }

        let mut slots: Vec<Slot<'s>> = homes
            .iter()
            .flat_map(|home| home.older.into_iter().chain(Some(home.current)))
            .collect();
        slots.sort_by_key(Slot::order);
        slots.dedup_by_key(|slot| slot.order());

        let guards: Vec<G> = slots.iter().map(|slot| lock(slot.lock())).collect();

        if self
            .snaps
            .iter()
            .any(|snap| snap.table.seq.load(Ordering::Acquire) != snap.seq)
        {
            return Ok(None);
        }

        let position = |slot: Slot<'_>| match slots.binary_search_by_key(&slot.order(), Slot::order)
        {
            Ok(i) | Err(i) => i,
        };
        let mut resolved = Vec::with_capacity(homes.len());
        for (home, &(_, hash)) in homes.iter().zip(keys) {
            let current = position(home.current);
            if guards[current].dead {
                return Ok(None);
            }
            let older = home
                .older
                .map(position)
                .filter(|&i| !guards[i].dead);
            resolved.push(ResolvedHome {
                older,
                current,
                hash,
            });
        }

        Ok(Some(Locked {
            guards,
            homes: resolved,
        }))
    }

    fn wait(&self) {
        let backoff = Backoff::new();
        while self
            .snaps
            .iter()
            .all(|snap| snap.table.seq.load(Ordering::Acquire) == snap.seq)
        {
            backoff.snooze();
        }
    }
}

/// Locked home buckets of one or more keys.
struct Locked<G> {
    guards: Vec<G>,
    homes: Vec<ResolvedHome>,
}

impl<G: Deref<Target = Chain>> Locked<G> {
    fn find(&self, home: usize, key: &[u8]) -> Option<(usize, usize)> {
        let home = self.homes[home];
        home.older
            .into_iter()
            .chain(Some(home.current))
            .find_map(|g| self.guards[g].position(home.hash, key).map(|p| (g, p)))
    }

    fn get(&self, home: usize, key: &[u8]) -> Option<&Arc<ChItem>> {
        let (g, p) = self.find(home, key)?;
        Some(&self.guards[g].items[p])
    }

    fn hash(&self, home: usize) -> u64 {
        self.homes[home].hash
    }
}

impl<G: DerefMut<Target = Chain>> Locked<G> {
    fn take(&mut self, home: usize, key: &[u8]) -> Option<Arc<ChItem>> {
        let (g, p) = self.find(home, key)?;
        Some(self.guards[g].items.swap_remove(p))
    }

    fn push(&mut self, home: usize, item: Arc<ChItem>) {
        let current = self.homes[home].current;
        self.guards[current].items.push(item);
    }
}

/// Exclusive access to the bucket(s) of one key, handed to the closure of
/// `ChainHash::with_bucket`.
pub struct BucketTxn<'a, 'l> {
    locked: &'a mut Locked<BucketWriteGuard<'l, Chain>>,
    table: &'a ChainHash,
    key: &'a [u8],
    inserted: bool,
}

impl BucketTxn<'_, '_> {
    /// The clamped key this transaction is bound to.
    pub fn key(&self) -> &[u8] {
        self.key
    }

    pub fn get(&self) -> Option<Arc<ChItem>> {
        self.locked.get(0, self.key).cloned()
    }

    pub fn lookup(&self) -> Option<(u64, u64)> {
        self.locked.get(0, self.key).map(|item| item.values())
    }

    pub fn insert(&mut self, val: u64, val2: u64) -> Result<Arc<ChItem>> {
        if self.locked.get(0, self.key).is_some() {
            return Err(ChtError::AlreadyExists);
        }
        let item = ChItem::new(self.locked.hash(0), self.key, val, val2);
        self.locked.push(0, item.clone());
        self.table.size.fetch_add(1, Ordering::Relaxed);
        self.inserted = true;
        Ok(item)
    }

    pub fn remove(&mut self) -> Option<(u64, u64)> {
        let item = self.locked.take(0, self.key)?;
        self.table.size.fetch_sub(1, Ordering::Relaxed);
        Some(item.values())
    }

    /// Overwrite the values of the existing entry. Returns false if absent.
    pub fn update(&mut self, val: u64, val2: u64) -> bool {
        match self.locked.get(0, self.key) {
            Some(item) => {
                item.set_val(val);
                item.set_val2(val2);
                true
            }
            None => false,
        }
    }
}

pub struct ChainHash {
    id: u64,
    options: ChtOptions,
    layout: RwLock<Arc<Layout>>,
    /// Layout generation; odd exactly while a resize epoch is open. Bumped
    /// when a resize starts or finishes and on kill.
    seq: AtomicU64,
    size: AtomicUsize,
    dead: AtomicBool,
    /// Serializes resize steps and kill.
    resize_lock: Mutex<()>,
}

impl std::fmt::Debug for ChainHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainHash")
            .field("id", &self.id)
            .field("len", &self.len())
            .field("nbuckets", &self.nbuckets())
            .field("dead", &self.is_dead())
            .finish()
    }
}

impl ChainHash {
    /// New table with at least `nbuckets` buckets (rounded up to a power of two).
    pub fn new(nbuckets: usize, options: ChtOptions) -> Self {
        let nbuckets = nbuckets.max(1).next_power_of_two();
        let id = NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed);
        log_cht_debug!("Table created", table = id, nbuckets = nbuckets);
        Self {
            id,
            layout: RwLock::new(Arc::new(Layout::Stable(Arc::new(BucketArray::new(
                0,
                nbuckets,
                options.lock_mode,
            ))))),
            options,
            seq: AtomicU64::new(0),
            size: AtomicUsize::new(0),
            dead: AtomicBool::new(false),
            resize_lock: Mutex::new(()),
        }
    }

    /// New table sized by size class `index`.
    pub fn init(index: usize, config: &TableConfig) -> Self {
        Self::new(config.buckets_for(index), ChtOptions::from(config))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> &ChtOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bucket count of the newest array.
    pub fn nbuckets(&self) -> usize {
        match &**self.layout.read() {
            Layout::Stable(array) => array.len(),
            Layout::Resizing { new, .. } => new.len(),
            Layout::Dead => 0,
        }
    }

    pub fn is_resizing(&self) -> bool {
        matches!(&**self.layout.read(), Layout::Resizing { .. })
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub(crate) fn snapshot(&self) -> Snapshot<'_> {
        let layout = self.layout.read();
        Snapshot {
            table: self,
            seq: self.seq.load(Ordering::Acquire),
            layout: layout.clone(),
        }
    }

    pub(crate) fn wait_for_layout(&self, seen: u64) {
        let backoff = Backoff::new();
        while self.seq.load(Ordering::Acquire) == seen {
            backoff.snooze();
        }
    }

    pub fn get(&self, key: &[u8], max_size: usize) -> Result<Option<Arc<ChItem>>> {
        let key = clamp_key(key, max_size);
        let hash = fnv1a_hash(key);
        loop {
            let snaps = Snapshots::take(&[self]);
            if let Some(locked) = snaps.lock(&[(0, hash)], BucketLock::read)? {
                return Ok(locked.get(0, key).cloned());
            }
            snaps.wait();
        }
    }

    pub fn lookup(&self, key: &[u8], max_size: usize) -> Result<Option<(u64, u64)>> {
        Ok(self.get(key, max_size)?.map(|item| item.values()))
    }

    /// Look up one key in each of two tables under a single locking step.
    pub fn lookup_pair(
        a: &ChainHash,
        ka: &[u8],
        b: &ChainHash,
        kb: &[u8],
        max_size: usize,
    ) -> Result<(Option<(u64, u64)>, Option<(u64, u64)>)> {
        let ka = clamp_key(ka, max_size);
        let kb = clamp_key(kb, max_size);
        let (ha, hb) = (fnv1a_hash(ka), fnv1a_hash(kb));
        loop {
            let snaps = Snapshots::take(&[a, b]);
            if let Some(locked) = snaps.lock(&[(0, ha), (1, hb)], BucketLock::read)? {
                return Ok((
                    locked.get(0, ka).map(|item| item.values()),
                    locked.get(1, kb).map(|item| item.values()),
                ));
            }
            snaps.wait();
        }
    }

    /// Run `f` with the bucket(s) of `key` write-locked.
    ///
    /// Lets a caller check and mutate one key atomically, e.g. an
    /// insert-if-absent that allocates an inode in between. `f` must not
    /// touch other entries of the same table.
    pub fn with_bucket<R>(
        &self,
        key: &[u8],
        max_size: usize,
        f: impl FnOnce(&mut BucketTxn<'_, '_>) -> R,
    ) -> Result<R> {
        let key = clamp_key(key, max_size);
        let hash = fnv1a_hash(key);
        let (out, inserted) = loop {
            let snaps = Snapshots::take(&[self]);
            if let Some(mut locked) = snaps.lock(&[(0, hash)], BucketLock::write)? {
                let mut txn = BucketTxn {
                    locked: &mut locked,
                    table: self,
                    key,
                    inserted: false,
                };
                let out = f(&mut txn);
                break (out, txn.inserted);
            }
            snaps.wait();
        };
        self.after_write(inserted);
        Ok(out)
    }

    pub fn insert(&self, key: &[u8], max_size: usize, val: u64, val2: u64) -> Result<Arc<ChItem>> {
        self.with_bucket(key, max_size, |txn| txn.insert(val, val2))?
    }

    pub fn remove(&self, key: &[u8], max_size: usize) -> Result<Option<(u64, u64)>> {
        self.with_bucket(key, max_size, |txn| txn.remove())
    }

    /// Move the entry `ksrc` of `src` to `kdst` of `dst` with new values.
    ///
    /// Both home buckets are locked for the whole step, so no reader ever
    /// sees the entry under both keys or under neither. Moving a key onto
    /// itself only updates its values.
    #[allow(clippy::too_many_arguments)]
    pub fn replace_from(
        dst: &ChainHash,
        kdst: &[u8],
        mode: DstMode,
        src: &ChainHash,
        ksrc: &[u8],
        vsrc: u64,
        vsrc2: u64,
        max_size: usize,
    ) -> Result<Replaced> {
        let kdst = clamp_key(kdst, max_size);
        let ksrc = clamp_key(ksrc, max_size);
        let (hdst, hsrc) = (fnv1a_hash(kdst), fnv1a_hash(ksrc));

        let outcome = loop {
            let snaps = Snapshots::take(&[dst, src]);
            if let Some(mut locked) = snaps.lock(&[(0, hdst), (1, hsrc)], BucketLock::write)? {
                let same = dst.id == src.id && kdst == ksrc;
                break Self::move_locked(&mut locked, same, kdst, mode, ksrc, vsrc, vsrc2)
                    .map(|(replaced, displaced)| {
                        if !same {
                            src.size.fetch_sub(1, Ordering::Relaxed);
                            if displaced {
                                dst.size.fetch_sub(1, Ordering::Relaxed);
                            }
                            dst.size.fetch_add(1, Ordering::Relaxed);
                        }
                        replaced
                    });
            }
            snaps.wait();
        };

        if outcome.is_ok() {
            log_cht_trace!("Entry moved", src = src.id, dst = dst.id);
            src.after_write(false);
            dst.after_write(true);
        }
        outcome
    }

    fn move_locked(
        locked: &mut Locked<BucketWriteGuard<'_, Chain>>,
        same: bool,
        kdst: &[u8],
        mode: DstMode,
        ksrc: &[u8],
        vsrc: u64,
        vsrc2: u64,
    ) -> Result<(Replaced, bool)> {
        let Some(current) = locked.get(1, ksrc).cloned() else {
            return Err(ChtError::NotFound);
        };
        if same {
            current.set_val(vsrc);
            current.set_val2(vsrc2);
            let replaced = Replaced {
                item: current,
                displaced: None,
            };
            return Ok((replaced, false));
        }

        let dst_present = locked.get(0, kdst).is_some();
        match (mode, dst_present) {
            (DstMode::MustNotExist, true) => return Err(ChtError::AlreadyExists),
            (DstMode::Overwrite, false) => return Err(ChtError::DestinationMissing),
            _ => {}
        }

        if locked.take(1, ksrc).is_none() {
            return Err(ChtError::NotFound);
        }
        let displaced = if dst_present {
            locked.take(0, kdst).map(|item| item.values())
        } else {
            None
        };
        let item = ChItem::new(locked.hash(0), kdst, vsrc, vsrc2);
        locked.push(0, item.clone());
        Ok((Replaced { item, displaced }, displaced.is_some()))
    }

    /// Grow or help an open resize after a write.
    fn after_write(&self, inserted: bool) {
        let layout = self.layout.read().clone();
        match &*layout {
            Layout::Stable(array) => {
                let limit = array.len().saturating_mul(self.options.max_load);
                if inserted && self.options.auto_resize && self.len() > limit {
                    if let Some(_resize) = self.resize_lock.try_lock() {
                        if self.start_resize_locked() {
                            // Without helping writers the epoch must close here.
                            let step = match self.options.migrate_step {
                                0 => usize::MAX,
                                step => step,
                            };
                            self.migrate_locked(step);
                        }
                    }
                }
            }
            Layout::Resizing { .. } if self.options.migrate_step > 0 => {
                if let Some(_resize) = self.resize_lock.try_lock() {
                    self.migrate_locked(self.options.migrate_step);
                }
            }
            _ => {}
        }
    }

    /// Open a resize to twice the current bucket count. Returns false if
    /// one is already open.
    pub fn start_resize(&self) -> Result<bool> {
        let _resize = self.resize_lock.lock();
        if self.is_dead() {
            return Err(ChtError::Dead);
        }
        Ok(self.start_resize_locked())
    }

    /// Migrate up to `max_buckets` buckets of the open resize. Returns the
    /// number of old buckets still to go.
    pub fn migrate(&self, max_buckets: usize) -> usize {
        let _resize = self.resize_lock.lock();
        self.migrate_locked(max_buckets)
    }

    /// Double the bucket count and migrate everything before returning.
    pub fn resize(&self) -> Result<()> {
        let _resize = self.resize_lock.lock();
        if self.is_dead() {
            return Err(ChtError::Dead);
        }
        self.start_resize_locked();
        self.migrate_locked(usize::MAX);
        Ok(())
    }

    fn start_resize_locked(&self) -> bool {
        let mut layout = self.layout.write();
        let Layout::Stable(old) = &**layout else {
            return false;
        };
        let old = old.clone();
        let new = Arc::new(BucketArray::new(
            old.epoch + 1,
            old.len() * 2,
            self.options.lock_mode,
        ));
        let nbuckets = new.len();
        *layout = Arc::new(Layout::Resizing {
            old,
            new,
            cursor: AtomicUsize::new(0),
        });
        self.seq.fetch_add(1, Ordering::AcqRel);
        drop(layout);

        log_cht_info!("Resize started", table = self.id, nbuckets = nbuckets, entries = self.len());
        true
    }

    fn migrate_locked(&self, max_buckets: usize) -> usize {
        let layout = self.layout.read().clone();
        let Layout::Resizing { old, new, cursor } = &*layout else {
            return 0;
        };

        let start = cursor.load(Ordering::Relaxed);
        let end = start.saturating_add(max_buckets).min(old.len());
        let mut moved = 0;
        for index in start..end {
            moved += migrate_bucket(old, new, index);
        }
        cursor.store(end, Ordering::Relaxed);
        log_cht_trace!("Buckets migrated", table = self.id, from = start, to = end, items = moved);

        if end < old.len() {
            return old.len() - end;
        }

        let mut current = self.layout.write();
        if Arc::ptr_eq(&*current, &layout) {
            *current = Arc::new(Layout::Stable(new.clone()));
            self.seq.fetch_add(1, Ordering::AcqRel);
        }
        drop(current);

        log_cht_info!("Resize finished", table = self.id, nbuckets = new.len());
        0
    }

    /// Kill an empty table. Fails with `NotEmpty` and leaves the table
    /// untouched if any entry remains.
    pub fn remove_and_kill(&self) -> Result<()> {
        let _resize = self.resize_lock.lock();
        let layout = self.layout.read().clone();
        let arrays = layout.arrays();
        if arrays.is_empty() {
            return Err(ChtError::Dead);
        }

        let mut guards: Vec<_> = arrays
            .iter()
            .copied()
            .flat_map(|array| array.iter())
            .map(|bucket| bucket.write())
            .collect();
        if guards.iter().any(|chain| !chain.items.is_empty()) {
            return Err(ChtError::NotEmpty);
        }
        self.kill_locked(&mut guards);
        Ok(())
    }

    /// Kill the table, discarding whatever it holds. Returns the number of
    /// entries dropped.
    pub fn forced_remove_and_kill(&self) -> Result<usize> {
        let _resize = self.resize_lock.lock();
        let layout = self.layout.read().clone();
        let arrays = layout.arrays();
        if arrays.is_empty() {
            return Err(ChtError::Dead);
        }

        let mut guards: Vec<_> = arrays
            .iter()
            .copied()
            .flat_map(|array| array.iter())
            .map(|bucket| bucket.write())
            .collect();
        let drained: usize = guards
            .iter_mut()
            .map(|chain| {
                let n = chain.items.len();
                chain.items.clear();
                n
            })
            .sum();
        self.size.fetch_sub(drained, Ordering::Relaxed);
        self.kill_locked(&mut guards);
        Ok(drained)
    }

    fn kill_locked(&self, guards: &mut [BucketWriteGuard<'_, Chain>]) {
        for chain in guards.iter_mut() {
            chain.dead = true;
        }
        self.dead.store(true, Ordering::Release);
        *self.layout.write() = Arc::new(Layout::Dead);
        // Land on the next even value: no epoch is open on a dead table.
        let step = if self.seq.load(Ordering::Acquire) & 1 == 1 { 1 } else { 2 };
        self.seq.fetch_add(step, Ordering::AcqRel);
        log_cht_debug!("Table killed", table = self.id);
    }

    /// Chain statistics. Buckets are sampled one at a time, so the numbers
    /// are approximate while writers are active.
    pub fn stats(&self) -> ChtStats {
        let snap = self.snapshot();
        let mut max_chain = 0;
        let mut occupied = 0;
        let mut entries = 0;
        for array in snap.layout.arrays() {
            for bucket in array.iter() {
                let len = bucket.read().items.len();
                if len > 0 {
                    occupied += 1;
                    entries += len;
                    max_chain = max_chain.max(len);
                }
            }
        }
        let nbuckets = match &*snap.layout {
            Layout::Stable(array) => array.len(),
            Layout::Resizing { new, .. } => new.len(),
            Layout::Dead => 0,
        };
        ChtStats {
            nbuckets,
            entries,
            load_factor: if nbuckets > 0 {
                entries as f64 / nbuckets as f64
            } else {
                0.0
            },
            max_chain,
            avg_chain: if occupied > 0 {
                entries as f64 / occupied as f64
            } else {
                0.0
            },
            resizing: matches!(&*snap.layout, Layout::Resizing { .. }),
            generation: snap.seq,
        }
    }
}

/// Drain old bucket `index` into its two successors. Returns the number
/// of items moved.
fn migrate_bucket(old: &BucketArray, new: &BucketArray, index: usize) -> usize {
    let mut src = old.bucket(index).write();
    if src.dead {
        return 0;
    }
    let mut lo = new.bucket(index).write();
    let mut hi = new.bucket(index + old.len()).write();
    let moved = src.items.len();
    for item in src.items.drain(..) {
        if new.index(item.hash()) == index {
            lo.items.push(item);
        } else {
            hi.items.push(item);
        }
    }
    src.dead = true;
    moved
}
