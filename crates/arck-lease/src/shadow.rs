//! Shadow inode table: controller-side inode records with embedded leases,
//! indexed by name through a chained hash table.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use arck_cht::{ChainHash, ChtError};
use arck_config::{log_inode_debug, log_inode_trace, InodeConfig, TableConfig};
use crossbeam::queue::ArrayQueue;
use thiserror::Error;

use crate::lease::Lease;
use crate::manager::InodeResolver;

/// Longest file name; longer keys are clamped.
pub const NAME_MAX: usize = 255;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InodeError {
    #[error("name already exists")]
    Exists,

    #[error("no such name")]
    NotFound,

    #[error("inode {0} is still leased")]
    Leased(u32),

    #[error("no free shadow inodes")]
    Full,

    #[error("name index: {0}")]
    Table(#[from] ChtError),
}

pub struct ShadowInode {
    ino: u32,
    generation: AtomicU32,
    live: AtomicBool,
    lease: Lease,
}

impl ShadowInode {
    fn new(ino: u32) -> Self {
        Self {
            ino,
            generation: AtomicU32::new(0),
            live: AtomicBool::new(false),
            lease: Lease::new(),
        }
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    /// Bumped every time the slot is handed to a new file.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }
}

/// Fixed pool of shadow inodes. Inode 0 is never handed out.
pub struct ShadowInodeTable {
    inodes: Box<[ShadowInode]>,
    names: ChainHash,
    free: ArrayQueue<u32>,
}

impl ShadowInodeTable {
    pub fn new(inodes: &InodeConfig, table: &TableConfig) -> Self {
        let capacity = inodes.capacity.clamp(2, u32::MAX as usize);
        let free = ArrayQueue::new(capacity - 1);
        for ino in 1..capacity as u32 {
            let _ = free.push(ino);
        }
        log_inode_debug!("Shadow inode table created", capacity = capacity);
        Self {
            inodes: (0..capacity as u32).map(ShadowInode::new).collect(),
            names: ChainHash::init(1, table),
            free,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(&InodeConfig { capacity }, &TableConfig::default())
    }

    /// Number of live inodes.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &ChainHash {
        &self.names
    }

    /// Allocate an inode for `name`. Serialised against any other create
    /// or unlink of the same name.
    pub fn create(&self, name: &[u8]) -> Result<u32, InodeError> {
        let (ino, generation) = self
            .names
            .with_bucket(name, NAME_MAX, |txn| -> Result<(u32, u32), InodeError> {
                if txn.lookup().is_some() {
                    return Err(InodeError::Exists);
                }
                let ino = self.free.pop().ok_or(InodeError::Full)?;
                let inode = &self.inodes[ino as usize];
                let generation = inode.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
                inode.lease.revive();
                inode.live.store(true, Ordering::Release);

                if let Err(err) = txn.insert(u64::from(ino), u64::from(generation)) {
                    inode.live.store(false, Ordering::Release);
                    let _ = self.free.push(ino);
                    return Err(err.into());
                }
                Ok((ino, generation))
            })??;
        log_inode_trace!("Shadow inode created", ino = ino, generation = generation);
        Ok(ino)
    }

    /// Remove `name` and free its inode. Refused while the inode is leased;
    /// once this succeeds the old lease grants nothing.
    pub fn unlink(&self, name: &[u8]) -> Result<u32, InodeError> {
        let ino = self.names.with_bucket(name, NAME_MAX, |txn| -> Result<u32, InodeError> {
            let (ino, _) = txn.lookup().ok_or(InodeError::NotFound)?;
            let ino = u32::try_from(ino).map_err(|_| InodeError::NotFound)?;
            let inode = self.inodes.get(ino as usize).ok_or(InodeError::NotFound)?;
            if !inode.lease.try_retire() {
                return Err(InodeError::Leased(ino));
            }
            txn.remove();
            inode.live.store(false, Ordering::Release);
            let _ = self.free.push(ino);
            Ok(ino)
        })??;
        log_inode_trace!("Shadow inode unlinked", ino = ino);
        Ok(ino)
    }

    /// `(ino, generation)` of `name`.
    pub fn lookup(&self, name: &[u8]) -> Result<Option<(u32, u32)>, InodeError> {
        Ok(self
            .names
            .lookup(name, NAME_MAX)?
            .map(|(ino, generation)| (ino as u32, generation as u32)))
    }

    /// The live inode numbered `ino`.
    pub fn get(&self, ino: u32) -> Option<&ShadowInode> {
        self.inodes.get(ino as usize).filter(|inode| inode.is_live())
    }
}

impl InodeResolver for ShadowInodeTable {
    fn lease(&self, ino: u32) -> Option<&Lease> {
        self.get(ino).map(ShadowInode::lease)
    }

    fn capacity(&self) -> usize {
        self.inodes.len()
    }
}
