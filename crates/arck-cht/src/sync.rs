//! Lock primitives shared by the hash table and the lease manager.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use arck_config::LockMode;
use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Test-and-test-and-set spin lock.
///
/// Critical sections under this lock must be short and must not block,
/// allocate, or take another lock.
pub struct SpinLock<T> {
    locked: CachePadded<AtomicBool>,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by `locked`.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: CachePadded::new(AtomicBool::new(false)),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, T> {
        let backoff = Backoff::new();
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinGuard { lock: self };
            }
            // Spin on a plain load so waiters don't bounce the cache line.
            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
    }

    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinGuard { lock: self })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// Per-bucket lock, one of two strategies picked when the table is built.
pub enum BucketLock<T> {
    /// Readers and writers are mutually exclusive.
    Spin(SpinLock<T>),
    /// Shared readers, exclusive writers.
    ReadWrite(RwLock<T>),
}

impl<T> BucketLock<T> {
    pub fn new(mode: LockMode, data: T) -> Self {
        match mode {
            LockMode::Spin => BucketLock::Spin(SpinLock::new(data)),
            LockMode::RwLock => BucketLock::ReadWrite(RwLock::new(data)),
        }
    }

    pub fn mode(&self) -> LockMode {
        match self {
            BucketLock::Spin(_) => LockMode::Spin,
            BucketLock::ReadWrite(_) => LockMode::RwLock,
        }
    }

    pub fn read(&self) -> BucketReadGuard<'_, T> {
        match self {
            BucketLock::Spin(lock) => BucketReadGuard::Spin(lock.lock()),
            BucketLock::ReadWrite(lock) => BucketReadGuard::ReadWrite(lock.read()),
        }
    }

    pub fn write(&self) -> BucketWriteGuard<'_, T> {
        match self {
            BucketLock::Spin(lock) => BucketWriteGuard::Spin(lock.lock()),
            BucketLock::ReadWrite(lock) => BucketWriteGuard::ReadWrite(lock.write()),
        }
    }
}

pub enum BucketReadGuard<'a, T> {
    Spin(SpinGuard<'a, T>),
    ReadWrite(RwLockReadGuard<'a, T>),
}

impl<T> Deref for BucketReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            BucketReadGuard::Spin(guard) => guard,
            BucketReadGuard::ReadWrite(guard) => guard,
        }
    }
}

pub enum BucketWriteGuard<'a, T> {
    Spin(SpinGuard<'a, T>),
    ReadWrite(RwLockWriteGuard<'a, T>),
}

impl<T> Deref for BucketWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            BucketWriteGuard::Spin(guard) => guard,
            BucketWriteGuard::ReadWrite(guard) => guard,
        }
    }
}

impl<T> DerefMut for BucketWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match self {
            BucketWriteGuard::Spin(guard) => guard,
            BucketWriteGuard::ReadWrite(guard) => guard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_spin_lock_excludes() {
        let lock = SpinLock::new(0u64);
        let guard = lock.lock();
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(!lock.is_locked());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_spin_lock_counts_under_contention() {
        let lock = Arc::new(SpinLock::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 80_000);
    }

    #[test]
    fn test_rw_bucket_allows_shared_readers() {
        let lock = BucketLock::new(LockMode::RwLock, vec![1, 2, 3]);
        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(r1.len() + r2.len(), 6);
    }

    #[test]
    fn test_spin_bucket_write_then_read() {
        let lock = BucketLock::new(LockMode::Spin, Vec::<u8>::new());
        assert_eq!(lock.mode(), LockMode::Spin);
        lock.write().push(7);
        assert_eq!(&*lock.read(), &[7]);
    }
}
