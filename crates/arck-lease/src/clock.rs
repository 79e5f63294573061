//! Monotonic tick sources for lease timestamps. One tick is one nanosecond.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub trait CycleCounter: Send + Sync {
    fn now(&self) -> u64;
}

/// Nanoseconds since the clock was created.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleCounter for MonotonicClock {
    fn now(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            ticks: AtomicU64::new(start),
        }
    }

    pub fn set(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::Release);
    }

    pub fn advance(&self, ticks: u64) -> u64 {
        self.ticks.fetch_add(ticks, Ordering::AcqRel) + ticks
    }
}

impl CycleCounter for ManualClock {
    fn now(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }
}

impl<C: CycleCounter + ?Sized> CycleCounter for Arc<C> {
    fn now(&self) -> u64 {
        (**self).now()
    }
}
