//! # Hardware Lock
//!
//! The codec core runs one job at a time. Whoever holds this lock owns the
//! core from command submission until the job's interrupt, and the core's
//! clock is ungated exactly while the lock is held.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mfc_hal::{Error, PowerControl, Result};

const NO_OWNER: usize = usize::MAX;

/// Device-wide execution lock
pub(crate) struct HwLock {
    held: AtomicBool,
    owner: AtomicUsize,
    power: Arc<dyn PowerControl>,
}

impl HwLock {
    pub(crate) fn new(power: Arc<dyn PowerControl>) -> Self {
        Self {
            held: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_OWNER),
            power,
        }
    }

    /// Take the lock if free; never waits
    pub(crate) fn try_acquire(&self) -> bool {
        let acquired = self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if acquired {
            self.power.clock_on();
        }
        acquired
    }

    /// Take the lock, waiting for the running job at most `timeout`
    pub(crate) fn acquire_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !self.try_acquire() {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    /// Give the lock back; the clock is gated before anyone else can take it
    pub(crate) fn release(&self) {
        self.owner.store(NO_OWNER, Ordering::Release);
        self.power.clock_off();
        self.held.store(false, Ordering::Release);
    }

    /// Clear the lock whoever holds it (recovery only)
    pub(crate) fn force_release(&self) {
        if self.held.load(Ordering::Acquire) {
            log::warn!("hwlock: forced release (owner {:?})", self.owner());
            self.release();
        }
    }

    pub(crate) fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Slot whose job is on the core
    pub(crate) fn owner(&self) -> Option<usize> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            slot => Some(slot),
        }
    }

    pub(crate) fn set_owner(&self, slot: usize) {
        self.owner.store(slot, Ordering::Release);
    }

    pub(crate) fn clear_owner(&self) {
        self.owner.store(NO_OWNER, Ordering::Release);
    }
}

impl core::fmt::Debug for HwLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HwLock")
            .field("held", &self.is_held())
            .field("owner", &self.owner())
            .finish()
    }
}
