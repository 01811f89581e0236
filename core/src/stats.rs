//! Device-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of device activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Hardware jobs dispatched (continuations excluded)
    pub jobs: u64,
    /// Interrupts handled
    pub interrupts: u64,
    /// Interrupts with no job owning the core
    pub spurious_interrupts: u64,
    /// Packed-source continuations inside one job
    pub resubmits: u64,
    /// Commands rejected synchronously
    pub sync_failures: u64,
    /// Completions that made no sense for their instance
    pub protocol_errors: u64,
    /// Lifecycle acknowledgments that missed their deadline
    pub timeouts: u64,
    /// Watchdog recoveries
    pub recoveries: u64,
    /// Firmware boots
    pub firmware_loads: u64,
    /// Instances opened
    pub opens: u64,
    /// Instances destroyed
    pub closes: u64,
    /// Instances in the table right now
    pub open_instances: usize,
    /// Secure instances in the table right now
    pub secure_instances: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) jobs: AtomicU64,
    pub(crate) interrupts: AtomicU64,
    pub(crate) spurious: AtomicU64,
    pub(crate) resubmits: AtomicU64,
    pub(crate) sync_failures: AtomicU64,
    pub(crate) protocol_errors: AtomicU64,
    pub(crate) timeouts: AtomicU64,
    pub(crate) recoveries: AtomicU64,
    pub(crate) firmware_loads: AtomicU64,
    pub(crate) opens: AtomicU64,
    pub(crate) closes: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, open_instances: usize, secure_instances: usize) -> DeviceStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DeviceStats {
            jobs: get(&self.jobs),
            interrupts: get(&self.interrupts),
            spurious_interrupts: get(&self.spurious),
            resubmits: get(&self.resubmits),
            sync_failures: get(&self.sync_failures),
            protocol_errors: get(&self.protocol_errors),
            timeouts: get(&self.timeouts),
            recoveries: get(&self.recoveries),
            firmware_loads: get(&self.firmware_loads),
            opens: get(&self.opens),
            closes: get(&self.closes),
            open_instances,
            secure_instances,
        }
    }
}
