//! # Watchdog
//!
//! Detects a core that holds the hardware lock without ever raising the
//! interrupt, and recovers the device.
//!
//! Recovery always wins over concurrent open/close: every instance is forced
//! to `Error` with `HardwareFault`, its buffers are returned, the lock and
//! the scheduling state are cleared, waiters are woken and the firmware is
//! rebooted if instances remain in the table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::device::Device;
use crate::stats::Counters;

impl Device {
    /// One watchdog period elapsed; returns `true` if it triggered recovery
    pub fn watchdog_tick(&self) -> bool {
        if !self.hw_lock.is_held() {
            self.stall_ticks.store(0, Ordering::Release);
            return false;
        }

        let ticks = self.stall_ticks.fetch_add(1, Ordering::AcqRel) + 1;
        if ticks < self.config.watchdog_threshold {
            return false;
        }

        log::error!(
            "watchdog: core stalled for {} ticks (owner {:?})",
            ticks,
            self.hw_lock.owner()
        );
        self.recover();
        true
    }

    /// Reset the device after a stall
    pub fn recover(&self) {
        Counters::bump(&self.counters.recoveries);
        self.stall_ticks.store(0, Ordering::Release);

        let mut lifecycle = self.lifecycle.lock();
        let remaining = {
            let mut table = self.table.lock();
            for entry in table.entries_mut() {
                entry.instance.on_device_fault();
            }
            table.clear_scheduling();
            self.hw_lock.clear_owner();
            self.hw_lock.force_release();
            table.num_open()
        };

        if let Some(firmware) = lifecycle.firmware {
            if remaining > 0 {
                match self.boot(&firmware) {
                    Ok(()) => log::info!("watchdog: firmware reloaded"),
                    Err(err) => log::error!("watchdog: firmware reload failed: {}", err),
                }
            } else {
                self.unload_if_idle(&mut lifecycle);
            }
        }
        drop(lifecycle);

        self.waiters.wake_all();
        self.run_one();
    }
}

/// Background thread ticking a device's watchdog
///
/// Dropping the handle stops the thread.
#[derive(Debug)]
pub struct Watchdog {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Tick `device` every configured watchdog period
    pub fn spawn(device: Arc<Device>) -> Self {
        let period = device.config().watchdog_period();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                thread::park_timeout(period);
                if flag.load(Ordering::Acquire) {
                    break;
                }
                device.watchdog_tick();
            }
        });
        Self {
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}
