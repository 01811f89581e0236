//! # Device
//!
//! One [`Device`] per physical codec core. It owns the firmware, the
//! instance table, the hardware lock and the resource pool, and exposes the
//! client surface: open, queue buffers, poll completions, close.
//!
//! ## Locks
//!
//! ```text
//!   lifecycle (spin)  firmware load/unload, insert/remove, recovery
//!        │
//!        ▼
//!   table (spin)      instances, pending mask, priority; never held
//!        │            across a wait
//!        ▼
//!   pool (internal)   allocations
//!
//!   hw lock (atomic)  one job on the core, from submit to interrupt
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use mfc_hal::{
    AllocFlags, Error, Geometry, HardwareOps, MemoryAllocator, OpenParams, PowerControl, Result,
};
use mfc_instance::sizes::{context_size, DEVICE_CONTEXT_SIZE};
use mfc_instance::{Buffer, CloseStep, Completion, Instance, InstanceStats, State};
use mfc_memory::{BufferHandle, PoolStats, ResourceKind, ResourcePool};
use spin::Mutex;

use crate::config::DeviceConfig;
use crate::hwlock::HwLock;
use crate::stats::{Counters, DeviceStats};
use crate::table::{Entry, InstanceHandle, InstanceTable};
use crate::wait::WaitQueue;

/// Platform services the device runs on
#[derive(Clone)]
pub struct Platform {
    /// The codec core
    pub hw: Arc<dyn HardwareOps>,
    /// Clock and power controller
    pub power: Arc<dyn PowerControl>,
    /// Physical memory allocator
    pub allocator: Arc<dyn MemoryAllocator>,
}

impl core::fmt::Debug for Platform {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}

/// Firmware resident on the core
#[derive(Debug, Clone, Copy)]
pub(crate) struct Firmware {
    pub(crate) image: BufferHandle,
    pub(crate) context: BufferHandle,
}

#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    pub(crate) firmware: Option<Firmware>,
}

/// The codec device
pub struct Device {
    pub(crate) config: DeviceConfig,
    pub(crate) hw: Arc<dyn HardwareOps>,
    pub(crate) power: Arc<dyn PowerControl>,
    pub(crate) firmware: Vec<u8>,
    pub(crate) pool: ResourcePool,
    pub(crate) lifecycle: Mutex<Lifecycle>,
    pub(crate) table: Mutex<InstanceTable>,
    pub(crate) hw_lock: HwLock,
    pub(crate) waiters: WaitQueue,
    pub(crate) suspended: AtomicBool,
    /// Opens admitted but not yet acknowledged
    pub(crate) opening: AtomicUsize,
    pub(crate) stall_ticks: AtomicU32,
    pub(crate) counters: Counters,
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .field("hw_lock", &self.hw_lock)
            .field("suspended", &self.suspended.load(Ordering::Relaxed))
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Create a device; the firmware is loaded on the first open
    pub fn new(config: DeviceConfig, platform: Platform, firmware: Vec<u8>) -> Result<Self> {
        config.validate()?;
        if firmware.is_empty() {
            return Err(Error::InvalidParameter);
        }

        log::info!(
            "mfc: device up, {} instances max, {} byte firmware",
            config.max_instances,
            firmware.len()
        );

        Ok(Self {
            config,
            hw: platform.hw,
            power: platform.power.clone(),
            firmware,
            pool: ResourcePool::new(platform.allocator),
            lifecycle: Mutex::new(Lifecycle::default()),
            table: Mutex::new(InstanceTable::new(config.max_instances)),
            hw_lock: HwLock::new(platform.power),
            waiters: WaitQueue::new(),
            suspended: AtomicBool::new(false),
            opening: AtomicUsize::new(0),
            stall_ticks: AtomicU32::new(0),
            counters: Counters::default(),
        })
    }

    /// Configuration in force
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    // =========================================================================
    // Firmware
    // =========================================================================

    /// Power up, copy the firmware image and boot it
    fn load_firmware(&self) -> Result<Firmware> {
        self.power.power_on()?;

        let image = match self.pool.allocate(
            ResourceKind::Firmware,
            self.firmware.len(),
            AllocFlags::CPU_ACCESS,
        ) {
            Ok(image) => image,
            Err(err) => {
                self.power.power_off();
                return Err(err);
            },
        };
        let context = match self.pool.allocate(
            ResourceKind::DeviceContext,
            DEVICE_CONTEXT_SIZE,
            AllocFlags::ZEROED,
        ) {
            Ok(context) => context,
            Err(err) => {
                let _ = self.pool.release(image);
                self.power.power_off();
                return Err(err);
            },
        };
        let firmware = Firmware { image, context };

        let booted = self
            .pool
            .mapped_view(image, |bytes| bytes[..self.firmware.len()].copy_from_slice(&self.firmware))
            .and_then(|()| self.boot(&firmware));
        if let Err(err) = booted {
            log::error!("mfc: firmware boot failed: {}", err);
            self.release_firmware(firmware);
            return Err(err);
        }

        log::info!("mfc: firmware loaded");
        Ok(firmware)
    }

    /// Reset the core and boot the resident image
    pub(crate) fn boot(&self, firmware: &Firmware) -> Result<()> {
        let image = self.pool.physical_address(firmware.image)?;
        let context = self.pool.physical_address(firmware.context)?;

        self.hw_lock.acquire_timeout(self.config.ack_timeout())?;
        let result = self
            .hw
            .reset()
            .and_then(|()| self.hw.load_firmware(&self.firmware, image))
            .and_then(|()| self.hw.init_device(context));
        self.hw_lock.release();

        if result.is_ok() {
            Counters::bump(&self.counters.firmware_loads);
        }
        result
    }

    fn release_firmware(&self, firmware: Firmware) {
        let _ = self.pool.release(firmware.context);
        let _ = self.pool.release(firmware.image);
        self.power.power_off();
    }

    /// Unload the firmware once the last instance is gone
    pub(crate) fn unload_if_idle(&self, lifecycle: &mut Lifecycle) {
        if self.table.lock().num_open() > 0 {
            return;
        }
        if let Some(firmware) = lifecycle.firmware.take() {
            log::info!("mfc: last instance gone, firmware unloaded");
            self.release_firmware(firmware);
        }
    }

    // =========================================================================
    // Open / close
    // =========================================================================

    /// Open an instance and wait for the core to acknowledge it
    pub fn open(&self, params: OpenParams) -> Result<InstanceHandle> {
        let instance = Instance::new(params)?;
        let handle = self.insert(instance)?;

        log::info!(
            "mfc: open {} {:?} slot {}{}",
            params.codec.name(),
            params.role,
            handle.slot(),
            if params.secure { " (secure)" } else { "" }
        );
        self.kick(handle.slot());

        let acked = self.wait_for(handle, |inst| inst.state() != State::Init);
        self.opening.fetch_sub(1, Ordering::AcqRel);
        if !acked {
            self.timed_out(handle, "open");
            self.remove(handle);
            return Err(Error::HardwareFault);
        }

        let outcome = self.with_instance(handle, |inst| (inst.state(), inst.last_error()))?;
        match outcome {
            (State::Error, err) => {
                self.remove(handle);
                Err(err.unwrap_or(Error::ProtocolError))
            },
            _ => {
                Counters::bump(&self.counters.opens);
                Ok(handle)
            },
        }
    }

    /// Admission checks, firmware and context, then a table slot
    fn insert(&self, instance: Instance) -> Result<InstanceHandle> {
        let mut lifecycle = self.lifecycle.lock();
        if self.suspended.load(Ordering::Acquire) {
            return Err(Error::Suspended);
        }

        {
            let table = self.table.lock();
            let secure = table.num_secure();
            let normal = table.num_open() - secure;
            if (instance.is_secure() && normal > 0) || (!instance.is_secure() && secure > 0) {
                log::warn!("mfc: secure and non-secure instances cannot share the core");
                return Err(Error::ConcurrencyViolation);
            }
            if table.is_full() {
                return Err(Error::TooManyInstances);
            }
        }

        if lifecycle.firmware.is_none() {
            lifecycle.firmware = Some(self.load_firmware()?);
        }

        let flags = if instance.is_secure() {
            AllocFlags::SECURE
        } else {
            AllocFlags::ZEROED
        };
        let size = context_size(instance.codec(), instance.role());
        let context = match self.pool.allocate(ResourceKind::InstanceContext, size, flags) {
            Ok(context) => context,
            Err(err) => {
                self.unload_if_idle(&mut lifecycle);
                return Err(err);
            },
        };
        let context_addr = self.pool.physical_address(context)?;

        let inserted = self.table.lock().insert(Entry {
            instance,
            context,
            context_addr,
            scratch: None,
        });
        match inserted {
            Ok(handle) => {
                self.opening.fetch_add(1, Ordering::AcqRel);
                Ok(handle)
            },
            Err(err) => {
                let _ = self.pool.release(context);
                self.unload_if_idle(&mut lifecycle);
                Err(err)
            },
        }
    }

    /// Destroy an instance, returning every buffer it still held
    ///
    /// A close that races a watchdog recovery fails with `HardwareFault`;
    /// the instance then stays in `Error` so its buffers can still be
    /// polled, and a second close frees it at once.
    pub fn close(&self, handle: InstanceHandle) -> Result<Vec<Completion>> {
        let step = {
            let mut table = self.table.lock();
            table.get_mut(handle)?.instance.begin_close()
        };
        if step == CloseStep::Released {
            return Ok(self.remove(handle));
        }

        self.kick(handle.slot());
        let acked = self.wait_for(handle, |inst| matches!(inst.state(), State::Free | State::Error));
        if !acked {
            self.timed_out(handle, "close");
            return Err(Error::HardwareFault);
        }

        let last_error = self.with_instance(handle, Instance::last_error)?;
        let state = self.with_instance(handle, Instance::state)?;
        if let (State::Error, Some(err)) = (state, last_error) {
            if err.is_device_wide() {
                return Err(err);
            }
        }
        Ok(self.remove(handle))
    }

    /// Drop an instance from the table and free its memory
    pub(crate) fn remove(&self, handle: InstanceHandle) -> Vec<Completion> {
        let mut lifecycle = self.lifecycle.lock();
        let Some(mut entry) = self.table.lock().remove(handle) else {
            return Vec::new();
        };

        let _ = self.pool.release(entry.context);
        if let Some(scratch) = entry.scratch.take() {
            let _ = self.pool.release(scratch.handle);
        }
        Counters::bump(&self.counters.closes);
        log::info!("mfc: slot {} closed", handle.slot());

        self.unload_if_idle(&mut lifecycle);
        entry.instance.poll()
    }

    fn timed_out(&self, handle: InstanceHandle, what: &str) {
        Counters::bump(&self.counters.timeouts);
        log::warn!("mfc: {} of slot {} not acknowledged, recovering", what, handle.slot());
        self.recover();
    }

    fn wait_for(&self, handle: InstanceHandle, done: impl Fn(&Instance) -> bool) -> bool {
        self.waiters.wait(handle.slot(), self.config.ack_timeout(), || {
            self.table
                .lock()
                .get(handle)
                .map_or(true, |entry| done(&entry.instance))
        })
    }

    fn with_instance<R>(&self, handle: InstanceHandle, f: impl FnOnce(&Instance) -> R) -> Result<R> {
        let table = self.table.lock();
        Ok(f(&table.get(handle)?.instance))
    }

    fn with_instance_mut<R>(
        &self,
        handle: InstanceHandle,
        f: impl FnOnce(&mut Instance) -> Result<R>,
    ) -> Result<R> {
        let mut table = self.table.lock();
        f(&mut table.get_mut(handle)?.instance)
    }

    // =========================================================================
    // Streaming
    // =========================================================================

    /// Queue a source buffer (bitstream for decoders, picture for encoders)
    pub fn enqueue_source(&self, handle: InstanceHandle, buffer: Buffer) -> Result<()> {
        let depth = self.config.max_source_queue;
        self.with_instance_mut(handle, |inst| inst.enqueue_source(buffer, depth))?;
        self.kick(handle.slot());
        Ok(())
    }

    /// Queue a destination buffer
    pub fn enqueue_dest(&self, handle: InstanceHandle, buffer: Buffer) -> Result<()> {
        self.with_instance_mut(handle, |inst| inst.enqueue_dest(buffer))?;
        self.kick(handle.slot());
        Ok(())
    }

    /// Buffers returned since the last poll
    pub fn poll_completions(&self, handle: InstanceHandle) -> Result<Vec<Completion>> {
        self.with_instance_mut(handle, |inst| Ok(inst.poll()))
    }

    /// Drop queued sources and the DPB (seek); the decoder waits for a new DPB
    pub fn flush(&self, handle: InstanceHandle) -> Result<()> {
        self.with_instance_mut(handle, Instance::request_flush)?;
        self.kick(handle.slot());
        Ok(())
    }

    /// Ask the scheduler to look at this instance
    pub fn mark_pending(&self, handle: InstanceHandle) -> Result<()> {
        self.with_instance(handle, |_| ())?;
        self.kick(handle.slot());
        Ok(())
    }

    /// Current state
    pub fn state(&self, handle: InstanceHandle) -> Result<State> {
        self.with_instance(handle, Instance::state)
    }

    /// Negotiated picture size
    pub fn geometry(&self, handle: InstanceHandle) -> Result<Geometry> {
        self.with_instance(handle, Instance::geometry)
    }

    /// Per-instance counters
    pub fn instance_stats(&self, handle: InstanceHandle) -> Result<InstanceStats> {
        self.with_instance(handle, Instance::stats)
    }

    /// Device counters
    pub fn stats(&self) -> DeviceStats {
        let table = self.table.lock();
        self.counters.snapshot(table.num_open(), table.num_secure())
    }

    /// Resource pool counters
    pub fn pool(&self) -> PoolStats {
        self.pool.stats()
    }

    // =========================================================================
    // Power management
    // =========================================================================

    /// Stop dispatching, let the running job finish and put the core to sleep
    ///
    /// The flag goes up under the lifecycle lock, so an open either is
    /// refused with `Suspended` or was admitted first. Admitted opens still
    /// get their job before the core sleeps.
    pub fn suspend(&self) -> Result<()> {
        {
            let _lifecycle = self.lifecycle.lock();
            if self.suspended.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
        }

        let deadline = Instant::now() + self.config.ack_timeout();
        let result = loop {
            let lifecycle = self.lifecycle.lock();
            let left = deadline.saturating_duration_since(Instant::now());
            if let Err(err) = self.hw_lock.acquire_timeout(left) {
                drop(lifecycle);
                log::warn!("mfc: suspend: core still busy");
                self.suspended.store(false, Ordering::Release);
                self.run_one();
                return Err(err);
            }

            if self.opening.load(Ordering::Acquire) == 0 {
                let result = if lifecycle.firmware.is_some() { self.hw.sleep() } else { Ok(()) };
                self.hw_lock.release();
                break result;
            }
            self.hw_lock.release();
            drop(lifecycle);
            self.run_one();
            thread::yield_now();
        };

        match result {
            Ok(()) => {
                log::info!("mfc: suspended");
                Ok(())
            },
            Err(err) => {
                self.suspended.store(false, Ordering::Release);
                self.run_one();
                Err(err)
            },
        }
    }

    /// Wake the core and resume dispatching
    pub fn resume(&self) -> Result<()> {
        if !self.suspended.load(Ordering::Acquire) {
            return Ok(());
        }

        let loaded = self.lifecycle.lock().firmware.is_some();
        if loaded {
            self.hw_lock.acquire_timeout(self.config.ack_timeout())?;
            let result = self.hw.wakeup();
            self.hw_lock.release();
            result?;
        }

        self.suspended.store(false, Ordering::Release);
        log::info!("mfc: resumed");
        self.run_one();
        Ok(())
    }

    /// Tear everything down; returns every buffer still held
    pub fn shutdown(&self) -> Vec<Completion> {
        self.suspended.store(true, Ordering::Release);

        let mut lifecycle = self.lifecycle.lock();
        let entries: Vec<Entry> = {
            let mut table = self.table.lock();
            self.hw_lock.clear_owner();
            self.hw_lock.force_release();
            table.clear_scheduling();
            let handles = table.handles();
            handles.into_iter().filter_map(|h| table.remove(h)).collect()
        };

        let mut completions = Vec::new();
        for mut entry in entries {
            entry.instance.on_device_fault();
            completions.extend(entry.instance.poll());
            let _ = self.pool.release(entry.context);
            if let Some(scratch) = entry.scratch {
                let _ = self.pool.release(scratch.handle);
            }
            Counters::bump(&self.counters.closes);
        }

        if let Some(firmware) = lifecycle.firmware.take() {
            if self.hw_lock.acquire_timeout(self.config.ack_timeout()).is_ok() {
                let _ = self.hw.reset();
                self.hw_lock.release();
            }
            self.release_firmware(firmware);
        }
        drop(lifecycle);

        self.waiters.wake_all();
        self.suspended.store(false, Ordering::Release);
        log::info!("mfc: shut down, {} buffers returned", completions.len());
        completions
    }
}
