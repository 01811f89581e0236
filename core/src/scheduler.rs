//! # Scheduler
//!
//! Puts the next ready instance on the core.
//!
//! ```text
//!   kick(slot) ──▶ pending |= 1 << slot ──▶ run_one()
//!                                             │
//!                         try-acquire hw lock ┤── held: return (the job's
//!                                             │   interrupt runs us again)
//!                         pick_next ──────────┤── none: release, recheck
//!                                             │
//!                         begin + command ────┴── error: fail instance,
//!                                                 release, next
//! ```
//!
//! The hardware lock stays held after a successful dispatch; the interrupt
//! handler releases it.

use std::sync::atomic::Ordering;

use mfc_hal::{AllocFlags, Error, Result};
use mfc_instance::sizes::scratch_size;
use mfc_instance::Action;
use mfc_memory::ResourceKind;

use crate::device::Device;
use crate::stats::Counters;
use crate::table::{Entry, InstanceTable, Scratch};

impl Device {
    /// Mark `slot` pending and run the scheduler
    pub(crate) fn kick(&self, slot: usize) {
        self.table.lock().mark_pending(slot);
        self.run_one();
    }

    /// Start the next ready job if the core is free
    pub fn run_one(&self) {
        loop {
            // Opens admitted before a suspend still run
            if self.suspended.load(Ordering::Acquire) && self.opening.load(Ordering::Acquire) == 0 {
                return;
            }
            if !self.hw_lock.try_acquire() {
                return;
            }

            let mut table = self.table.lock();
            let Some(slot) = table.pick_next() else {
                drop(table);
                self.hw_lock.release();
                // Work marked while we held the lock had nobody to run it
                if self.table.lock().pending_mask() != 0 {
                    continue;
                }
                return;
            };

            match self.dispatch(&mut table, slot) {
                Ok(()) => return,
                Err(err) => {
                    Counters::bump(&self.counters.sync_failures);
                    if let Some(entry) = table.slot_mut(slot) {
                        log::warn!(
                            "sched: slot {} command failed in {}: {}",
                            slot,
                            entry.instance.state(),
                            err
                        );
                        entry.instance.fail(err);
                    }
                    table.clear_pending(slot);
                    self.hw_lock.clear_owner();
                    drop(table);
                    self.hw_lock.release();
                    self.waiters.wake(slot);
                },
            }
        }
    }

    /// Hand the instance's next action to the core
    fn dispatch(&self, table: &mut InstanceTable, slot: usize) -> Result<()> {
        let entry = table.slot_mut(slot).ok_or(Error::InvalidHandle)?;
        let action = entry.instance.next_action().ok_or(Error::InvalidState)?;

        self.hw_lock.set_owner(slot);
        if let Action::InitBuffers { .. } = action {
            self.bind_scratch(entry)?;
        }
        entry.instance.begin(&action);
        Counters::bump(&self.counters.jobs);
        log::debug!("sched: slot {} {:?}", slot, action.kind());

        self.execute(entry, &action)
    }

    /// Issue the command for `action`
    pub(crate) fn execute(&self, entry: &mut Entry, action: &Action) -> Result<()> {
        let instance = &mut entry.instance;
        if let Action::Open = action {
            let id = self
                .hw
                .open_instance(instance.codec(), instance.params(), entry.context_addr)?;
            instance.set_hw_id(id);
            return Ok(());
        }

        let id = instance.hw_id().ok_or(Error::InvalidState)?;
        match action {
            Action::Open => Ok(()),
            Action::ParseHeader { src, len } => self.hw.parse_header(id, *src, *len),
            Action::EncodeHeader { dst, len } => self.hw.encode_header(id, *dst, *len),
            Action::InitBuffers { dpb } => {
                let scratch = entry.scratch.ok_or(Error::AllocationFailure)?;
                self.hw.init_buffers(id, dpb, scratch.addr, scratch.len)
            },
            Action::Decode { src, len, dst } => self.hw.submit_decode(id, *src, *len, dst),
            Action::Encode { src, dst, len } => self.hw.submit_encode(id, &[*src], *dst, *len),
            Action::FlushDpb => self.hw.flush_dpb(id),
            Action::Abort => self.hw.abort(id),
            Action::Close => self.hw.close_instance(id),
        }
    }

    /// Replace the instance's scratch with one sized for the current stream
    fn bind_scratch(&self, entry: &mut Entry) -> Result<()> {
        if let Some(old) = entry.scratch.take() {
            let _ = self.pool.release(old.handle);
        }

        let instance = &entry.instance;
        let len = scratch_size(instance.codec(), instance.role(), instance.geometry());
        let flags = if instance.is_secure() {
            AllocFlags::SECURE
        } else {
            AllocFlags::empty()
        };
        let handle = self.pool.allocate(ResourceKind::CodecScratch, len, flags)?;
        let addr = self.pool.physical_address(handle)?;
        entry.scratch = Some(Scratch { handle, addr, len });
        Ok(())
    }
}
