//! # Completion Handling
//!
//! Runs once per codec interrupt. The job that raised it belongs to the
//! hardware-lock owner; its instance consumes the completion, then the lock
//! is released and the scheduler runs again. The one exception is a packed
//! source with data left over: the remainder is submitted inside the same
//! job and the lock is kept.

use std::sync::atomic::Ordering;

use mfc_hal::ReasonCode;
use mfc_instance::{transition, Instance, Step, Transition};

use crate::device::Device;
use crate::stats::Counters;

impl Device {
    /// Service one interrupt from the codec core
    pub fn handle_interrupt(&self) {
        self.stall_ticks.store(0, Ordering::Release);
        Counters::bump(&self.counters.interrupts);

        let mut table = self.table.lock();
        let Some(slot) = self.hw_lock.owner() else {
            Counters::bump(&self.counters.spurious);
            log::warn!("irq: spurious interrupt, core idle");
            return;
        };
        let Some(entry) = table.slot_mut(slot) else {
            Counters::bump(&self.counters.spurious);
            log::warn!("irq: interrupt for empty slot {}", slot);
            self.hw_lock.clear_owner();
            drop(table);
            self.hw_lock.release();
            self.run_one();
            return;
        };

        let mut step = self.complete(&mut entry.instance);

        if let Step::Continue(action) = &step {
            match self.execute(entry, action) {
                Ok(()) => {
                    Counters::bump(&self.counters.resubmits);
                    log::trace!("irq: slot {} continues packed source", slot);
                    return;
                },
                Err(err) => {
                    entry.instance.fail(err);
                    step = Step::Finished;
                },
            }
        }

        if entry.instance.is_ready() {
            table.mark_pending(slot);
        } else {
            table.clear_pending(slot);
        }
        if step == Step::Preempt {
            table.set_priority(slot);
        }
        self.hw_lock.clear_owner();
        drop(table);

        self.hw_lock.release();
        self.waiters.wake(slot);
        self.run_one();
    }

    /// Feed the latched completion to the instance
    fn complete(&self, instance: &mut Instance) -> Step {
        let irq = self.hw.read_completion_reason();
        let Some(reason) = irq.reason_code() else {
            Counters::bump(&self.counters.protocol_errors);
            log::warn!("irq: unknown reason {} for {:?}", irq.reason, instance.hw_id());
            instance.on_unexpected();
            return Step::Finished;
        };

        // Warnings still produce a usable picture
        let concealed = irq.error.is_warning();
        let reason = match reason {
            ReasonCode::Error if concealed => ReasonCode::FrameDone,
            _ if !irq.error.is_none() && !concealed => ReasonCode::Error,
            reason => reason,
        };

        let kind = transition(instance.state(), instance.role(), reason);
        log::trace!("irq: {:?} in {} -> {:?}", reason, instance.state(), kind);

        match kind {
            Transition::InstanceOpened => instance.on_open_done(),
            Transition::HeaderParsed => {
                let info = self.hw.read_geometry();
                let consumed = self.hw.read_consumed_bytes();
                instance.on_header_parsed(info, consumed);
            },
            Transition::HeaderEncoded => instance.on_header_encoded(self.hw.read_encoded_size()),
            Transition::BuffersReady => instance.on_buffers_ready(),
            Transition::Decoded => {
                let status = self.hw.read_frame_status();
                let consumed = self.hw.read_consumed_bytes();
                let mask = self.hw.read_reference_used_mask();
                return instance.on_frame_decoded(status, consumed, mask, concealed);
            },
            Transition::Encoded => return instance.on_frame_encoded(self.hw.read_encoded_size()),
            Transition::SliceEncoded => return instance.on_slice_encoded(),
            Transition::Drained => instance.on_drained(),
            Transition::Flushed => instance.on_dpb_flushed(),
            Transition::Aborted => instance.on_aborted(),
            Transition::Released => instance.on_closed(),
            Transition::ResolutionChanged => {
                log::info!("irq: {:?} resolution change", instance.hw_id());
                instance.on_resolution_change();
            },
            Transition::HardwareError => {
                log::warn!(
                    "irq: {:?} error {:?} in {}",
                    instance.hw_id(),
                    irq.error,
                    instance.state()
                );
                instance.on_hw_error(irq.error);
            },
            Transition::Unexpected => {
                Counters::bump(&self.counters.protocol_errors);
                log::warn!(
                    "irq: {:?} unexpected {:?} in {}",
                    instance.hw_id(),
                    reason,
                    instance.state()
                );
                instance.on_unexpected();
            },
        }
        Step::Finished
    }
}
