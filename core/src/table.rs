//! # Instance Table
//!
//! Slot-indexed instances plus the scheduling bookkeeping that goes with
//! them: the pending mask, the one-shot priority slot and the round-robin
//! cursor. The table lives behind the device's table lock, which is never
//! held across a wait.

use mfc_hal::{Error, PhysAddr, Result};
use mfc_instance::Instance;
use mfc_memory::BufferHandle;

use crate::config::MAX_INSTANCES;

/// Client handle of an open instance
///
/// A slot is reused after close; the generation makes stale handles fail
/// with `InvalidHandle` instead of reaching the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle {
    slot: u16,
    generation: u32,
}

impl InstanceHandle {
    /// Table slot
    pub fn slot(&self) -> usize {
        self.slot as usize
    }
}

/// Codec scratch bound at buffer initialisation
#[derive(Debug, Clone, Copy)]
pub(crate) struct Scratch {
    pub(crate) handle: BufferHandle,
    pub(crate) addr: PhysAddr,
    pub(crate) len: usize,
}

#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) instance: Instance,
    pub(crate) context: BufferHandle,
    pub(crate) context_addr: PhysAddr,
    pub(crate) scratch: Option<Scratch>,
}

#[derive(Debug)]
pub(crate) struct InstanceTable {
    entries: Vec<Option<Entry>>,
    generations: Vec<u32>,
    pending: u32,
    priority: Option<usize>,
    last_run: Option<usize>,
    num_secure: usize,
}

impl InstanceTable {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_INSTANCES);
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            generations: vec![0; capacity],
            pending: 0,
            priority: None,
            last_run: None,
            num_secure: 0,
        }
    }

    pub(crate) fn num_open(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub(crate) fn num_secure(&self) -> usize {
        self.num_secure
    }

    pub(crate) fn is_full(&self) -> bool {
        self.entries.iter().all(Option::is_some)
    }

    pub(crate) fn insert(&mut self, entry: Entry) -> Result<InstanceHandle> {
        let slot = self
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or(Error::TooManyInstances)?;
        if entry.instance.is_secure() {
            self.num_secure += 1;
        }
        self.entries[slot] = Some(entry);
        Ok(InstanceHandle {
            slot: slot as u16,
            generation: self.generations[slot],
        })
    }

    pub(crate) fn remove(&mut self, handle: InstanceHandle) -> Option<Entry> {
        self.get(handle).ok()?;
        let slot = handle.slot();
        let entry = self.entries[slot].take()?;
        if entry.instance.is_secure() {
            self.num_secure -= 1;
        }
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        self.clear_pending(slot);
        if self.priority == Some(slot) {
            self.priority = None;
        }
        Some(entry)
    }

    pub(crate) fn get(&self, handle: InstanceHandle) -> Result<&Entry> {
        let slot = handle.slot();
        match self.entries.get(slot) {
            Some(Some(entry)) if self.generations[slot] == handle.generation => Ok(entry),
            _ => Err(Error::InvalidHandle),
        }
    }

    pub(crate) fn get_mut(&mut self, handle: InstanceHandle) -> Result<&mut Entry> {
        let slot = handle.slot();
        match self.entries.get_mut(slot) {
            Some(Some(entry)) if self.generations[slot] == handle.generation => Ok(entry),
            _ => Err(Error::InvalidHandle),
        }
    }

    /// Entry by slot, for the scheduler and interrupt paths
    pub(crate) fn slot_mut(&mut self, slot: usize) -> Option<&mut Entry> {
        self.entries.get_mut(slot).and_then(Option::as_mut)
    }

    pub(crate) fn handles(&self) -> Vec<InstanceHandle> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_some())
            .map(|(slot, _)| InstanceHandle {
                slot: slot as u16,
                generation: self.generations[slot],
            })
            .collect()
    }

    pub(crate) fn entries_mut(&mut self) -> impl Iterator<Item = &mut Entry> {
        self.entries.iter_mut().flatten()
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    pub(crate) fn mark_pending(&mut self, slot: usize) {
        self.pending |= 1 << slot;
    }

    pub(crate) fn clear_pending(&mut self, slot: usize) {
        self.pending &= !(1 << slot);
    }

    pub(crate) fn pending_mask(&self) -> u32 {
        self.pending
    }

    /// Run `slot` first on the next pass (encoder slice preemption)
    pub(crate) fn set_priority(&mut self, slot: usize) {
        self.priority = Some(slot);
    }

    /// Forget all scheduling state (recovery)
    pub(crate) fn clear_scheduling(&mut self) {
        self.pending = 0;
        self.priority = None;
    }

    fn is_ready(&self, slot: usize) -> bool {
        self.entries[slot]
            .as_ref()
            .is_some_and(|e| e.instance.is_ready())
    }

    /// Pick the next instance to run
    ///
    /// The priority slot goes first. Otherwise pending slots are scanned
    /// round-robin starting after the last one run; pending slots that are
    /// not ready are skipped and their bit cleared.
    pub(crate) fn pick_next(&mut self) -> Option<usize> {
        if let Some(slot) = self.priority.take() {
            if self.is_ready(slot) {
                self.last_run = Some(slot);
                return Some(slot);
            }
        }

        let n = self.entries.len();
        let start = self.last_run.map_or(0, |last| last + 1);
        for i in 0..n {
            let slot = (start + i) % n;
            if self.pending & (1 << slot) == 0 {
                continue;
            }
            if self.is_ready(slot) {
                self.last_run = Some(slot);
                return Some(slot);
            }
            self.clear_pending(slot);
        }
        None
    }
}
