//! # Decoded Picture Buffer
//!
//! Tracks the destination buffers a decoder has bound to hardware DPB slots.
//!
//! The core identifies pictures by address, so the DPB keeps an
//! `address → slot` map next to the slot table. Each slot is in one of these
//! conditions:
//!
//! ```text
//!   owner   decoded  referenced   meaning
//!   ─────   ───────  ──────────   ──────────────────────────────────────
//!   Driver     no        no       free for the core to write
//!   Driver     no        yes      re-queued while still a reference (held)
//!   Driver    yes        any      written, waiting for display
//!   Client     -         any      returned to the client
//! ```
//!
//! Held slots form the reference queue: they become writable again when the
//! core clears their bit in the reference-used mask.

use alloc::vec::Vec;

use arrayvec::ArrayVec;
use hashbrown::HashMap;
use mfc_hal::{Error, PhysAddr, Result};
use static_assertions::const_assert;

use crate::buffer::Buffer;

/// DPB slots per instance (one bit each in the reference mask)
pub const MAX_DPB_SLOTS: usize = 32;

const_assert!(MAX_DPB_SLOTS <= u32::BITS as usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Driver,
    Client,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    buffer: Buffer,
    owner: Owner,
    decoded: bool,
    referenced: bool,
}

impl Slot {
    fn writable(&self) -> bool {
        self.owner == Owner::Driver && !self.decoded && !self.referenced
    }
}

/// A buffer handed back by [`Dpb::drain`]
#[derive(Debug, Clone, Copy)]
pub struct Drained {
    /// The buffer
    pub buffer: Buffer,
    /// Holds a decoded picture that was never displayed
    pub decoded: bool,
}

/// Decoded picture buffer of one decoder instance
#[derive(Debug)]
pub struct Dpb {
    slots: ArrayVec<Slot, MAX_DPB_SLOTS>,
    by_addr: HashMap<PhysAddr, usize>,
    dynamic: bool,
}

impl Dpb {
    /// Empty DPB
    ///
    /// In dynamic mode unknown addresses queued after initialisation are
    /// bound to free slots; in static mode they are rejected.
    pub fn new(dynamic: bool) -> Self {
        Self {
            slots: ArrayVec::new(),
            by_addr: HashMap::new(),
            dynamic,
        }
    }

    /// Bind the initial buffer set to slots `0..n`
    ///
    /// Buffers that cannot be bound (duplicate address, table full) are
    /// handed back.
    pub fn init(&mut self, buffers: impl IntoIterator<Item = Buffer>) -> Vec<Buffer> {
        self.reset();
        buffers
            .into_iter()
            .filter(|&buffer| self.bind_new(buffer).is_err())
            .collect()
    }

    fn bind_new(&mut self, buffer: Buffer) -> Result<usize> {
        if self.by_addr.contains_key(&buffer.addr) {
            return Err(Error::InvalidBuffer);
        }
        let index = self.slots.len();
        self.slots
            .try_push(Slot {
                buffer,
                owner: Owner::Driver,
                decoded: false,
                referenced: false,
            })
            .map_err(|_| Error::QueueFull)?;
        self.by_addr.insert(buffer.addr, index);
        Ok(index)
    }

    /// Forget every slot
    pub fn reset(&mut self) {
        self.slots.clear();
        self.by_addr.clear();
    }

    /// Has the DPB been initialised?
    pub fn is_initialized(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Bound slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// No slot bound?
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Addresses of every bound slot, in slot order
    pub fn addrs(&self) -> ArrayVec<PhysAddr, MAX_DPB_SLOTS> {
        self.slots.iter().map(|s| s.buffer.addr).collect()
    }

    /// Slot table for a decode job: writable slots by address, null otherwise
    pub fn available_table(&self) -> ArrayVec<PhysAddr, MAX_DPB_SLOTS> {
        self.slots
            .iter()
            .map(|s| if s.writable() { s.buffer.addr } else { PhysAddr::null() })
            .collect()
    }

    /// Can the core write a new picture?
    pub fn has_writable(&self) -> bool {
        self.slots.iter().any(Slot::writable)
    }

    /// Buffers re-queued while still used as reference
    pub fn held(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.owner == Owner::Driver && !s.decoded && s.referenced)
            .count()
    }

    /// Buffers currently owned by the driver
    pub fn driver_owned(&self) -> usize {
        self.slots.iter().filter(|s| s.owner == Owner::Driver).count()
    }

    /// Is the buffer at `addr` still used as reference?
    pub fn is_referenced(&self, addr: PhysAddr) -> bool {
        self.by_addr
            .get(&addr)
            .is_some_and(|&i| self.slots[i].referenced)
    }

    /// Client queues a destination buffer
    pub fn enqueue(&mut self, buffer: Buffer) -> Result<()> {
        if let Some(&index) = self.by_addr.get(&buffer.addr) {
            let slot = &mut self.slots[index];
            if slot.owner != Owner::Client {
                return Err(Error::InvalidBuffer);
            }
            slot.buffer = buffer;
            slot.owner = Owner::Driver;
            slot.decoded = false;
            if slot.referenced {
                log::trace!("dpb: {} held until reference drops", buffer.addr);
            }
            return Ok(());
        }

        if !self.dynamic {
            return Err(Error::InvalidBuffer);
        }

        // Rebind a slot the client owns and the core no longer needs
        let reusable = self
            .slots
            .iter()
            .position(|s| s.owner == Owner::Client && !s.referenced);
        match reusable {
            Some(index) => {
                let old = self.slots[index].buffer.addr;
                self.by_addr.remove(&old);
                self.slots[index] = Slot {
                    buffer,
                    owner: Owner::Driver,
                    decoded: false,
                    referenced: false,
                };
                self.by_addr.insert(buffer.addr, index);
                Ok(())
            },
            None => self.bind_new(buffer).map(|_| ()),
        }
    }

    /// The core wrote a picture at `addr`
    pub fn mark_decoded(&mut self, addr: PhysAddr, timestamp: u64) -> Result<()> {
        let index = *self.by_addr.get(&addr).ok_or(Error::ProtocolError)?;
        let slot = &mut self.slots[index];
        if !slot.writable() {
            return Err(Error::ProtocolError);
        }
        slot.decoded = true;
        slot.buffer.timestamp = timestamp;
        Ok(())
    }

    /// The picture at `addr` is ready for display; hand it to the client
    pub fn take_displayed(&mut self, addr: PhysAddr) -> Result<Buffer> {
        let index = *self.by_addr.get(&addr).ok_or(Error::ProtocolError)?;
        let slot = &mut self.slots[index];
        if slot.owner != Owner::Driver || !slot.decoded {
            return Err(Error::ProtocolError);
        }
        slot.owner = Owner::Client;
        slot.decoded = false;
        Ok(slot.buffer)
    }

    /// Apply the reference-used mask from a completion
    ///
    /// Returns how many held buffers became writable.
    pub fn update_references(&mut self, mask: u32) -> usize {
        let mut reclaimed = 0;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let referenced = mask & (1 << i) != 0;
            if slot.referenced && !referenced && slot.owner == Owner::Driver && !slot.decoded {
                reclaimed += 1;
            }
            slot.referenced = referenced;
        }
        reclaimed
    }

    /// Return every driver-owned buffer and forget all slots
    pub fn drain(&mut self) -> Vec<Drained> {
        let out = self
            .slots
            .iter()
            .filter(|s| s.owner == Owner::Driver)
            .map(|s| Drained {
                buffer: s.buffer,
                decoded: s.decoded,
            })
            .collect();
        self.reset();
        out
    }
}
