//! # Buffer Queues
//!
//! FIFO queues of client buffers owned by the driver. Sources are consumed
//! strictly in submission order; a source may be consumed in several jobs
//! when it carries more than one coded picture.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use mfc_hal::PhysAddr;

use crate::buffer::Buffer;

// =============================================================================
// SOURCE QUEUE
// =============================================================================

/// A queued source buffer
#[derive(Debug, Clone, Copy)]
pub struct SourceEntry {
    /// The client buffer
    pub buffer: Buffer,
    /// Bytes already consumed by earlier jobs
    pub offset: usize,
    /// Currently handed to the hardware
    pub submitted: bool,
}

impl SourceEntry {
    /// Address of the unconsumed data
    pub fn data_addr(&self) -> PhysAddr {
        self.buffer.addr.offset(self.offset as u64)
    }

    /// Unconsumed payload bytes
    pub fn remaining(&self) -> usize {
        self.buffer.bytes_used.saturating_sub(self.offset)
    }
}

/// Queue of source buffers
#[derive(Debug, Default)]
pub struct SourceQueue {
    entries: VecDeque<SourceEntry>,
}

impl SourceQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer
    pub fn push(&mut self, buffer: Buffer) {
        self.entries.push_back(SourceEntry {
            buffer,
            offset: 0,
            submitted: false,
        });
    }

    /// Oldest buffer
    pub fn front(&self) -> Option<&SourceEntry> {
        self.entries.front()
    }

    /// Oldest buffer, mutable
    pub fn front_mut(&mut self) -> Option<&mut SourceEntry> {
        self.entries.front_mut()
    }

    /// Remove the oldest buffer
    pub fn pop(&mut self) -> Option<SourceEntry> {
        self.entries.pop_front()
    }

    /// Is a buffer with this address queued?
    pub fn contains(&self, addr: PhysAddr) -> bool {
        self.entries.iter().any(|e| e.buffer.addr == addr)
    }

    /// Remove every buffer
    pub fn take_all(&mut self) -> Vec<Buffer> {
        self.entries.drain(..).map(|e| e.buffer).collect()
    }

    /// Queued buffers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Nothing queued?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// DESTINATION QUEUE
// =============================================================================

/// Queue of destination buffers not yet bound to the hardware
#[derive(Debug, Default)]
pub struct DestQueue {
    entries: VecDeque<Buffer>,
}

impl DestQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer
    pub fn push(&mut self, buffer: Buffer) {
        self.entries.push_back(buffer);
    }

    /// Oldest buffer
    pub fn front(&self) -> Option<&Buffer> {
        self.entries.front()
    }

    /// Remove the oldest buffer
    pub fn pop(&mut self) -> Option<Buffer> {
        self.entries.pop_front()
    }

    /// Is a buffer with this address queued?
    pub fn contains(&self, addr: PhysAddr) -> bool {
        self.entries.iter().any(|b| b.addr == addr)
    }

    /// Queued buffers in order
    pub fn iter(&self) -> impl Iterator<Item = &Buffer> {
        self.entries.iter()
    }

    /// Remove every buffer
    pub fn take_all(&mut self) -> Vec<Buffer> {
        self.entries.drain(..).collect()
    }

    /// Queued buffers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Nothing queued?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
