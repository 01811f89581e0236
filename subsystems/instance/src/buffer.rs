//! # Client Buffers
//!
//! Descriptors for the buffers clients queue, and the completions they get
//! back. Every queued buffer comes back exactly once, either `Done` or
//! `Error`.

use bitflags::bitflags;
use mfc_hal::PhysAddr;

/// A client buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer {
    /// Client-chosen identifier, returned untouched
    pub cookie: u64,
    /// Device address
    pub addr: PhysAddr,
    /// Capacity in bytes
    pub len: usize,
    /// Payload bytes (set by the client for sources, by the driver for
    /// destinations)
    pub bytes_used: usize,
    /// Presentation timestamp, carried from source to destination
    pub timestamp: u64,
}

impl Buffer {
    /// Empty buffer of `len` bytes
    pub const fn new(cookie: u64, addr: PhysAddr, len: usize) -> Self {
        Self {
            cookie,
            addr,
            len,
            bytes_used: 0,
            timestamp: 0,
        }
    }

    /// Set the payload size
    pub const fn with_payload(mut self, bytes_used: usize) -> Self {
        self.bytes_used = bytes_used;
        self
    }

    /// Set the timestamp
    pub const fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Which queue a buffer was enqueued on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Input side (bitstream for decoders, pictures for encoders)
    Source,
    /// Output side (pictures for decoders, bitstream for encoders)
    Destination,
}

/// Terminal status of a returned buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferStatus {
    /// Processed successfully
    Done,
    /// Not processed (error, close or flush)
    Error,
}

bitflags! {
    /// Per-picture flags on a completion
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u32 {
        /// Picture is ready for display
        const DISPLAYED = 1 << 0;
        /// Decoder still uses the picture as a reference; re-queueing it
        /// parks it until the reference is dropped
        const REFERENCE = 1 << 1;
        /// Encoder stream header
        const HEADER = 1 << 2;
        /// Picture decoded with concealed errors
        const CONCEALED = 1 << 3;
    }
}

/// A buffer handed back to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// The buffer, with `bytes_used`/`timestamp` updated
    pub buffer: Buffer,
    /// Queue it was enqueued on
    pub queue: QueueKind,
    /// Terminal status
    pub status: BufferStatus,
    /// Picture flags
    pub flags: FrameFlags,
}

impl Completion {
    /// Successful completion
    pub const fn done(buffer: Buffer, queue: QueueKind, flags: FrameFlags) -> Self {
        Self {
            buffer,
            queue,
            status: BufferStatus::Done,
            flags,
        }
    }

    /// Failed completion
    pub const fn error(buffer: Buffer, queue: QueueKind) -> Self {
        Self {
            buffer,
            queue,
            status: BufferStatus::Error,
            flags: FrameFlags::empty(),
        }
    }

    /// Is this a successful completion?
    pub fn is_done(&self) -> bool {
        self.status == BufferStatus::Done
    }
}
