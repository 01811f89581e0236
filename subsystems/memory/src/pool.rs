//! # Resource Pool
//!
//! Handle-based ownership of device buffers.
//!
//! Every buffer is released deterministically by its owner; there is no
//! reference counting and no deferred reclamation.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;

use mfc_hal::{AllocFlags, Allocation, Error, MemoryAllocator, PhysAddr, Result};
use spin::Mutex;

// =============================================================================
// RESOURCE KINDS
// =============================================================================

/// What a pool buffer is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// Firmware image
    Firmware,
    /// Global device context (one per loaded firmware)
    DeviceContext,
    /// Per-instance firmware context
    InstanceContext,
    /// Per-instance codec scratch / internal reference memory
    CodecScratch,
}

/// Opaque pool handle
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferHandle(u32);

impl BufferHandle {
    /// Raw handle value
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferHandle({})", self.0)
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Successful allocations
    pub allocs: u64,
    /// Releases
    pub frees: u64,
    /// Allocation failures
    pub failures: u64,
    /// Bytes currently allocated
    pub bytes_in_use: usize,
    /// High water mark of `bytes_in_use`
    pub peak_bytes: usize,
}

#[derive(Debug)]
struct Entry {
    kind: ResourceKind,
    alloc: Allocation,
}

#[derive(Debug, Default)]
struct PoolInner {
    entries: BTreeMap<BufferHandle, Entry>,
    next: u32,
    stats: PoolStats,
}

// =============================================================================
// RESOURCE POOL
// =============================================================================

/// Device buffer pool
pub struct ResourcePool {
    allocator: Arc<dyn MemoryAllocator>,
    inner: Mutex<PoolInner>,
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ResourcePool {
    /// Create a pool over a platform allocator
    pub fn new(allocator: Arc<dyn MemoryAllocator>) -> Self {
        Self {
            allocator,
            inner: Mutex::new(PoolInner {
                next: 1,
                ..PoolInner::default()
            }),
        }
    }

    /// Allocate a buffer
    ///
    /// Any allocator failure is reported as `AllocationFailure`; the pool is
    /// unchanged and the caller can back out cleanly.
    pub fn allocate(
        &self,
        kind: ResourceKind,
        size: usize,
        flags: AllocFlags,
    ) -> Result<BufferHandle> {
        if size == 0 {
            return Err(Error::InvalidParameter);
        }

        let alloc = match self.allocator.allocate(size, flags) {
            Ok(alloc) => alloc,
            Err(err) => {
                self.inner.lock().stats.failures += 1;
                log::warn!("pool: {:?} allocation of {} bytes failed: {}", kind, size, err);
                return Err(Error::AllocationFailure);
            },
        };

        let mut inner = self.inner.lock();
        let handle = BufferHandle(inner.next);
        inner.next = inner.next.wrapping_add(1).max(1);

        inner.stats.allocs += 1;
        inner.stats.bytes_in_use += alloc.size;
        inner.stats.peak_bytes = inner.stats.peak_bytes.max(inner.stats.bytes_in_use);
        inner.entries.insert(handle, Entry { kind, alloc });

        log::trace!("pool: {:?} {:?} {} bytes at {}", handle, kind, alloc.size, alloc.addr);
        Ok(handle)
    }

    /// Release a buffer
    pub fn release(&self, handle: BufferHandle) -> Result<()> {
        let entry = {
            let mut inner = self.inner.lock();
            let entry = inner.entries.remove(&handle).ok_or(Error::InvalidHandle)?;
            inner.stats.frees += 1;
            inner.stats.bytes_in_use -= entry.alloc.size;
            entry
        };
        self.allocator.free(&entry.alloc);
        Ok(())
    }

    fn with_entry<R>(&self, handle: BufferHandle, f: impl FnOnce(&Entry) -> R) -> Result<R> {
        let inner = self.inner.lock();
        inner.entries.get(&handle).map(f).ok_or(Error::InvalidHandle)
    }

    /// Device address of a buffer
    pub fn physical_address(&self, handle: BufferHandle) -> Result<PhysAddr> {
        self.with_entry(handle, |e| e.alloc.addr)
    }

    /// Size of a buffer in bytes
    pub fn size(&self, handle: BufferHandle) -> Result<usize> {
        self.with_entry(handle, |e| e.alloc.size)
    }

    /// Kind of a buffer
    pub fn kind(&self, handle: BufferHandle) -> Result<ResourceKind> {
        self.with_entry(handle, |e| e.kind)
    }

    /// Run `f` over the CPU-visible bytes of a buffer
    ///
    /// Secure buffers have no CPU view and fail with `AccessDenied`.
    pub fn mapped_view<R>(
        &self,
        handle: BufferHandle,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let alloc = self.with_entry(handle, |e| e.alloc)?;
        if alloc.flags.contains(AllocFlags::SECURE) {
            return Err(Error::AccessDenied);
        }

        let mut f = Some(f);
        let mut out = None;
        self.allocator.with_cpu_view(&alloc, &mut |bytes: &mut [u8]| {
            if let Some(f) = f.take() {
                out = Some(f(bytes));
            }
        })?;
        out.ok_or(Error::AccessDenied)
    }

    /// Counter snapshot
    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats
    }

    /// Live buffers of a kind
    pub fn count(&self, kind: ResourceKind) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.kind == kind)
            .count()
    }

    /// Live buffers of every kind
    pub fn live(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
