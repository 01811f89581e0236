//! # Memory Allocator Contract
//!
//! Physically contiguous (or IOMMU-mapped single-region) buffers with a
//! stable device address for their whole lifetime.

use bitflags::bitflags;

use crate::error::Result;
use crate::types::PhysAddr;

bitflags! {
    /// Allocation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocFlags: u32 {
        /// Allocate from the protected region (no CPU view)
        const SECURE = 1 << 0;
        /// Buffer needs a CPU-visible mapping
        const CPU_ACCESS = 1 << 1;
        /// Contents are zeroed before first use
        const ZEROED = 1 << 2;
    }
}

/// One live allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Allocator-private identity
    pub token: u64,
    /// Device address, stable until freed
    pub addr: PhysAddr,
    /// Size in bytes (may be rounded up from the request)
    pub size: usize,
    /// Flags the allocation was made with
    pub flags: AllocFlags,
}

/// Physical memory allocator
pub trait MemoryAllocator: Send + Sync {
    /// Allocate `size` bytes
    fn allocate(&self, size: usize, flags: AllocFlags) -> Result<Allocation>;

    /// Return an allocation
    fn free(&self, alloc: &Allocation);

    /// Run `f` over the CPU view of an allocation
    ///
    /// Fails with `AccessDenied` for allocations without a CPU view.
    fn with_cpu_view(&self, alloc: &Allocation, f: &mut dyn FnMut(&mut [u8])) -> Result<()>;
}
