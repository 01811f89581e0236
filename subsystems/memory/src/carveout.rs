//! # Carve-out Allocator
//!
//! Reference [`MemoryAllocator`] over two reserved physical regions: one for
//! normal buffers and one protected region for secure sessions.
//!
//! Each region is managed by an address-ordered free list with first-fit
//! allocation and coalescing on free. CPU backing for `CPU_ACCESS` buffers is
//! materialised lazily the first time a view is requested.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use mfc_hal::{AllocFlags, Allocation, Error, MemoryAllocator, PhysAddr, Result};
use spin::Mutex;

/// Allocation granularity and alignment
pub const PAGE_SIZE: usize = 4096;

/// Carve-out layout
#[derive(Debug, Clone, Copy)]
pub struct CarveoutConfig {
    /// Start of the normal region
    pub normal_base: PhysAddr,
    /// Size of the normal region
    pub normal_size: usize,
    /// Start of the protected region
    pub secure_base: PhysAddr,
    /// Size of the protected region (0 = no secure sessions)
    pub secure_size: usize,
}

impl Default for CarveoutConfig {
    fn default() -> Self {
        Self {
            normal_base: PhysAddr::new(0x4000_0000),
            normal_size: 256 << 20,
            secure_base: PhysAddr::new(0x6000_0000),
            secure_size: 64 << 20,
        }
    }
}

// =============================================================================
// REGION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    offset: usize,
    size: usize,
}

#[derive(Debug)]
struct Region {
    base: PhysAddr,
    size: usize,
    /// Sorted by offset, never adjacent (coalesced)
    free: Vec<FreeBlock>,
}

impl Region {
    fn new(base: PhysAddr, size: usize) -> Self {
        let size = size - size % PAGE_SIZE;
        let free = if size > 0 {
            vec![FreeBlock { offset: 0, size }]
        } else {
            Vec::new()
        };
        Self { base, size, free }
    }

    fn allocate(&mut self, size: usize) -> Option<usize> {
        let index = self.free.iter().position(|b| b.size >= size)?;
        let block = &mut self.free[index];
        let offset = block.offset;
        if block.size == size {
            self.free.remove(index);
        } else {
            block.offset += size;
            block.size -= size;
        }
        Some(offset)
    }

    fn free(&mut self, offset: usize, size: usize) {
        let index = self.free.partition_point(|b| b.offset < offset);
        self.free.insert(index, FreeBlock { offset, size });

        // Merge with the following block
        if index + 1 < self.free.len() {
            let next = self.free[index + 1];
            if offset + size == next.offset {
                self.free[index].size += next.size;
                self.free.remove(index + 1);
            }
        }
        // Merge with the preceding block
        if index > 0 {
            let prev = self.free[index - 1];
            if prev.offset + prev.size == offset {
                self.free[index - 1].size += self.free[index].size;
                self.free.remove(index);
            }
        }
    }

    fn available(&self) -> usize {
        self.free.iter().map(|b| b.size).sum()
    }

    fn largest_free(&self) -> usize {
        self.free.iter().map(|b| b.size).max().unwrap_or(0)
    }
}

// =============================================================================
// ALLOCATOR
// =============================================================================

#[derive(Debug)]
struct Live {
    secure: bool,
    offset: usize,
    size: usize,
    backing: Option<Vec<u8>>,
}

#[derive(Debug)]
struct Inner {
    normal: Region,
    secure: Region,
    live: BTreeMap<u64, Live>,
    next_token: u64,
}

/// First-fit allocator over a normal and a protected carve-out
#[derive(Debug)]
pub struct CarveoutAllocator {
    inner: Mutex<Inner>,
}

impl CarveoutAllocator {
    /// Create an allocator for the given regions
    pub fn new(config: CarveoutConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                normal: Region::new(config.normal_base, config.normal_size),
                secure: Region::new(config.secure_base, config.secure_size),
                live: BTreeMap::new(),
                next_token: 1,
            }),
        }
    }

    /// Free bytes in the normal region
    pub fn available(&self) -> usize {
        self.inner.lock().normal.available()
    }

    /// Free bytes in the protected region
    pub fn secure_available(&self) -> usize {
        self.inner.lock().secure.available()
    }

    /// Largest single block the normal region can still satisfy
    pub fn largest_free(&self) -> usize {
        self.inner.lock().normal.largest_free()
    }

    /// Live allocations across both regions
    pub fn live(&self) -> usize {
        self.inner.lock().live.len()
    }
}

impl Default for CarveoutAllocator {
    fn default() -> Self {
        Self::new(CarveoutConfig::default())
    }
}

impl MemoryAllocator for CarveoutAllocator {
    fn allocate(&self, size: usize, flags: AllocFlags) -> Result<Allocation> {
        if size == 0 {
            return Err(Error::InvalidParameter);
        }
        let size = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let secure = flags.contains(AllocFlags::SECURE);
        if secure && flags.contains(AllocFlags::CPU_ACCESS) {
            return Err(Error::AccessDenied);
        }

        let mut inner = self.inner.lock();
        let region = if secure { &mut inner.secure } else { &mut inner.normal };
        let offset = region.allocate(size).ok_or(Error::AllocationFailure)?;
        let addr = region.base.offset(offset as u64);
        debug_assert!(offset + size <= region.size);

        let token = inner.next_token;
        inner.next_token += 1;
        inner.live.insert(
            token,
            Live {
                secure,
                offset,
                size,
                backing: None,
            },
        );

        Ok(Allocation {
            token,
            addr,
            size,
            flags,
        })
    }

    fn free(&self, alloc: &Allocation) {
        let mut inner = self.inner.lock();
        match inner.live.remove(&alloc.token) {
            Some(live) => {
                let region = if live.secure { &mut inner.secure } else { &mut inner.normal };
                region.free(live.offset, live.size);
            },
            None => log::warn!("carveout: free of unknown allocation at {}", alloc.addr),
        }
    }

    fn with_cpu_view(&self, alloc: &Allocation, f: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        let mut inner = self.inner.lock();
        let live = inner.live.get_mut(&alloc.token).ok_or(Error::InvalidHandle)?;
        if live.secure || !alloc.flags.contains(AllocFlags::CPU_ACCESS) {
            return Err(Error::AccessDenied);
        }
        let size = live.size;
        let backing = live.backing.get_or_insert_with(|| vec![0; size]);
        f(backing.as_mut_slice());
        Ok(())
    }
}
