//! # MFC Memory
//!
//! Device buffers for the codec scheduler.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       ResourcePool                        │
//! │   BufferHandle → (kind, Allocation)      PoolStats        │
//! └─────────────────────────────┬─────────────────────────────┘
//!                               │ dyn MemoryAllocator
//! ┌─────────────────────────────┴─────────────────────────────┐
//! │                    CarveoutAllocator                      │
//! │  ┌──────────────────────┐      ┌───────────────────────┐  │
//! │  │    normal region     │      │   protected region    │  │
//! │  │ first-fit free list  │      │  first-fit free list  │  │
//! │  │ lazy CPU backing     │      │  no CPU view          │  │
//! │  └──────────────────────┘      └───────────────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The pool owns every buffer the scheduler hands to the codec core:
//! firmware, the global device context, per-instance contexts and codec
//! scratch. Addresses are stable for the lifetime of a handle because the
//! core reports completions by address.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod carveout;
pub mod pool;

pub use carveout::{CarveoutAllocator, CarveoutConfig, PAGE_SIZE};
pub use pool::{BufferHandle, PoolStats, ResourceKind, ResourcePool};
