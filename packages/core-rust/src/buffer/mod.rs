//! Refcounted, optionally pinned data buffers.
//!
//! An [`Allocation`] carries a logical reference count that is independent of
//! the `Arc` keeping the struct itself alive. The count is what decides when the
//! memory is handed back: the decrement that takes it to zero releases the
//! storage exactly once, runs the release action of user-supplied memory
//! exactly once, and removes the allocation from the node's
//! [`MemoryRegistry`]. [`DataObject`] is the owning handle: cloning it takes a
//! reference, dropping it gives one back.
//!
//! Buffers never cross node boundaries. A remote get or put copies bytes
//! between two node-local allocations, each with its own count.

mod allocation;
mod allocator;
mod data_object;
mod memory;

pub use allocation::{Allocation, ReleaseAction};
pub use allocator::{Allocator, AllocatorStats};
pub use data_object::DataObject;
pub use memory::MemoryRegistry;

/// Errors raised by buffer allocation and access.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("allocator exhausted: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },
    #[error("buffer of {len} bytes exceeds the addressable size")]
    TooLarge { len: usize },
    #[error("access of {len} bytes at offset {offset} exceeds buffer of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },
    #[error("buffer has already been released")]
    Released,
}
