use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

use super::allocation::{Allocation, Storage};
use super::{BufferError, DataObject, MemoryRegistry};
use crate::types::NodeId;

// ---------------------------------------------------------------------------
// AllocatorShared
// ---------------------------------------------------------------------------

/// State shared by an allocator and every allocation it handed out.
pub(super) struct AllocatorShared {
    pub(super) memory: MemoryRegistry,
    capacity_bytes: usize,
    in_use: AtomicUsize,
    live: AtomicUsize,
    releases: AtomicU64,
}

impl AllocatorShared {
    fn reserve(&self, len: usize) -> Result<(), BufferError> {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(len).filter(|n| *n <= self.capacity_bytes)
            })
            .map(|_| ())
            .map_err(|used| BufferError::OutOfMemory {
                requested: len,
                available: self.capacity_bytes.saturating_sub(used),
            })
    }

    pub(super) fn free(&self, len: usize) {
        self.in_use.fetch_sub(len, Ordering::AcqRel);
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// User memory is not charged against capacity; only the live count moves.
    pub(super) fn forget_user_segment(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.releases.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

/// Point-in-time allocator counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatorStats {
    pub capacity_bytes: usize,
    pub bytes_in_use: usize,
    pub live_allocations: usize,
    pub releases: u64,
}

/// Node-local buffer allocator with a fixed byte budget.
///
/// Cheap to clone; clones share the budget and the memory registry.
#[derive(Clone)]
pub struct Allocator {
    shared: Arc<AllocatorShared>,
}

impl Allocator {
    /// Creates an allocator that may hand out up to `capacity_bytes` at once.
    #[must_use]
    pub fn new(memory: MemoryRegistry, capacity_bytes: usize) -> Self {
        Self {
            shared: Arc::new(AllocatorShared {
                memory,
                capacity_bytes,
                in_use: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                releases: AtomicU64::new(0),
            }),
        }
    }

    /// Node whose memory this allocator hands out.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.shared.memory.node()
    }

    /// Registry through which pinned allocations are reachable remotely.
    #[must_use]
    pub fn memory(&self) -> &MemoryRegistry {
        &self.shared.memory
    }

    /// Allocates a zeroed buffer with a `meta_len` meta region followed by a
    /// `data_len` data region. The returned object holds the only reference.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::OutOfMemory` if the budget cannot cover the
    /// request.
    pub fn allocate(&self, meta_len: u16, data_len: u32) -> Result<DataObject, BufferError> {
        let total = usize::from(meta_len) + data_len as usize;
        self.shared.reserve(total)?;
        self.shared.live.fetch_add(1, Ordering::AcqRel);
        let alloc = Allocation::new(
            Arc::clone(&self.shared),
            meta_len,
            data_len,
            Storage::Owned(vec![0; total]),
        );
        Ok(DataObject::adopt(Arc::new(alloc)))
    }

    /// Allocates a buffer without meta region and copies `data` into it.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::TooLarge` if `data` does not fit a data region,
    /// or `BufferError::OutOfMemory` if the budget is exhausted.
    pub fn allocate_with(&self, data: &[u8]) -> Result<DataObject, BufferError> {
        let data_len =
            u32::try_from(data.len()).map_err(|_| BufferError::TooLarge { len: data.len() })?;
        let obj = self.allocate(0, data_len)?;
        obj.write_data(0, data)?;
        Ok(obj)
    }

    /// Wraps memory the caller already owns. `release` receives it back
    /// exactly once, when the last reference is dropped. Wrapped memory is
    /// not charged against the allocator's budget.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::TooLarge` if `memory` does not fit a data region.
    pub fn wrap_user_memory(
        &self,
        memory: Vec<u8>,
        release: impl FnOnce(Vec<u8>) + Send + 'static,
    ) -> Result<DataObject, BufferError> {
        let data_len =
            u32::try_from(memory.len()).map_err(|_| BufferError::TooLarge { len: memory.len() })?;
        self.shared.live.fetch_add(1, Ordering::AcqRel);
        let alloc = Allocation::new(
            Arc::clone(&self.shared),
            0,
            data_len,
            Storage::User {
                memory,
                release: Box::new(release),
            },
        );
        Ok(DataObject::adopt(Arc::new(alloc)))
    }

    /// Point-in-time budget and allocation counters.
    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            capacity_bytes: self.shared.capacity_bytes,
            bytes_in_use: self.shared.in_use.load(Ordering::Acquire),
            live_allocations: self.shared.live.load(Ordering::Acquire),
            releases: self.shared.releases.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("node", &self.node())
            .field("stats", &self.stats())
            .finish()
    }
}
