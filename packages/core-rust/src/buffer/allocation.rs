use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use super::allocator::AllocatorShared;
use super::BufferError;
use crate::wire::RemoteBuffer;

/// Release action attached to user-supplied memory. Receives the memory back
/// when the owning allocation reaches zero references.
pub type ReleaseAction = Box<dyn FnOnce(Vec<u8>) + Send>;

pub(super) enum Storage {
    /// Allocator-owned bytes: meta region followed by data region.
    Owned(Vec<u8>),
    /// Memory supplied by the caller, data region only.
    User {
        memory: Vec<u8>,
        release: ReleaseAction,
    },
    Released,
}

/// One refcounted allocation.
///
/// Most code goes through [`DataObject`](super::DataObject). The raw
/// `incr_ref`/`decr_ref` pair is exposed for code that has to hand a
/// reference across a boundary the handle cannot follow.
pub struct Allocation {
    ref_count: AtomicU32,
    meta_len: u16,
    data_len: u32,
    storage: Mutex<Storage>,
    pinned: OnceLock<RemoteBuffer>,
    allocator: Arc<AllocatorShared>,
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("ref_count", &self.ref_count.load(Ordering::Relaxed))
            .field("meta_len", &self.meta_len)
            .field("data_len", &self.data_len)
            .field("pinned", &self.pinned.get())
            .finish_non_exhaustive()
    }
}

impl Allocation {
    /// Creates an allocation holding one reference.
    pub(super) fn new(
        allocator: Arc<AllocatorShared>,
        meta_len: u16,
        data_len: u32,
        storage: Storage,
    ) -> Self {
        Self {
            ref_count: AtomicU32::new(1),
            meta_len,
            data_len,
            storage: Mutex::new(storage),
            pinned: OnceLock::new(),
            allocator,
        }
    }

    /// Current number of references.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Length of the meta region.
    #[must_use]
    pub fn meta_len(&self) -> u16 {
        self.meta_len
    }

    /// Length of the data region.
    #[must_use]
    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    /// Returns `true` once the last reference has been dropped.
    #[must_use]
    pub fn is_released(&self) -> bool {
        matches!(*self.storage.lock(), Storage::Released)
    }

    /// Takes an additional reference.
    ///
    /// # Panics
    ///
    /// Panics if the allocation has already been released. A live reference
    /// is required to take another one.
    pub fn incr_ref(&self) {
        assert!(
            self.try_incr_ref(),
            "incremented the refcount of a released allocation"
        );
    }

    /// Takes an additional reference unless the count already reached zero.
    pub fn try_incr_ref(&self) -> bool {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n == 0 {
                    None
                } else {
                    Some(n + 1)
                }
            })
            .is_ok()
    }

    /// Drops one reference and returns how many remain. The decrement that
    /// reaches zero releases the allocation.
    ///
    /// # Panics
    ///
    /// Panics if the count is already zero.
    pub fn decr_ref(&self) -> u32 {
        let Ok(prev) = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        else {
            panic!("allocation refcount decremented below zero");
        };
        if prev == 1 {
            self.release();
        }
        prev - 1
    }

    fn release(&self) {
        let storage = std::mem::replace(&mut *self.storage.lock(), Storage::Released);
        if let Some(remote) = self.pinned.get() {
            self.allocator.memory.unregister(remote.key);
        }
        match storage {
            Storage::Owned(bytes) => self.allocator.free(bytes.len()),
            Storage::User { memory, release } => {
                self.allocator.forget_user_segment();
                release(memory);
            }
            Storage::Released => {
                unreachable!("allocation released twice");
            }
        }
        tracing::trace!(
            meta_len = self.meta_len,
            data_len = self.data_len,
            "allocation released"
        );
    }

    pub(super) fn pinned(&self) -> Option<RemoteBuffer> {
        self.pinned.get().copied()
    }

    pub(super) fn pin(self: &Arc<Self>) -> RemoteBuffer {
        *self.pinned.get_or_init(|| {
            let memory = &self.allocator.memory;
            RemoteBuffer {
                node: memory.node(),
                key: memory.register(Arc::downgrade(self)),
                offset: u32::try_from(self.data_offset()).unwrap_or(u32::MAX),
                len: self.data_len,
            }
        })
    }

    /// Offset of the data region within the allocation.
    pub(super) fn data_offset(&self) -> usize {
        match *self.storage.lock() {
            Storage::User { .. } => 0,
            _ => usize::from(self.meta_len),
        }
    }

    /// Runs `f` over the whole backing memory.
    pub(super) fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, BufferError> {
        match &*self.storage.lock() {
            Storage::Owned(bytes) | Storage::User { memory: bytes, .. } => Ok(f(bytes)),
            Storage::Released => Err(BufferError::Released),
        }
    }

    /// Runs `f` over the whole backing memory, mutably.
    pub(super) fn with_bytes_mut<R>(
        &self,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, BufferError> {
        match &mut *self.storage.lock() {
            Storage::Owned(bytes) | Storage::User { memory: bytes, .. } => Ok(f(bytes)),
            Storage::Released => Err(BufferError::Released),
        }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        let remaining = *self.ref_count.get_mut();
        if remaining > 0 {
            tracing::warn!(
                remaining,
                "allocation dropped while references were still counted"
            );
        }
    }
}
