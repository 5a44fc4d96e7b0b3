use std::fmt;
use std::sync::Arc;

use super::allocation::Allocation;
use super::BufferError;
use crate::wire::RemoteBuffer;

/// Owning handle to one reference of an [`Allocation`].
///
/// `clone()` takes a reference and `drop()` returns it, so the number of live
/// handles plus any manual `incr_ref` calls equals the allocation's count.
pub struct DataObject {
    alloc: Arc<Allocation>,
}

impl DataObject {
    /// Wraps an allocation whose reference has already been counted for this
    /// handle.
    pub(super) fn adopt(alloc: Arc<Allocation>) -> Self {
        Self { alloc }
    }

    /// Takes a new reference on `alloc` and wraps it.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::Released` if the allocation is already gone.
    pub fn from_allocation(alloc: &Arc<Allocation>) -> Result<Self, BufferError> {
        if alloc.try_incr_ref() {
            Ok(Self::adopt(Arc::clone(alloc)))
        } else {
            Err(BufferError::Released)
        }
    }

    /// Underlying allocation. Cloning the `Arc` does not take a logical
    /// reference; use `from_allocation` for that.
    #[must_use]
    pub fn allocation(&self) -> &Arc<Allocation> {
        &self.alloc
    }

    /// Current logical reference count, including this handle.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.alloc.ref_count()
    }

    /// Length of the meta region. Always 0 for wrapped user memory.
    #[must_use]
    pub fn meta_len(&self) -> u16 {
        self.alloc.meta_len()
    }

    /// Length of the data region.
    #[must_use]
    pub fn data_len(&self) -> u32 {
        self.alloc.data_len()
    }

    /// Total addressable length: meta plus data for allocator-owned buffers,
    /// data only for wrapped user memory.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.alloc.data_offset() + self.alloc.data_len() as usize
    }

    /// Whether `pin` was called on this allocation.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.alloc.pinned().is_some()
    }

    /// Makes the data region reachable by remote get/put and returns its
    /// address. Pinning twice returns the same address.
    #[must_use]
    pub fn pin(&self) -> RemoteBuffer {
        self.alloc.pin()
    }

    /// Address of the start of the data region, for diagnostics.
    #[must_use]
    pub fn raw_address(&self) -> usize {
        let offset = self.alloc.data_offset();
        self.alloc
            .with_bytes(|bytes| bytes.as_ptr() as usize + offset)
            .unwrap_or(0)
    }

    /// Copies the data region out.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::Released` if the storage is gone.
    pub fn to_vec(&self) -> Result<Vec<u8>, BufferError> {
        let start = self.alloc.data_offset();
        self.alloc.with_bytes(|bytes| bytes[start..].to_vec())
    }

    /// Copies the meta region out.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::Released` if the storage is gone.
    pub fn meta(&self) -> Result<Vec<u8>, BufferError> {
        let end = self.alloc.data_offset();
        self.alloc.with_bytes(|bytes| bytes[..end].to_vec())
    }

    /// Runs `f` over the data region in place.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::Released` if the storage is gone.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, BufferError> {
        let start = self.alloc.data_offset();
        self.alloc.with_bytes_mut(|bytes| f(&mut bytes[start..]))
    }

    /// Writes `src` into the data region at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::OutOfBounds` if the write would run past the
    /// data region.
    pub fn write_data(&self, offset: usize, src: &[u8]) -> Result<(), BufferError> {
        self.write_region(self.alloc.data_offset() + offset, src)
    }

    /// Writes `src` into the meta region.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::OutOfBounds` if `src` is longer than the meta
    /// region.
    pub fn write_meta(&self, src: &[u8]) -> Result<(), BufferError> {
        let meta_len = self.alloc.data_offset();
        if src.len() > meta_len {
            return Err(BufferError::OutOfBounds {
                offset: 0,
                len: src.len(),
                size: meta_len,
            });
        }
        self.write_region(0, src)
    }

    /// Reads `len` bytes at an allocation-relative `offset`, as addressed by
    /// a [`RemoteBuffer`].
    ///
    /// # Errors
    ///
    /// Returns `BufferError::OutOfBounds` or `BufferError::Released`.
    pub fn read_region(&self, offset: usize, len: usize) -> Result<Vec<u8>, BufferError> {
        self.alloc.with_bytes(|bytes| {
            region(bytes.len(), offset, len).map(|range| bytes[range].to_vec())
        })?
    }

    /// Writes `src` at an allocation-relative `offset`.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::OutOfBounds` or `BufferError::Released`.
    pub fn write_region(&self, offset: usize, src: &[u8]) -> Result<(), BufferError> {
        self.alloc.with_bytes_mut(|bytes| {
            let range = region(bytes.len(), offset, src.len())?;
            bytes[range].copy_from_slice(src);
            Ok(())
        })?
    }
}

fn region(size: usize, offset: usize, len: usize) -> Result<std::ops::Range<usize>, BufferError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset..end),
        _ => Err(BufferError::OutOfBounds { offset, len, size }),
    }
}

impl Clone for DataObject {
    fn clone(&self) -> Self {
        self.alloc.incr_ref();
        Self {
            alloc: Arc::clone(&self.alloc),
        }
    }
}

impl Drop for DataObject {
    fn drop(&mut self) {
        self.alloc.decr_ref();
    }
}

impl fmt::Debug for DataObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DataObject").field(&self.alloc).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Allocator, MemoryRegistry};
    use crate::types::NodeId;

    fn allocator() -> Allocator {
        Allocator::new(MemoryRegistry::new(NodeId(1)), 4096)
    }

    #[test]
    fn clone_and_drop_track_count() {
        let obj = allocator().allocate(0, 4).unwrap();
        let a = obj.clone();
        let b = a.clone();
        assert_eq!(obj.ref_count(), 3);
        drop(a);
        drop(b);
        assert_eq!(obj.ref_count(), 1);
    }

    #[test]
    fn meta_and_data_regions_are_separate() {
        let obj = allocator().allocate(4, 8).unwrap();
        obj.write_meta(b"meta").unwrap();
        obj.write_data(0, b"datadata").unwrap();
        assert_eq!(obj.meta().unwrap(), b"meta");
        assert_eq!(obj.to_vec().unwrap(), b"datadata");
        assert_eq!(obj.total_len(), 12);
    }

    #[test]
    fn out_of_bounds_write_rejected() {
        let obj = allocator().allocate(0, 4).unwrap();
        let err = obj.write_data(2, b"abc").unwrap_err();
        assert_eq!(
            err,
            BufferError::OutOfBounds {
                offset: 2,
                len: 3,
                size: 4
            }
        );
        assert!(obj.write_meta(b"x").is_err());
    }

    #[test]
    fn pin_addresses_data_region() {
        let obj = allocator().allocate(8, 16).unwrap();
        let remote = obj.pin();
        assert_eq!(remote.offset, 8);
        assert_eq!(remote.len, 16);
        assert_eq!(obj.pin(), remote);
        assert!(obj.is_pinned());
    }

    #[test]
    fn region_access_uses_allocation_offsets() {
        let obj = allocator().allocate(2, 4).unwrap();
        obj.write_region(2, b"wxyz").unwrap();
        assert_eq!(obj.read_region(2, 4).unwrap(), b"wxyz");
        assert_eq!(obj.to_vec().unwrap(), b"wxyz");
        assert!(obj.read_region(4, 4).is_err());
    }

    #[test]
    fn with_data_mut_transforms_in_place() {
        let obj = allocator().allocate_with(b"ping").unwrap();
        obj.with_data_mut(<[u8]>::make_ascii_uppercase).unwrap();
        assert_eq!(obj.to_vec().unwrap(), b"PING");
    }

    #[test]
    fn raw_address_is_stable() {
        let obj = allocator().allocate(0, 32).unwrap();
        let addr = obj.raw_address();
        assert_ne!(addr, 0);
        assert_eq!(obj.clone().raw_address(), addr);
    }

    #[test]
    fn from_allocation_fails_after_release() {
        let obj = allocator().allocate(0, 4).unwrap();
        let raw = Arc::clone(obj.allocation());
        let extra = DataObject::from_allocation(&raw).unwrap();
        assert_eq!(raw.ref_count(), 2);
        drop(extra);
        drop(obj);
        assert_eq!(
            DataObject::from_allocation(&raw).unwrap_err(),
            BufferError::Released
        );
    }
}
