use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use super::allocation::Allocation;
use super::DataObject;
use crate::types::NodeId;

struct RegistryInner {
    node: NodeId,
    entries: DashMap<u64, Weak<Allocation>>,
    next_key: AtomicU64,
}

/// Per-node table of pinned allocations, keyed by the registration key that
/// travels inside a [`RemoteBuffer`](crate::wire::RemoteBuffer).
///
/// The table holds weak pointers only: pinning never keeps an allocation
/// alive, and a key whose allocation was released stops resolving.
#[derive(Clone)]
pub struct MemoryRegistry {
    inner: Arc<RegistryInner>,
}

impl MemoryRegistry {
    /// Creates an empty registry for `node`'s memory.
    #[must_use]
    pub fn new(node: NodeId) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                node,
                entries: DashMap::new(),
                next_key: AtomicU64::new(1),
            }),
        }
    }

    /// Node that owns this memory.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.inner.node
    }

    pub(super) fn register(&self, alloc: Weak<Allocation>) -> u64 {
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        self.inner.entries.insert(key, alloc);
        key
    }

    pub(super) fn unregister(&self, key: u64) {
        self.inner.entries.remove(&key);
    }

    /// Looks up a pinned allocation and takes a reference to it.
    ///
    /// Returns `None` for unknown keys and for allocations that have already
    /// been released.
    #[must_use]
    pub fn resolve(&self, key: u64) -> Option<DataObject> {
        let alloc = self.inner.entries.get(&key)?.upgrade()?;
        if alloc.try_incr_ref() {
            Some(DataObject::adopt(alloc))
        } else {
            None
        }
    }

    /// Number of currently pinned allocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }
}

impl std::fmt::Debug for MemoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegistry")
            .field("node", &self.inner.node)
            .field("pinned", &self.inner.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Allocator;

    #[test]
    fn pinned_buffer_resolves_with_extra_reference() {
        let memory = MemoryRegistry::new(NodeId(4));
        let alloc = Allocator::new(memory.clone(), 256);
        let obj = alloc.allocate_with(b"abc").unwrap();
        let remote = obj.pin();

        assert_eq!(remote.node, NodeId(4));
        assert_eq!(memory.len(), 1);

        let resolved = memory.resolve(remote.key).unwrap();
        assert_eq!(obj.ref_count(), 2);
        assert_eq!(resolved.to_vec().unwrap(), b"abc");
    }

    #[test]
    fn release_unregisters() {
        let memory = MemoryRegistry::new(NodeId(1));
        let alloc = Allocator::new(memory.clone(), 256);
        let obj = alloc.allocate(0, 8).unwrap();
        let key = obj.pin().key;

        drop(obj);
        assert!(memory.is_empty());
        assert!(memory.resolve(key).is_none());
    }

    #[test]
    fn unknown_key_does_not_resolve() {
        let memory = MemoryRegistry::new(NodeId(1));
        assert!(memory.resolve(999).is_none());
    }
}
