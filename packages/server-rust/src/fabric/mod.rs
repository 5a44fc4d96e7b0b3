//! In-process fabric connecting several engines.
//!
//! Every message is encoded and decoded on the way through, so what arrives
//! is a node-local reconstruction, just as over a real wire. Get and put
//! resolve the remote key in the owning node's memory registry and copy
//! bytes between the two node-local buffers.

pub mod config;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use opflow_core::{BufferError, DataObject, MemoryRegistry, NodeId, OpMessage, PeerHandle, RemoteBuffer};
use parking_lot::RwLock;
use tokio::sync::mpsc;

pub use config::FabricConfig;

use crate::traits::{Transport, TransportAttachment, TransportError};

struct NodeSlot {
    inbound: mpsc::UnboundedSender<OpMessage>,
    memory: MemoryRegistry,
}

struct FabricInner {
    config: RwLock<FabricConfig>,
    nodes: DashMap<NodeId, NodeSlot>,
    down: DashSet<NodeId>,
}

impl FabricInner {
    /// Fails unless both ends are attached and up.
    fn check_link(&self, from: NodeId, to: NodeId) -> Result<(), TransportError> {
        if self.down.contains(&from) {
            return Err(TransportError::Disconnected);
        }
        if self.down.contains(&to) || !self.nodes.contains_key(&to) {
            return Err(TransportError::Unreachable { node: to });
        }
        Ok(())
    }

    async fn delay(&self) {
        let latency = self.config.read().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn memory_of(&self, node: NodeId) -> Result<MemoryRegistry, TransportError> {
        self.nodes
            .get(&node)
            .map(|slot| slot.memory.clone())
            .ok_or(TransportError::Unreachable { node })
    }

    fn resolve(&self, peer: PeerHandle, remote: RemoteBuffer) -> Result<DataObject, TransportError> {
        let invalid = TransportError::InvalidRemoteBuffer {
            node: remote.node,
            key: remote.key,
        };
        if remote.node != peer.node() {
            return Err(invalid);
        }
        self.memory_of(remote.node)?
            .resolve(remote.key)
            .ok_or(invalid)
    }
}

/// Shared in-process fabric. Cheap to clone.
#[derive(Clone)]
pub struct LocalFabric {
    inner: Arc<FabricInner>,
}

impl LocalFabric {
    /// Creates an empty fabric. Nodes join with `attach`.
    #[must_use]
    pub fn new(config: FabricConfig) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                config: RwLock::new(config),
                nodes: DashMap::new(),
                down: DashSet::new(),
            }),
        }
    }

    /// Connects `node` and returns what its engine starts from. Attaching a
    /// node again replaces its previous endpoint.
    #[must_use]
    pub fn attach(&self, node: NodeId) -> TransportAttachment {
        let (tx, rx) = mpsc::unbounded_channel();
        let memory = MemoryRegistry::new(node);
        let previous = self.inner.nodes.insert(
            node,
            NodeSlot {
                inbound: tx,
                memory: memory.clone(),
            },
        );
        if previous.is_some() {
            tracing::warn!(%node, "node re-attached; previous endpoint replaced");
        }
        tracing::debug!(%node, "node attached to fabric");
        TransportAttachment {
            transport: Arc::new(LocalTransport {
                node,
                fabric: Arc::clone(&self.inner),
            }),
            inbound: rx,
            memory,
        }
    }

    /// Removes `node`. Its engine's inbound channel closes.
    pub fn detach(&self, node: NodeId) {
        self.inner.nodes.remove(&node);
    }

    /// Takes a node's links down or back up. Actions touching a down node
    /// fail instead of being silently lost.
    pub fn set_reachable(&self, node: NodeId, reachable: bool) {
        if reachable {
            self.inner.down.remove(&node);
        } else {
            self.inner.down.insert(node);
        }
        tracing::info!(%node, reachable, "link state changed");
    }

    /// Changes the send loss probability, clamped to `[0, 1]`. Applies to sends
    /// issued from now on.
    pub fn set_drop_rate(&self, drop_rate: f64) {
        self.inner.config.write().drop_rate = drop_rate.clamp(0.0, 1.0);
    }

    /// Changes the delay added to every action issued from now on.
    pub fn set_latency(&self, latency: std::time::Duration) {
        self.inner.config.write().latency = latency;
    }

    /// Attached nodes, sorted.
    #[must_use]
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.inner.nodes.iter().map(|e| *e.key()).collect();
        nodes.sort();
        nodes
    }
}

impl Default for LocalFabric {
    fn default() -> Self {
        Self::new(FabricConfig::default())
    }
}

impl std::fmt::Debug for LocalFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFabric")
            .field("nodes", &self.nodes())
            .field("config", &*self.inner.config.read())
            .finish()
    }
}

/// One node's endpoint on a [`LocalFabric`].
struct LocalTransport {
    node: NodeId,
    fabric: Arc<FabricInner>,
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_node(&self) -> NodeId {
        self.node
    }

    fn peer(&self, node: NodeId) -> Option<PeerHandle> {
        self.fabric
            .nodes
            .contains_key(&node)
            .then(|| PeerHandle::new(node))
    }

    async fn send(&self, peer: PeerHandle, msg: OpMessage) -> Result<(), TransportError> {
        let wire = msg.encode()?;
        self.fabric.check_link(self.node, peer.node())?;
        self.fabric.delay().await;

        let drop_rate = self.fabric.config.read().drop_rate;
        if drop_rate > 0.0 && rand::random::<f64>() < drop_rate {
            tracing::trace!(to = %peer.node(), "message lost in fabric");
            return Ok(());
        }

        let msg = OpMessage::decode(&wire)?;
        let inbound = self
            .fabric
            .nodes
            .get(&peer.node())
            .map(|slot| slot.inbound.clone())
            .ok_or(TransportError::Unreachable { node: peer.node() })?;
        inbound.send(msg).map_err(|_| TransportError::Disconnected)
    }

    async fn get(
        &self,
        peer: PeerHandle,
        remote: RemoteBuffer,
        local: DataObject,
    ) -> Result<(), TransportError> {
        self.fabric.check_link(self.node, peer.node())?;
        self.fabric.delay().await;

        let source = self.fabric.resolve(peer, remote)?;
        let bytes = source.read_region(remote.offset as usize, remote.len as usize)?;
        local.write_data(0, &bytes)?;
        Ok(())
    }

    async fn put(
        &self,
        peer: PeerHandle,
        local: DataObject,
        remote: RemoteBuffer,
    ) -> Result<(), TransportError> {
        self.fabric.check_link(self.node, peer.node())?;
        self.fabric.delay().await;

        let target = self.fabric.resolve(peer, remote)?;
        let data = local.to_vec()?;
        let len = remote.len as usize;
        let chunk = data.get(..len).ok_or(BufferError::OutOfBounds {
            offset: 0,
            len,
            size: data.len(),
        })?;
        target.write_region(remote.offset as usize, chunk)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use opflow_core::{Allocator, Mailbox, OpTypeId};

    use super::*;

    fn message(to: Mailbox) -> OpMessage {
        OpMessage {
            op_id: OpTypeId::from_name("PingOp"),
            src_node: NodeId(1),
            src_mailbox: Mailbox(1),
            dst_mailbox: to,
            flags: 0,
            body: Bytes::from_static(b"hello"),
            remote: None,
        }
    }

    #[tokio::test]
    async fn send_reaches_peer_inbound() {
        let fabric = LocalFabric::default();
        let a = fabric.attach(NodeId(1));
        let mut b = fabric.attach(NodeId(2));

        let peer = a.transport.peer(NodeId(2)).unwrap();
        a.transport.send(peer, message(Mailbox::NONE)).await.unwrap();

        let received = b.inbound.recv().await.unwrap();
        assert_eq!(received, message(Mailbox::NONE));
    }

    #[tokio::test]
    async fn unknown_peer_has_no_handle() {
        let fabric = LocalFabric::default();
        let a = fabric.attach(NodeId(1));
        assert!(a.transport.peer(NodeId(9)).is_none());
    }

    #[tokio::test]
    async fn down_link_fails_send() {
        let fabric = LocalFabric::default();
        let a = fabric.attach(NodeId(1));
        let _b = fabric.attach(NodeId(2));
        let peer = a.transport.peer(NodeId(2)).unwrap();

        fabric.set_reachable(NodeId(2), false);
        let err = a.transport.send(peer, message(Mailbox::NONE)).await.unwrap_err();
        assert_eq!(err, TransportError::Unreachable { node: NodeId(2) });

        fabric.set_reachable(NodeId(2), true);
        assert!(a.transport.send(peer, message(Mailbox::NONE)).await.is_ok());
    }

    #[tokio::test]
    async fn full_drop_rate_loses_sends_silently() {
        let fabric = LocalFabric::default();
        let a = fabric.attach(NodeId(1));
        let mut b = fabric.attach(NodeId(2));
        fabric.set_drop_rate(1.0);

        let peer = a.transport.peer(NodeId(2)).unwrap();
        a.transport.send(peer, message(Mailbox::NONE)).await.unwrap();
        assert!(b.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn get_and_put_copy_between_nodes() {
        let fabric = LocalFabric::default();
        let a = fabric.attach(NodeId(1));
        let b = fabric.attach(NodeId(2));
        let alloc_a = Allocator::new(a.memory.clone(), 1024);
        let alloc_b = Allocator::new(b.memory.clone(), 1024);

        let source = alloc_a.allocate_with(b"abcd").unwrap();
        let remote = source.pin();

        let local = alloc_b.allocate(0, 4).unwrap();
        let peer = b.transport.peer(NodeId(1)).unwrap();
        b.transport.get(peer, remote, local.clone()).await.unwrap();
        assert_eq!(local.to_vec().unwrap(), b"abcd");

        local.with_data_mut(<[u8]>::make_ascii_uppercase).unwrap();
        b.transport.put(peer, local.clone(), remote).await.unwrap();
        assert_eq!(source.to_vec().unwrap(), b"ABCD");

        assert_eq!(local.ref_count(), 1);
        assert_eq!(source.ref_count(), 1);
    }

    #[tokio::test]
    async fn get_of_released_buffer_fails() {
        let fabric = LocalFabric::default();
        let a = fabric.attach(NodeId(1));
        let b = fabric.attach(NodeId(2));
        let alloc_a = Allocator::new(a.memory.clone(), 1024);
        let alloc_b = Allocator::new(b.memory.clone(), 1024);

        let source = alloc_a.allocate_with(b"gone").unwrap();
        let remote = source.pin();
        drop(source);

        let peer = b.transport.peer(NodeId(1)).unwrap();
        let err = b
            .transport
            .get(peer, remote, alloc_b.allocate(0, 4).unwrap())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::InvalidRemoteBuffer {
                node: NodeId(1),
                key: remote.key
            }
        );
    }
}
