use std::sync::Arc;

use async_trait::async_trait;
use opflow_core::{
    BufferError, CodecError, DataObject, MemoryRegistry, NodeId, OpMessage, PeerHandle,
    RemoteBuffer,
};
use tokio::sync::mpsc;

/// Failure of a single network action. Delivered to the issuing operation as
/// a failed completion; the engine never retries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("{node} is unreachable")]
    Unreachable { node: NodeId },
    #[error("transport is disconnected")]
    Disconnected,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("remote buffer key {key} is not registered on {node}")]
    InvalidRemoteBuffer { node: NodeId, key: u64 },
}

/// Message and remote-memory fabric connecting engines on different nodes.
///
/// Every async method resolves when the action has completed on the wire,
/// which is the completion event the engine hands back to the operation.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Node this transport endpoint belongs to.
    fn local_node(&self) -> NodeId;

    /// Returns a handle for `node` if the fabric knows it.
    fn peer(&self, node: NodeId) -> Option<PeerHandle>;

    /// Sends an eager message.
    async fn send(&self, peer: PeerHandle, msg: OpMessage) -> Result<(), TransportError>;

    /// Copies the remote region into the start of `local`'s data region.
    async fn get(
        &self,
        peer: PeerHandle,
        remote: RemoteBuffer,
        local: DataObject,
    ) -> Result<(), TransportError>;

    /// Copies the first `remote.len` bytes of `local`'s data region into the
    /// remote region.
    async fn put(
        &self,
        peer: PeerHandle,
        local: DataObject,
        remote: RemoteBuffer,
    ) -> Result<(), TransportError>;
}

/// Everything an engine needs from the fabric to start on one node.
pub struct TransportAttachment {
    pub transport: Arc<dyn Transport>,
    /// Messages addressed to this node, in arrival order.
    pub inbound: mpsc::UnboundedReceiver<OpMessage>,
    /// Registry through which remote nodes reach this node's pinned buffers.
    pub memory: MemoryRegistry,
}

impl std::fmt::Debug for TransportAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportAttachment")
            .field("node", &self.transport.local_node())
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}
