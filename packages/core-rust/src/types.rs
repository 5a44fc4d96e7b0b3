use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::fnv1a_hash_str;

/// Numeric identifier of an operation protocol.
///
/// Derived from the protocol name with [`OpTypeId::from_name`], so every node
/// running the same protocol agrees on its id without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpTypeId(pub u32);

impl OpTypeId {
    /// Hashes `name` into an id. Usable in `const` context.
    #[must_use]
    pub const fn from_name(name: &str) -> Self {
        Self(fnv1a_hash_str(name))
    }
}

impl fmt::Display for OpTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Local endpoint of one side of an operation conversation.
///
/// `Mailbox::NONE` (0) marks a destination that has not been assigned yet,
/// i.e. the first message of a new conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mailbox(pub u32);

impl Mailbox {
    /// The unassigned mailbox.
    pub const NONE: Mailbox = Mailbox(0);

    /// Whether this is the unassigned mailbox.
    #[must_use]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mb:{}", self.0)
    }
}

/// Identifier of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// Opaque handle to a remote node.
///
/// Handles are handed out by a transport for the nodes it can reach; operations
/// only hold on to them and pass them back when issuing network actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    node: NodeId,
}

impl PeerHandle {
    /// Creates a handle. Intended for transport implementations.
    #[must_use]
    pub fn new(node: NodeId) -> Self {
        Self { node }
    }

    /// The node this handle refers to.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_type_id_from_name_is_stable() {
        const PING: OpTypeId = OpTypeId::from_name("PingOp");
        assert_eq!(PING, OpTypeId::from_name("PingOp"));
        assert_ne!(PING, OpTypeId::from_name("RdmaPingOp"));
    }

    #[test]
    fn mailbox_none() {
        assert!(Mailbox::NONE.is_none());
        assert!(!Mailbox(7).is_none());
    }

    #[test]
    fn display_formats() {
        assert_eq!(Mailbox(12).to_string(), "mb:12");
        assert_eq!(NodeId(3).to_string(), "node:3");
        assert_eq!(OpTypeId(0xff).to_string(), "0x000000ff");
    }

    #[test]
    fn peer_handle_reports_node() {
        let peer = PeerHandle::new(NodeId(9));
        assert_eq!(peer.node(), NodeId(9));
    }
}
