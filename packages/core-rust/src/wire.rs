//! Wire message exchanged between the two sides of an operation.
//!
//! Messages are small, eager control packets. Bulk data moves through
//! remote get/put against a pinned buffer whose address travels in
//! [`OpMessage::remote`]. Messages are encoded as `MsgPack` with named fields
//! (`rmp_serde::to_vec_named()`).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{Mailbox, NodeId, OpTypeId};

/// Upper bound on an encoded message. Anything larger has to go through get/put.
pub const MAX_MESSAGE_BYTES: usize = 4096;

/// Set by a target to tell the origin that it gave up on the conversation.
pub const FLAG_ERROR: u16 = 0x0001;

/// Addressing metadata for a remotely accessible buffer region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBuffer {
    /// Node owning the memory.
    pub node: NodeId,
    /// Registration key in the owner's memory registry.
    pub key: u64,
    /// Offset of the region within the allocation.
    pub offset: u32,
    /// Length of the region in bytes.
    pub len: u32,
}

/// One message of an operation conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpMessage {
    /// Protocol the conversation belongs to.
    pub op_id: OpTypeId,
    /// Node that sent this message.
    pub src_node: NodeId,
    /// Sender's mailbox; replies are addressed to it.
    pub src_mailbox: Mailbox,
    /// Receiver's mailbox, or `Mailbox::NONE` to start a new conversation.
    pub dst_mailbox: Mailbox,
    /// Protocol flags (see [`FLAG_ERROR`]).
    #[serde(default)]
    pub flags: u16,
    /// Protocol-specific payload.
    pub body: Bytes,
    /// Buffer the receiver may get from or put into.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub remote: Option<RemoteBuffer>,
}

/// Errors from encoding or decoding an [`OpMessage`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("failed to decode message: {0}")]
    Decode(String),
    #[error("encoded message is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },
}

impl OpMessage {
    /// Returns `true` when the sender flagged the conversation as failed.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.flags & FLAG_ERROR != 0
    }

    /// Returns `true` if this message opens a new conversation.
    #[must_use]
    pub fn starts_conversation(&self) -> bool {
        self.dst_mailbox.is_none()
    }

    /// Encodes the message for the wire.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::TooLarge` if the encoded form exceeds
    /// [`MAX_MESSAGE_BYTES`], or `CodecError::Encode` on serializer failure.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let bytes =
            rmp_serde::to_vec_named(self).map_err(|e| CodecError::Encode(e.to_string()))?;
        if bytes.len() > MAX_MESSAGE_BYTES {
            return Err(CodecError::TooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_BYTES,
            });
        }
        Ok(bytes)
    }

    /// Decodes a message received from the wire.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if the bytes are not a valid message.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        rmp_serde::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(body: &'static [u8]) -> OpMessage {
        OpMessage {
            op_id: OpTypeId::from_name("PingOp"),
            src_node: NodeId(1),
            src_mailbox: Mailbox(5),
            dst_mailbox: Mailbox::NONE,
            flags: 0,
            body: Bytes::from_static(body),
            remote: None,
        }
    }

    #[test]
    fn encode_decode_preserves_fields() {
        let mut msg = sample(b"this is the ping message");
        msg.remote = Some(RemoteBuffer {
            node: NodeId(1),
            key: 42,
            offset: 0,
            len: 24,
        });
        let decoded = OpMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn oversized_message_rejected() {
        let mut msg = sample(b"");
        msg.body = Bytes::from(vec![7u8; MAX_MESSAGE_BYTES]);
        let err = msg.encode().unwrap_err();
        assert!(matches!(err, CodecError::TooLarge { max, .. } if max == MAX_MESSAGE_BYTES));
    }

    #[test]
    fn garbage_fails_to_decode() {
        let err = OpMessage::decode(&[0xc1, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn flags_and_conversation_start() {
        let mut msg = sample(b"x");
        assert!(msg.starts_conversation());
        assert!(!msg.is_error());

        msg.dst_mailbox = Mailbox(3);
        msg.flags |= FLAG_ERROR;
        assert!(!msg.starts_conversation());
        assert!(msg.is_error());
    }

    #[test]
    fn remote_field_omitted_when_absent() {
        let with_remote = {
            let mut m = sample(b"abc");
            m.remote = Some(RemoteBuffer {
                node: NodeId(2),
                key: 1,
                offset: 0,
                len: 3,
            });
            m.encode().unwrap()
        };
        let without = sample(b"abc").encode().unwrap();
        assert!(without.len() < with_remote.len());
    }
}
