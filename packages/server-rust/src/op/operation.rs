//! The state-machine contract every protocol implements.
//!
//! An operation is driven one event at a time. The engine calls
//! [`Op::update_origin`] on the instance a caller launched, or
//! [`Op::update_target`] on the instance it built from the registry when the
//! first message of a conversation arrived. Each call returns a
//! [`WaitingType`] telling the engine what to wait for next. Network actions
//! requested through the [`OpContext`] are issued only after the call returns,
//! so an update never blocks.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use opflow_core::{
    Allocator, DataObject, Mailbox, NodeId, OpMessage, OpTypeId, PeerHandle, RemoteBuffer,
};
use serde::Serialize;

use crate::op::OpError;
use crate::traits::{Transport, TransportError};

// ---------------------------------------------------------------------------
// Op traits
// ---------------------------------------------------------------------------

/// Marker passed to [`RegisteredOp::create_as_target`]. Target instances carry
/// no caller state; everything they need arrives in the first message.
#[derive(Debug, Clone, Copy)]
pub struct CreateAsTarget;

/// One protocol's state machine.
pub trait Op: Send + 'static {
    fn op_type_id(&self) -> OpTypeId;

    fn op_type_name(&self) -> &'static str;

    /// Advances the initiating side.
    fn update_origin(&mut self, event: OpEvent, ctx: &mut OpContext<'_>) -> WaitingType;

    /// Advances the responding side.
    fn update_target(&mut self, event: OpEvent, ctx: &mut OpContext<'_>) -> WaitingType;

    /// Name of the current state, for logs and introspection. Must not have
    /// side effects.
    fn state_name(&self) -> &'static str;
}

/// A protocol the registry can instantiate on the target side.
pub trait RegisteredOp: Op + Sized {
    const OP_ID: OpTypeId;
    const OP_NAME: &'static str;

    fn create_as_target(marker: CreateAsTarget) -> Self;
}

/// Which side of a conversation an instance drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Origin,
    Target,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Origin => f.write_str("origin"),
            Self::Target => f.write_str("target"),
        }
    }
}

// ---------------------------------------------------------------------------
// Events and waiting conditions
// ---------------------------------------------------------------------------

/// Identifies one network action issued by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionId(pub(crate) u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action:{}", self.0)
    }
}

/// Kind of network action a completion refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetOpKind {
    Send,
    Get,
    Put,
}

/// Input to one transition.
#[derive(Debug, Clone)]
pub enum OpEvent {
    /// First event of an origin instance.
    Start,
    /// A message addressed to this instance's mailbox.
    Message(OpMessage),
    /// A network action finished. Successful sends are not reported; failed
    /// sends and every get/put are.
    Completion {
        action: ActionId,
        kind: NetOpKind,
        outcome: Result<(), TransportError>,
    },
    /// Local input delivered through `Engine::trigger`.
    UserTrigger(Bytes),
    /// The duration of the last `WaitOnTimeout` elapsed with no other event.
    Timeout,
}

impl OpEvent {
    /// Short label for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Message(_) => "message",
            Self::Completion { .. } => "completion",
            Self::UserTrigger(_) => "user_trigger",
            Self::Timeout => "timeout",
        }
    }
}

/// What an operation waits for after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitingType {
    WaitOnMessage,
    WaitOnCompletion,
    WaitOnUser,
    /// Wait for any event, or `Timeout` once the duration elapses.
    WaitOnTimeout(Duration),
    /// Finished. Retired once outstanding network actions complete.
    DoneAndDestroy,
    /// Finished with a failure. Retired like `DoneAndDestroy`.
    Error,
}

impl WaitingType {
    /// `true` for the variants after which the op is retired.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::DoneAndDestroy | Self::Error)
    }

    /// Label shown as `waiting` in `live_ops`.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::WaitOnMessage => "wait_on_message",
            Self::WaitOnCompletion => "wait_on_completion",
            Self::WaitOnUser => "wait_on_user",
            Self::WaitOnTimeout(_) => "wait_on_timeout",
            Self::DoneAndDestroy => "done",
            Self::Error => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// OpContext
// ---------------------------------------------------------------------------

/// Network action queued during a transition.
pub(crate) enum NetAction {
    Send {
        peer: PeerHandle,
        msg: OpMessage,
    },
    Get {
        peer: PeerHandle,
        remote: RemoteBuffer,
        local: DataObject,
    },
    Put {
        peer: PeerHandle,
        local: DataObject,
        remote: RemoteBuffer,
    },
}

impl NetAction {
    pub(crate) fn kind(&self) -> NetOpKind {
        match self {
            Self::Send { .. } => NetOpKind::Send,
            Self::Get { .. } => NetOpKind::Get,
            Self::Put { .. } => NetOpKind::Put,
        }
    }
}

/// Engine services available to an operation during one transition.
pub struct OpContext<'a> {
    mailbox: Mailbox,
    node: NodeId,
    allocator: &'a Allocator,
    transport: &'a dyn Transport,
    next_action: &'a mut u64,
    actions: Vec<(ActionId, NetAction)>,
}

impl<'a> OpContext<'a> {
    pub(crate) fn new(
        mailbox: Mailbox,
        allocator: &'a Allocator,
        transport: &'a dyn Transport,
        next_action: &'a mut u64,
    ) -> Self {
        Self {
            mailbox,
            node: transport.local_node(),
            allocator,
            transport,
            next_action,
            actions: Vec::new(),
        }
    }

    /// This instance's mailbox.
    #[must_use]
    pub fn mailbox(&self) -> Mailbox {
        self.mailbox
    }

    /// Local node.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Node-local allocator for buffers the op moves.
    #[must_use]
    pub fn allocator(&self) -> &Allocator {
        self.allocator
    }

    /// Handle for `node`, if the transport knows it.
    #[must_use]
    pub fn peer(&self, node: NodeId) -> Option<PeerHandle> {
        self.transport.peer(node)
    }

    /// Builds a message from this instance's mailbox to `dst`.
    #[must_use]
    pub fn new_message(&self, op_id: OpTypeId, dst: Mailbox, body: impl Into<Bytes>) -> OpMessage {
        OpMessage {
            op_id,
            src_node: self.node,
            src_mailbox: self.mailbox,
            dst_mailbox: dst,
            flags: 0,
            body: body.into(),
            remote: None,
        }
    }

    /// Queues an eager send. Only a failure is reported back.
    pub fn send(&mut self, peer: PeerHandle, msg: OpMessage) -> ActionId {
        self.push(NetAction::Send { peer, msg })
    }

    /// Queues a remote get into `local`.
    pub fn get(&mut self, peer: PeerHandle, remote: RemoteBuffer, local: DataObject) -> ActionId {
        self.push(NetAction::Get {
            peer,
            remote,
            local,
        })
    }

    /// Queues a remote put from `local`.
    pub fn put(&mut self, peer: PeerHandle, local: DataObject, remote: RemoteBuffer) -> ActionId {
        self.push(NetAction::Put {
            peer,
            local,
            remote,
        })
    }

    /// Queues a reply to `incoming`, addressed to its sender's mailbox.
    ///
    /// # Errors
    ///
    /// Returns `OpError::Transport` if the sender's node is not reachable
    /// through this transport.
    pub fn reply(
        &mut self,
        incoming: &OpMessage,
        body: impl Into<Bytes>,
        flags: u16,
    ) -> Result<ActionId, OpError> {
        let peer = self
            .peer(incoming.src_node)
            .ok_or(TransportError::Unreachable {
                node: incoming.src_node,
            })?;
        let mut msg = self.new_message(incoming.op_id, incoming.src_mailbox, body);
        msg.flags = flags;
        Ok(self.send(peer, msg))
    }

    fn push(&mut self, action: NetAction) -> ActionId {
        *self.next_action += 1;
        let id = ActionId(*self.next_action);
        self.actions.push((id, action));
        id
    }

    pub(crate) fn into_actions(self) -> Vec<(ActionId, NetAction)> {
        self.actions
    }
}

// ---------------------------------------------------------------------------
// OpCell
// ---------------------------------------------------------------------------

/// A broken engine invariant. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("{op_name} received a {event} event after reaching its terminal state")]
    UpdateAfterDone {
        op_name: &'static str,
        event: &'static str,
    },
}

/// Owns one live instance and enforces that nothing reaches it after it
/// reported a terminal waiting type.
pub(crate) struct OpCell {
    op: Box<dyn Op>,
    role: Role,
    done: bool,
}

impl OpCell {
    pub(crate) fn new(op: Box<dyn Op>, role: Role) -> Self {
        Self {
            op,
            role,
            done: false,
        }
    }

    pub(crate) fn update(
        &mut self,
        event: OpEvent,
        ctx: &mut OpContext<'_>,
    ) -> Result<WaitingType, InvariantViolation> {
        if self.done {
            return Err(InvariantViolation::UpdateAfterDone {
                op_name: self.op.op_type_name(),
                event: event.name(),
            });
        }
        let wait = match self.role {
            Role::Origin => self.op.update_origin(event, ctx),
            Role::Target => self.op.update_target(event, ctx),
        };
        if wait.is_terminal() {
            self.done = true;
        }
        Ok(wait)
    }

    pub(crate) fn state_name(&self) -> &'static str {
        self.op.state_name()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
