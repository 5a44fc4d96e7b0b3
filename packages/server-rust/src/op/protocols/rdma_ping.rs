//! Ping through remote memory.
//!
//! The origin pins a buffer holding the message and sends only its address.
//! The target gets the bytes into a buffer of its own, upper-cases them, puts
//! them back into the origin's buffer and acknowledges. The origin then reads
//! the transformed message out of its own buffer.

use std::time::Duration;

use bytes::Bytes;
use opflow_core::{
    Allocator, BufferError, DataObject, Mailbox, OpMessage, OpTypeId, PeerHandle, RemoteBuffer,
    FLAG_ERROR,
};

use crate::op::operation::{
    CreateAsTarget, NetOpKind, Op, OpContext, OpEvent, RegisteredOp, WaitingType,
};
use crate::op::result::{result_channel, ResultFuture, ResultPromise};
use crate::op::OpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    WaitForAck,
    WaitForGet,
    WaitForPut,
    Done,
}

/// Target-side conversation state, captured from the first message.
#[derive(Debug)]
struct Exchange {
    request: OpMessage,
    peer: PeerHandle,
    remote: RemoteBuffer,
    local: DataObject,
}

#[derive(Debug)]
pub struct RdmaPingOp {
    state: State,
    peer: Option<PeerHandle>,
    buffer: Option<DataObject>,
    timeout: Option<Duration>,
    promise: Option<ResultPromise<String>>,
    exchange: Option<Exchange>,
}

impl RdmaPingOp {
    /// Allocates the origin's buffer and copies `message` into it.
    ///
    /// # Errors
    ///
    /// Returns the allocator's error; the op is never created in that case.
    pub fn new(
        allocator: &Allocator,
        peer: PeerHandle,
        message: &str,
    ) -> Result<(Self, ResultFuture<String>), BufferError> {
        let buffer = allocator.allocate_with(message.as_bytes())?;
        let (promise, future) = result_channel();
        let op = Self {
            state: State::Start,
            peer: Some(peer),
            buffer: Some(buffer),
            timeout: None,
            promise: Some(promise),
            exchange: None,
        };
        Ok((op, future))
    }

    /// Fails with `OpError::TimedOut` if no acknowledgement arrives within
    /// `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn finish(&mut self, result: Result<String, OpError>) -> WaitingType {
        let failed = result.is_err();
        if let Some(mut promise) = self.promise.take() {
            promise.fulfill(result);
        }
        self.state = State::Done;
        if failed {
            WaitingType::Error
        } else {
            WaitingType::DoneAndDestroy
        }
    }

    fn read_back(&self) -> Result<String, OpError> {
        let buffer = self
            .buffer
            .as_ref()
            .ok_or_else(|| OpError::Protocol("origin without a buffer".into()))?;
        let bytes = buffer.to_vec()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Handles the first message on the target: allocate, then get.
    fn accept(&mut self, msg: OpMessage, ctx: &mut OpContext<'_>) -> WaitingType {
        let Some(remote) = msg.remote else {
            self.state = State::Done;
            return reject(ctx, &msg, "request carries no remote buffer");
        };
        let Some(peer) = ctx.peer(msg.src_node) else {
            tracing::warn!(node = %msg.src_node, "rdma ping origin is not reachable");
            self.state = State::Done;
            return WaitingType::Error;
        };
        let local = match ctx.allocator().allocate(0, remote.len) {
            Ok(local) => local,
            Err(e) => {
                self.state = State::Done;
                return reject(ctx, &msg, &e.to_string());
            }
        };
        ctx.get(peer, remote, local.clone());
        self.exchange = Some(Exchange {
            request: msg,
            peer,
            remote,
            local,
        });
        self.state = State::WaitForGet;
        WaitingType::WaitOnCompletion
    }
}

fn reject(ctx: &mut OpContext<'_>, msg: &OpMessage, reason: &str) -> WaitingType {
    if let Err(err) = ctx.reply(msg, Bytes::copy_from_slice(reason.as_bytes()), FLAG_ERROR) {
        tracing::warn!(%err, "cannot deliver rejection");
    }
    WaitingType::Error
}

impl RegisteredOp for RdmaPingOp {
    const OP_ID: OpTypeId = OpTypeId::from_name("RdmaPingOp");
    const OP_NAME: &'static str = "RdmaPingOp";

    fn create_as_target(_marker: CreateAsTarget) -> Self {
        Self {
            state: State::Start,
            peer: None,
            buffer: None,
            timeout: None,
            promise: None,
            exchange: None,
        }
    }
}

impl Op for RdmaPingOp {
    fn op_type_id(&self) -> OpTypeId {
        Self::OP_ID
    }

    fn op_type_name(&self) -> &'static str {
        Self::OP_NAME
    }

    fn update_origin(&mut self, event: OpEvent, ctx: &mut OpContext<'_>) -> WaitingType {
        match (self.state, event) {
            (State::Start, OpEvent::Start) => {
                let (Some(peer), Some(buffer)) = (self.peer, self.buffer.as_ref()) else {
                    return self.finish(Err(OpError::Protocol("origin not initialized".into())));
                };
                let mut msg = ctx.new_message(Self::OP_ID, Mailbox::NONE, Bytes::new());
                msg.remote = Some(buffer.pin());
                ctx.send(peer, msg);
                self.state = State::WaitForAck;
                self.timeout
                    .map_or(WaitingType::WaitOnMessage, WaitingType::WaitOnTimeout)
            }
            (State::WaitForAck, OpEvent::Message(msg)) => {
                if msg.is_error() {
                    let reason = String::from_utf8_lossy(&msg.body).into_owned();
                    return self.finish(Err(OpError::Rejected(reason)));
                }
                let result = self.read_back();
                self.finish(result)
            }
            (
                _,
                OpEvent::Completion {
                    outcome: Err(e), ..
                },
            ) => self.finish(Err(OpError::Transport(e))),
            (State::WaitForAck, OpEvent::Timeout) => self.finish(Err(OpError::TimedOut)),
            (_, other) => {
                tracing::debug!(event = other.name(), "rdma ping origin ignoring event");
                self.timeout
                    .map_or(WaitingType::WaitOnMessage, WaitingType::WaitOnTimeout)
            }
        }
    }

    fn update_target(&mut self, event: OpEvent, ctx: &mut OpContext<'_>) -> WaitingType {
        match (self.state, event) {
            (State::Start, OpEvent::Message(msg)) => self.accept(msg, ctx),
            (
                State::WaitForGet | State::WaitForPut,
                OpEvent::Completion {
                    kind,
                    outcome: Err(e),
                    ..
                },
            ) => {
                self.state = State::Done;
                let Some(exchange) = self.exchange.take() else {
                    return WaitingType::Error;
                };
                tracing::warn!(?kind, error = %e, "rdma ping transfer failed");
                reject(ctx, &exchange.request, &e.to_string())
            }
            (
                State::WaitForGet,
                OpEvent::Completion {
                    kind: NetOpKind::Get,
                    outcome: Ok(()),
                    ..
                },
            ) => {
                let Some(exchange) = self.exchange.as_ref() else {
                    return WaitingType::Error;
                };
                if let Err(e) = exchange.local.with_data_mut(<[u8]>::make_ascii_uppercase) {
                    let request = exchange.request.clone();
                    self.state = State::Done;
                    return reject(ctx, &request, &e.to_string());
                }
                ctx.put(exchange.peer, exchange.local.clone(), exchange.remote);
                self.state = State::WaitForPut;
                WaitingType::WaitOnCompletion
            }
            (
                State::WaitForPut,
                OpEvent::Completion {
                    kind: NetOpKind::Put,
                    outcome: Ok(()),
                    ..
                },
            ) => {
                self.state = State::Done;
                let Some(exchange) = self.exchange.take() else {
                    return WaitingType::Error;
                };
                match ctx.reply(&exchange.request, Bytes::new(), 0) {
                    Ok(_) => WaitingType::DoneAndDestroy,
                    Err(err) => {
                        tracing::warn!(%err, "cannot acknowledge rdma ping");
                        WaitingType::Error
                    }
                }
            }
            (_, other) => {
                tracing::debug!(event = other.name(), "rdma ping target ignoring event");
                WaitingType::WaitOnCompletion
            }
        }
    }

    fn state_name(&self) -> &'static str {
        match self.state {
            State::Start => "start",
            State::WaitForAck => "wait_for_ack",
            State::WaitForGet => "wait_for_get",
            State::WaitForPut => "wait_for_put",
            State::Done => "done",
        }
    }
}

#[cfg(test)]
mod tests {
    use opflow_core::NodeId;

    use super::*;
    use crate::op::operation::tests::{allocator, RecordingTransport};
    use crate::op::ActionId;
    use crate::traits::TransportError;

    fn completion(kind: NetOpKind, outcome: Result<(), TransportError>) -> OpEvent {
        OpEvent::Completion {
            action: ActionId(1),
            kind,
            outcome,
        }
    }

    #[test]
    fn allocation_failure_reaches_caller() {
        let alloc = Allocator::new(opflow_core::MemoryRegistry::new(NodeId(1)), 4);
        let err = RdmaPingOp::new(&alloc, PeerHandle::new(NodeId(2)), "too long").unwrap_err();
        assert!(matches!(err, BufferError::OutOfMemory { .. }));
    }

    #[test]
    fn origin_pins_buffer_and_sends_address() {
        let alloc = allocator();
        let transport = RecordingTransport::default();
        let (mut op, _future) = RdmaPingOp::new(&alloc, PeerHandle::new(NodeId(2)), "ping").unwrap();

        let mut counter = 0;
        let mut ctx = OpContext::new(Mailbox(1), &alloc, &transport, &mut counter);
        assert_eq!(
            op.update_origin(OpEvent::Start, &mut ctx),
            WaitingType::WaitOnMessage
        );
        assert_eq!(ctx.into_actions().len(), 1);
        assert_eq!(op.state_name(), "wait_for_ack");
        assert_eq!(alloc.memory().len(), 1);
    }

    #[test]
    fn target_walks_get_put_ack() {
        let alloc = allocator();
        let transport = RecordingTransport::default();
        let mut op = RdmaPingOp::create_as_target(CreateAsTarget);
        let request = OpMessage {
            op_id: RdmaPingOp::OP_ID,
            src_node: NodeId(2),
            src_mailbox: Mailbox(5),
            dst_mailbox: Mailbox::NONE,
            flags: 0,
            body: Bytes::new(),
            remote: Some(RemoteBuffer {
                node: NodeId(2),
                key: 1,
                offset: 0,
                len: 4,
            }),
        };
        let mut counter = 0;

        let mut ctx = OpContext::new(Mailbox(1), &alloc, &transport, &mut counter);
        assert_eq!(
            op.update_target(OpEvent::Message(request), &mut ctx),
            WaitingType::WaitOnCompletion
        );
        assert_eq!(op.state_name(), "wait_for_get");
        drop(ctx);

        op.exchange
            .as_ref()
            .unwrap()
            .local
            .write_data(0, b"ping")
            .unwrap();

        let mut ctx = OpContext::new(Mailbox(1), &alloc, &transport, &mut counter);
        assert_eq!(
            op.update_target(completion(NetOpKind::Get, Ok(())), &mut ctx),
            WaitingType::WaitOnCompletion
        );
        assert_eq!(op.state_name(), "wait_for_put");
        assert_eq!(
            op.exchange.as_ref().unwrap().local.to_vec().unwrap(),
            b"PING"
        );
        drop(ctx);

        let mut ctx = OpContext::new(Mailbox(1), &alloc, &transport, &mut counter);
        assert_eq!(
            op.update_target(completion(NetOpKind::Put, Ok(())), &mut ctx),
            WaitingType::DoneAndDestroy
        );
        assert_eq!(ctx.into_actions().len(), 1);
        assert_eq!(op.state_name(), "done");
        assert_eq!(alloc.stats().live_allocations, 0);
    }

    #[test]
    fn target_rejects_request_without_buffer() {
        let alloc = allocator();
        let transport = RecordingTransport::default();
        let mut op = RdmaPingOp::create_as_target(CreateAsTarget);
        let request = OpMessage {
            op_id: RdmaPingOp::OP_ID,
            src_node: NodeId(2),
            src_mailbox: Mailbox(5),
            dst_mailbox: Mailbox::NONE,
            flags: 0,
            body: Bytes::new(),
            remote: None,
        };
        let mut counter = 0;
        let mut ctx = OpContext::new(Mailbox(1), &alloc, &transport, &mut counter);
        assert_eq!(
            op.update_target(OpEvent::Message(request), &mut ctx),
            WaitingType::Error
        );
        let actions = ctx.into_actions();
        assert_eq!(actions.len(), 1);
    }

    #[tokio::test]
    async fn origin_reads_transformed_buffer_on_ack() {
        let alloc = allocator();
        let transport = RecordingTransport::default();
        let (mut op, future) =
            RdmaPingOp::new(&alloc, PeerHandle::new(NodeId(2)), "this is the ping message")
                .unwrap();
        let mut counter = 0;

        let mut ctx = OpContext::new(Mailbox(1), &alloc, &transport, &mut counter);
        op.update_origin(OpEvent::Start, &mut ctx);
        drop(ctx);

        op.buffer
            .as_ref()
            .unwrap()
            .with_data_mut(<[u8]>::make_ascii_uppercase)
            .unwrap();

        let ack = OpMessage {
            op_id: RdmaPingOp::OP_ID,
            src_node: NodeId(2),
            src_mailbox: Mailbox(5),
            dst_mailbox: Mailbox(1),
            flags: 0,
            body: Bytes::new(),
            remote: None,
        };
        let mut ctx = OpContext::new(Mailbox(1), &alloc, &transport, &mut counter);
        assert_eq!(
            op.update_origin(OpEvent::Message(ack), &mut ctx),
            WaitingType::DoneAndDestroy
        );
        assert_eq!(future.await, Ok("THIS IS THE PING MESSAGE".to_string()));
    }
}
