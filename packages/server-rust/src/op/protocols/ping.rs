//! Inline ping: the origin sends a short string, the target answers with the
//! same string upper-cased.

use std::time::Duration;

use bytes::Bytes;
use opflow_core::{Mailbox, OpTypeId, PeerHandle, FLAG_ERROR};

use crate::op::operation::{CreateAsTarget, Op, OpContext, OpEvent, RegisteredOp, WaitingType};
use crate::op::result::{result_channel, ResultFuture, ResultPromise};
use crate::op::OpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PingState {
    Start,
    WaitForReply,
    Done,
}

/// Ping over eager messages.
#[derive(Debug)]
pub struct PingOp {
    state: PingState,
    peer: Option<PeerHandle>,
    payload: Bytes,
    timeout: Option<Duration>,
    promise: Option<ResultPromise<String>>,
}

impl PingOp {
    /// Origin constructor. The future resolves to the target's reply.
    #[must_use]
    pub fn new(peer: PeerHandle, message: impl Into<String>) -> (Self, ResultFuture<String>) {
        let (promise, future) = result_channel();
        let op = Self {
            state: PingState::Start,
            peer: Some(peer),
            payload: Bytes::from(message.into()),
            timeout: None,
            promise: Some(promise),
        };
        (op, future)
    }

    /// Fails with `OpError::TimedOut` if no reply arrives within `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn waiting(&self) -> WaitingType {
        self.timeout
            .map_or(WaitingType::WaitOnMessage, WaitingType::WaitOnTimeout)
    }

    fn finish(&mut self, result: Result<String, OpError>) -> WaitingType {
        let failed = result.is_err();
        if let Some(mut promise) = self.promise.take() {
            promise.fulfill(result);
        }
        self.state = PingState::Done;
        if failed {
            WaitingType::Error
        } else {
            WaitingType::DoneAndDestroy
        }
    }
}

impl RegisteredOp for PingOp {
    const OP_ID: OpTypeId = OpTypeId::from_name("PingOp");
    const OP_NAME: &'static str = "PingOp";

    fn create_as_target(_marker: CreateAsTarget) -> Self {
        Self {
            state: PingState::Start,
            peer: None,
            payload: Bytes::new(),
            timeout: None,
            promise: None,
        }
    }
}

impl Op for PingOp {
    fn op_type_id(&self) -> OpTypeId {
        Self::OP_ID
    }

    fn op_type_name(&self) -> &'static str {
        Self::OP_NAME
    }

    fn update_origin(&mut self, event: OpEvent, ctx: &mut OpContext<'_>) -> WaitingType {
        match (self.state, event) {
            (PingState::Start, OpEvent::Start) => {
                let Some(peer) = self.peer else {
                    return self.finish(Err(OpError::Protocol("origin without a peer".into())));
                };
                let msg = ctx.new_message(Self::OP_ID, Mailbox::NONE, self.payload.clone());
                ctx.send(peer, msg);
                self.state = PingState::WaitForReply;
                self.waiting()
            }
            (PingState::WaitForReply, OpEvent::Message(msg)) => {
                let body = String::from_utf8_lossy(&msg.body).into_owned();
                if msg.is_error() {
                    self.finish(Err(OpError::Rejected(body)))
                } else {
                    self.finish(Ok(body))
                }
            }
            (
                _,
                OpEvent::Completion {
                    outcome: Err(e), ..
                },
            ) => self.finish(Err(OpError::Transport(e))),
            (PingState::WaitForReply, OpEvent::Timeout) => self.finish(Err(OpError::TimedOut)),
            (_, other) => {
                tracing::debug!(event = other.name(), "ping origin ignoring event");
                self.waiting()
            }
        }
    }

    fn update_target(&mut self, event: OpEvent, ctx: &mut OpContext<'_>) -> WaitingType {
        let OpEvent::Message(msg) = event else {
            return WaitingType::WaitOnMessage;
        };
        self.state = PingState::Done;
        let (body, flags, wait) = match std::str::from_utf8(&msg.body) {
            Ok(text) => (text.to_uppercase(), 0, WaitingType::DoneAndDestroy),
            Err(e) => (e.to_string(), FLAG_ERROR, WaitingType::Error),
        };
        if let Err(err) = ctx.reply(&msg, body, flags) {
            tracing::warn!(%err, "ping target cannot reach origin");
            return WaitingType::Error;
        }
        wait
    }

    fn state_name(&self) -> &'static str {
        match self.state {
            PingState::Start => "start",
            PingState::WaitForReply => "snd_wait_for_reply",
            PingState::Done => "done",
        }
    }
}
