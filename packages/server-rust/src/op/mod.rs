//! Operations: the state-machine contract, the type registry, the result
//! channel, and the bundled protocols.

pub mod operation;
pub mod protocols;
pub mod registry;
pub mod result;

pub use operation::{
    ActionId, CreateAsTarget, InvariantViolation, NetOpKind, Op, OpContext, OpEvent,
    RegisteredOp, Role, WaitingType,
};
pub use registry::{OpFactory, OpRegistration, OpRegistry, RegistryError};
pub use result::{result_channel, ResultChannelError, ResultFuture, ResultPromise};

use opflow_core::BufferError;

use crate::traits::TransportError;

/// Why an operation failed, as seen by the launcher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("operation timed out")]
    TimedOut,
    #[error("remote side rejected the operation: {0}")]
    Rejected(String),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("operation was destroyed before producing a result")]
    Abandoned,
    #[error("protocol violation: {0}")]
    Protocol(String),
}
