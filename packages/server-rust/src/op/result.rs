//! One-shot handoff of an operation's result to whoever launched it.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use super::OpError;

/// Errors from the producing side of a result channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResultChannelError {
    #[error("result was already fulfilled")]
    AlreadyFulfilled,
}

/// Creates a connected promise/future pair.
#[must_use]
pub fn result_channel<T>() -> (ResultPromise<T>, ResultFuture<T>) {
    let (tx, rx) = oneshot::channel();
    (ResultPromise { tx: Some(tx) }, ResultFuture { rx })
}

/// Producer half, owned by the operation.
#[derive(Debug)]
pub struct ResultPromise<T> {
    tx: Option<oneshot::Sender<Result<T, OpError>>>,
}

impl<T> ResultPromise<T> {
    /// Publishes the result.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyFulfilled` on any call after the first.
    pub fn try_fulfill(&mut self, result: Result<T, OpError>) -> Result<(), ResultChannelError> {
        let tx = self.tx.take().ok_or(ResultChannelError::AlreadyFulfilled)?;
        if tx.send(result).is_err() {
            tracing::debug!("result consumer dropped before fulfillment");
        }
        Ok(())
    }

    /// Publishes the result.
    ///
    /// # Panics
    ///
    /// Panics if the promise was already fulfilled.
    pub fn fulfill(&mut self, result: Result<T, OpError>) {
        if self.try_fulfill(result).is_err() {
            panic!("result promise fulfilled twice");
        }
    }

    /// Shorthand for `fulfill(Ok(value))`. Panics like `fulfill`.
    pub fn succeed(&mut self, value: T) {
        self.fulfill(Ok(value));
    }

    /// Shorthand for `fulfill(Err(error))`. Panics like `fulfill`.
    pub fn fail(&mut self, error: OpError) {
        self.fulfill(Err(error));
    }

    /// Whether `fulfill` already ran.
    #[must_use]
    pub fn is_fulfilled(&self) -> bool {
        self.tx.is_none()
    }
}

/// Consumer half, held by the launcher. Resolves exactly once.
///
/// If the operation is destroyed without fulfilling, resolves to
/// `OpError::Abandoned`.
#[derive(Debug)]
pub struct ResultFuture<T> {
    rx: oneshot::Receiver<Result<T, OpError>>,
}

impl<T> ResultFuture<T> {
    /// Blocks the current thread until the result arrives. Must not be called
    /// from inside an async runtime.
    ///
    /// # Errors
    ///
    /// Returns the operation's failure, or `Abandoned`.
    pub fn blocking_wait(self) -> Result<T, OpError> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(OpError::Abandoned))
    }

    /// Takes the result if it is already available.
    pub fn try_take(&mut self) -> Option<Result<T, OpError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(OpError::Abandoned)),
        }
    }
}

impl<T> Future for ResultFuture<T> {
    type Output = Result<T, OpError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(OpError::Abandoned)))
    }
}
