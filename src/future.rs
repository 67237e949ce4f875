//! Future type for asynchronous read results.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;

use crate::error::{CacheError, CacheResult};

/// Completion side of a [`ReadFuture`].
pub(crate) struct ReadPromise {
    sender: oneshot::Sender<CacheResult<u64>>,
}

impl ReadPromise {
    /// Completes the paired future. Silently ignores an already-dropped
    /// receiver: an abandoned future is not an error.
    pub(crate) fn complete(self, result: CacheResult<u64>) {
        let _ = self.sender.send(result);
    }
}

/// Future resolving to the number of bytes a cache read produced.
///
/// Dropping the future abandons the operation; in-flight work completes and
/// releases its resources through reference counting. If the producing side
/// goes away without completing, the future resolves to
/// [`CacheError::Canceled`].
#[derive(Debug)]
pub struct ReadFuture {
    receiver: oneshot::Receiver<CacheResult<u64>>,
}

impl ReadFuture {
    /// Creates a connected promise/future pair.
    pub(crate) fn channel() -> (ReadPromise, ReadFuture) {
        let (sender, receiver) = oneshot::channel();
        (ReadPromise { sender }, ReadFuture { receiver })
    }

    /// Creates a future that is already resolved.
    pub(crate) fn ready(result: CacheResult<u64>) -> ReadFuture {
        let (promise, future) = Self::channel();
        promise.complete(result);
        future
    }
}

impl Future for ReadFuture {
    type Output = CacheResult<u64>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(CacheError::Canceled)),
            Poll::Pending => Poll::Pending,
        }
    }
}
