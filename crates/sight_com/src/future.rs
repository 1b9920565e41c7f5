//! Futures returned by asynchronous worker tasks and slot calls.
//!
//! Waiting on one of these is the only blocking point of the signal/slot
//! layer. `wait()` blocks the calling thread and must not be used from inside
//! an async runtime; `.await` them there instead.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::{ComError, ComResult};

enum State<R> {
    Ready(Option<R>),
    Pending(oneshot::Receiver<R>),
}

/// Result of a task posted on a worker.
pub struct TaskFuture<R> {
    state: State<R>,
}

impl<R> TaskFuture<R> {
    /// A future that is already resolved
    pub fn ready(value: R) -> Self {
        Self {
            state: State::Ready(Some(value)),
        }
    }

    pub(crate) fn pending(rx: oneshot::Receiver<R>) -> Self {
        Self {
            state: State::Pending(rx),
        }
    }

    /// Block until the task has run.
    ///
    /// Resolves to `ComError::TaskAborted` if the task was dropped without
    /// running (worker stopped, task panicked).
    pub fn wait(self) -> ComResult<R> {
        match self.state {
            State::Ready(Some(value)) => Ok(value),
            State::Ready(None) => Err(ComError::TaskAborted),
            State::Pending(rx) => rx.blocking_recv().map_err(|_| ComError::TaskAborted),
        }
    }
}

impl<R> Unpin for TaskFuture<R> {}

impl<R> Future for TaskFuture<R> {
    type Output = ComResult<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            State::Ready(value) => Poll::Ready(value.take().ok_or(ComError::TaskAborted)),
            State::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.map_err(|_| ComError::TaskAborted)),
        }
    }
}

impl<R> std::fmt::Debug for TaskFuture<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Ready(Some(_)) => "ready",
            State::Ready(None) => "taken",
            State::Pending(_) => "pending",
        };
        f.debug_struct("TaskFuture").field("state", &state).finish()
    }
}

/// Result of an asynchronous slot call.
///
/// Flattens the slot's own failure (owner dropped) with the task failure.
#[derive(Debug)]
pub struct SlotFuture<R>(TaskFuture<ComResult<R>>);

impl<R> SlotFuture<R> {
    pub fn ready(result: ComResult<R>) -> Self {
        Self(TaskFuture::ready(result))
    }

    pub(crate) fn from_task(task: TaskFuture<ComResult<R>>) -> Self {
        Self(task)
    }

    /// Block until the slot has run on its worker
    pub fn wait(self) -> ComResult<R> {
        self.0.wait().and_then(|result| result)
    }
}

impl<R> Future for SlotFuture<R> {
    type Output = ComResult<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().0)
            .poll(cx)
            .map(|result| result.and_then(|inner| inner))
    }
}
