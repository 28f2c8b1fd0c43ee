//! Completion handle for non-blocking runs.

use crate::error::{Result, RuntimeError};
use futures::channel::oneshot;
use lumen_core::{DeviceError, StreamId};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

/// Future resolving when every stream of a request has finished.
///
/// Resolves to the request's first deferred device fault, if any. Dropping
/// the handle does not cancel the device work.
#[derive(Debug)]
#[must_use = "a RunHandle reports device faults only when awaited"]
pub struct RunHandle {
    receiver: oneshot::Receiver<Result<()>>,
}

impl RunHandle {
    /// Block the current thread until the request completes.
    pub fn wait(self) -> Result<()> {
        pollster::block_on(self)
    }
}

impl Future for RunHandle {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(RuntimeError::Device(
                DeviceError::Lost("completion callback dropped before it ran".to_string()),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Shared state collecting per-stream completions of one request.
struct Pending {
    remaining: usize,
    fault: Option<DeviceError>,
    sender: Option<oneshot::Sender<Result<()>>>,
}

impl Pending {
    fn complete(&mut self, stream: StreamId, status: std::result::Result<(), DeviceError>) {
        if let Err(error) = status {
            tracing::trace!(stream = stream.0, error = %error, "stream completed with fault");
            // Keep the fault of the earliest operation.
            let earlier = match (&self.fault, error.tag()) {
                (None, _) => true,
                (Some(current), Some(tag)) => current.tag().map_or(true, |t| tag < t),
                (Some(_), None) => false,
            };
            if earlier {
                self.fault = Some(error);
            }
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            let result = match self.fault.take() {
                Some(error) => Err(RuntimeError::device_fault(error)),
                None => Ok(()),
            };
            if let Some(sender) = self.sender.take() {
                let _ = sender.send(result);
            }
        }
    }
}

/// Builds the per-stream completion callbacks of a `RunHandle`.
pub(crate) struct CompletionSet {
    pending: Arc<Mutex<Pending>>,
}

impl CompletionSet {
    /// Create a handle that resolves after `streams` completions.
    pub fn new(streams: usize) -> (Self, RunHandle) {
        let (sender, receiver) = oneshot::channel();
        let pending = Pending {
            remaining: streams,
            fault: None,
            sender: Some(sender),
        };
        (
            Self {
                pending: Arc::new(Mutex::new(pending)),
            },
            RunHandle { receiver },
        )
    }

    /// Completion callback for `stream`.
    pub fn callback(&self, stream: StreamId) -> lumen_core::Completion {
        let pending = Arc::clone(&self.pending);
        Box::new(move |status| {
            let mut pending = pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            pending.complete(stream, status);
        })
    }
}
