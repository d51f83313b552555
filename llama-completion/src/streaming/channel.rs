//! Channel-backed sink and the async stream built on it.

use super::sink::{CompletionSink, SinkClosed};
use crate::generation::{CompletionContext, CompletionError};
use crate::types::{CompletionResult, PartialCompletion, SamplingParameters};
use futures::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex, TryLockError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Item carried by a completion stream.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionEvent {
    /// Text that became safe to deliver.
    Partial(PartialCompletion),
    /// The run finished. Always the last item of a successful stream.
    Finished(Box<CompletionResult>),
}

pub type CompletionStream =
    Pin<Box<dyn Stream<Item = Result<CompletionEvent, CompletionError>> + Send>>;

/// Sink that forwards deliveries into a bounded channel.
///
/// Sends block while the channel is full, so a slow consumer slows
/// generation down instead of buffering without bound. Must be driven from
/// a thread outside the async runtime, such as a `spawn_blocking` task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<Result<CompletionEvent, CompletionError>>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<Result<CompletionEvent, CompletionError>>) -> Self {
        Self { sender }
    }

    /// Create a sink and the receiver for its deliveries.
    pub fn channel(
        buffer: usize,
    ) -> (
        Self,
        mpsc::Receiver<Result<CompletionEvent, CompletionError>>,
    ) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self::new(sender), receiver)
    }

    fn send(&self, item: Result<CompletionEvent, CompletionError>) -> Result<(), SinkClosed> {
        self.sender.blocking_send(item).map_err(|_| SinkClosed)
    }
}

impl CompletionSink for ChannelSink {
    fn deliver(&mut self, chunk: PartialCompletion) -> Result<(), SinkClosed> {
        self.send(Ok(CompletionEvent::Partial(chunk)))
    }
}

/// Run a completion on a blocking worker and stream its deliveries.
///
/// The stream yields each delivery, then either `Finished` with the result or
/// the error that ended the run. A context that is already generating yields
/// a single `Busy` error. Must be called from within a Tokio runtime.
pub fn stream_completion(
    context: Arc<Mutex<CompletionContext>>,
    prompt: String,
    params: SamplingParameters,
    buffer: usize,
) -> CompletionStream {
    let (mut sink, receiver) = ChannelSink::channel(buffer);
    let watcher = sink.sender.clone();

    let worker = tokio::task::spawn_blocking(move || {
        let mut guard = match context.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                let _ = sink.send(Err(CompletionError::Busy));
                return;
            }
        };

        let outcome = guard.complete(&prompt, &params, &mut sink);
        drop(guard);

        let last = outcome.map(|result| CompletionEvent::Finished(Box::new(result)));
        if sink.send(last).is_err() {
            warn!("Stream receiver disconnected before the result was sent");
        } else {
            debug!("Completion stream finished");
        }
    });

    // A panicking worker drops its sender without a final item
    tokio::spawn(async move {
        if let Err(e) = worker.await {
            warn!("Completion worker failed: {}", e);
            let _ = watcher.send(Err(CompletionError::Worker(e.to_string()))).await;
        }
    });

    Box::pin(ReceiverStream::new(receiver))
}
