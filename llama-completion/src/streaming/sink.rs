//! Synchronous delivery target for streamed text.

use crate::types::PartialCompletion;
use thiserror::Error;

/// The consumer behind a sink has gone away. Generation stops at the next
/// iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("completion sink closed")]
pub struct SinkClosed;

/// Receives each delivery in generation order, on the generating thread.
///
/// Closures taking a [`PartialCompletion`] implement this trait.
pub trait CompletionSink {
    fn deliver(&mut self, chunk: PartialCompletion) -> Result<(), SinkClosed>;
}

impl<F> CompletionSink for F
where
    F: FnMut(PartialCompletion),
{
    fn deliver(&mut self, chunk: PartialCompletion) -> Result<(), SinkClosed> {
        self(chunk);
        Ok(())
    }
}

/// Sink that discards every delivery.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl CompletionSink for NullSink {
    fn deliver(&mut self, _chunk: PartialCompletion) -> Result<(), SinkClosed> {
        Ok(())
    }
}
