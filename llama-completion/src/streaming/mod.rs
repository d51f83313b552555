//! Streaming delivery of generated text.
//!
//! The [`StreamingEmitter`] decides what is safe to send; sinks decide where
//! it goes. Three delivery styles are offered:
//!
//! - a synchronous [`CompletionSink`] (closures implement it) invoked on the
//!   generating thread;
//! - a [`ChannelSink`] forwarding into a bounded Tokio channel;
//! - an async [`CompletionStream`] backed by that channel, from
//!   [`stream_completion`].

pub mod channel;
pub mod emitter;
pub mod probability_window;
pub mod sink;

pub use channel::{stream_completion, ChannelSink, CompletionEvent, CompletionStream};
pub use emitter::{Emission, StreamingEmitter};
pub use probability_window::{probability_window, render_piece, render_window};
pub use sink::{CompletionSink, NullSink, SinkClosed};
