//! # Llama Completion
//!
//! Streaming text-generation controller for a local inference context.
//!
//! Given a prompt and [`SamplingParameters`], a [`CompletionContext`] samples
//! tokens one at a time, stops on end-of-sequence, a stop string or the
//! token budget, and hands newly generated text to a sink while withholding
//! text that might still turn into a stop string. The context's token buffer
//! can be saved to and restored from disk.
//!
//! The model itself sits behind the [`backend::InferenceBackend`] trait.
//! [`backend::ScriptedBackend`] replays a recorded vocabulary and token
//! script, which is what the tests and the `llama-complete` binary use.

pub mod backend;
pub mod bench;
pub mod config;
pub mod generation;
pub mod metrics;
pub mod registry;
pub mod stopper;
pub mod storage;
pub mod streaming;
pub mod types;

pub use backend::{BackendError, InferenceBackend, ScriptedBackend, Tokenizer};
pub use bench::{BenchReport, BenchRequest};
pub use config::{CompletionConfig, ConfigError};
pub use generation::{
    CompletionContext, CompletionError, ContextConfig, InterruptHandle, LoadedSession,
};
pub use metrics::{RunMetrics, TimingCounters};
pub use registry::ContextRegistry;
pub use storage::{PersistedSession, SessionError, SessionStore};
pub use streaming::{
    stream_completion, ChannelSink, CompletionEvent, CompletionSink, CompletionStream, NullSink,
};
pub use types::{
    CompletionResult, ContextId, GenerationState, PartialCompletion, SamplingParameters,
    StopReason, TokenId,
};
