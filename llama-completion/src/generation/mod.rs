//! # Completion Controller
//!
//! A [`CompletionContext`] owns an inference backend together with the token
//! buffer that mirrors the backend's KV cache. Each call to
//! [`CompletionContext::complete`] runs one generation session:
//!
//! 1. the sampling parameters are validated and applied to the sampler;
//! 2. the prompt is tokenized, fitted to the context window and evaluated,
//!    reusing whatever prefix the cache already holds;
//! 3. tokens are sampled one at a time and appended to the generated text,
//!    and the [`StreamingEmitter`](crate::streaming::StreamingEmitter) decides
//!    what is safe to hand to the sink;
//! 4. the run ends on EOS, a stop string, the token budget or an interrupt,
//!    and a [`CompletionResult`](crate::types::CompletionResult) is assembled.
//!
//! ## Usage
//!
//! ```rust
//! use llama_completion::backend::ScriptedBackend;
//! use llama_completion::generation::{CompletionContext, ContextConfig};
//! use llama_completion::types::{PartialCompletion, SamplingParameters};
//!
//! let backend = ScriptedBackend::from_pieces(&["Count", ":", " 1", " 2", "\n", " done"])
//!     .with_script_text(" 2\n\n done")
//!     .unwrap();
//! let mut context = CompletionContext::new(Box::new(backend), ContextConfig::new(64)).unwrap();
//!
//! let params = SamplingParameters::default().with_stop(["\n\n"]);
//! let mut streamed = String::new();
//! let result = context
//!     .complete("Count: 1", &params, &mut |chunk: PartialCompletion| {
//!         streamed.push_str(&chunk.token)
//!     })
//!     .unwrap();
//!
//! assert_eq!(streamed, " 2");
//! assert_eq!(result.stopping_word(), Some("\n\n"));
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod prompt;


pub use config::ContextConfig;
pub use controller::{CompletionContext, LoadedSession};
pub use error::CompletionError;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Cooperative interrupt for the run currently executing on a context.
///
/// Cloning shares the handle. Each run arms a fresh token, so an interrupt
/// only affects the run in flight; one raised while the context is idle is
/// discarded when the next run starts. The generation loop checks the token
/// at the top of every iteration and between prompt batches.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running generation to stop.
    pub fn interrupt(&self) {
        self.lock().cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.lock().is_cancelled()
    }

    /// Arm a fresh token for a new run and return it.
    pub(crate) fn rearm(&self) -> CancellationToken {
        let mut current = self.lock();
        *current = CancellationToken::new();
        current.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared "a run is in flight" flag, readable without locking the context.
#[derive(Debug, Clone, Default)]
pub struct PredictingFlag(Arc<AtomicBool>);

impl PredictingFlag {
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Raise the flag until the returned guard is dropped.
    pub(crate) fn raise(&self) -> PredictingGuard {
        self.0.store(true, Ordering::Release);
        PredictingGuard(self.0.clone())
    }
}

pub(crate) struct PredictingGuard(Arc<AtomicBool>);

impl Drop for PredictingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
