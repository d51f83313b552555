//! Engine boundary: the tokenizer and sampler/model services the controller
//! drives.
//!
//! The controller never looks inside the engine. Everything it needs (token
//! conversion, prompt evaluation, sampling and KV-cache maintenance) goes
//! through [`Tokenizer`] and [`InferenceBackend`]. [`ScriptedBackend`] replays
//! a recorded vocabulary and token script for tests and the CLI.

use crate::metrics::TimingCounters;
use crate::types::{SamplerConfig, TokenId, TokenProbability};
use llama_common::{ErrorCategory, LlamaError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod scripted;

pub use scripted::{
    BackendProbe, BackendRecord, ScriptStep, ScriptedBackend, ScriptedFixture, VocabEntry,
    SCRIPTED_EMBEDDING_SIZE,
};

/// Failures reported by the engine.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Unknown token id {0}")]
    UnknownToken(TokenId),

    #[error("Sampler configuration rejected: {0}")]
    Configuration(String),

    #[error("Grammar could not be loaded: {0}")]
    Grammar(String),

    #[error("Evaluation failed at position {position}: {message}")]
    Evaluation { position: usize, message: String },

    #[error("Sampling failed: {0}")]
    Sampling(String),

    #[error("Engine state could not be restored: {0}")]
    State(String),

    #[error("Embedding unavailable: {0}")]
    Embedding(String),

    #[error("Failed to read fixture {path}: {message}")]
    Fixture { path: String, message: String },
}

impl BackendError {
    pub fn evaluation<E: std::fmt::Display>(position: usize, err: E) -> Self {
        Self::Evaluation {
            position,
            message: err.to_string(),
        }
    }

    /// Whether the failure concerns the caller's sampler setup rather than
    /// the engine itself.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BackendError::Configuration(_) | BackendError::Grammar(_)
        )
    }
}

impl LlamaError for BackendError {
    fn category(&self) -> ErrorCategory {
        match self {
            BackendError::Configuration(_) | BackendError::Grammar(_) => ErrorCategory::User,
            BackendError::Fixture { .. } => ErrorCategory::System,
            _ => ErrorCategory::Engine,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            BackendError::Tokenization(_) => "BACKEND_TOKENIZATION",
            BackendError::UnknownToken(_) => "BACKEND_UNKNOWN_TOKEN",
            BackendError::Configuration(_) => "BACKEND_CONFIGURATION",
            BackendError::Grammar(_) => "BACKEND_GRAMMAR",
            BackendError::Evaluation { .. } => "BACKEND_EVALUATION",
            BackendError::Sampling(_) => "BACKEND_SAMPLING",
            BackendError::State(_) => "BACKEND_STATE",
            BackendError::Embedding(_) => "BACKEND_EMBEDDING",
            BackendError::Fixture { .. } => "BACKEND_FIXTURE",
        }
    }
}

/// Token conversion services.
pub trait Tokenizer {
    /// Convert text to tokens, optionally adding the model's special tokens.
    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>, BackendError>;

    /// Convert tokens back to text.
    fn detokenize(&self, tokens: &[TokenId]) -> Result<String, BackendError>;

    /// Raw bytes of one token. A piece may be a fragment of a multi-byte
    /// character.
    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, BackendError>;
}

/// A token chosen by the sampler together with its top candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledToken {
    pub token: TokenId,
    pub candidates: Vec<TokenProbability>,
}

/// Static model facts reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub description: String,
    pub size_bytes: u64,
    pub n_params: u64,
    pub n_vocab: usize,
    pub eos_token: TokenId,
}

/// Sampler and model services for one inference context.
///
/// Implementations own the KV cache; the controller tells them which
/// positions to keep, drop or shift. Methods are called from a single thread
/// at a time.
pub trait InferenceBackend: Tokenizer + Send {
    fn model_info(&self) -> ModelInfo;

    /// Apply the resolved sampler configuration for the next run.
    fn configure(&mut self, config: &SamplerConfig) -> Result<(), BackendError>;

    /// Evaluate `tokens`, placing the first one at position `n_past`.
    fn evaluate(&mut self, tokens: &[TokenId], n_past: usize) -> Result<(), BackendError>;

    /// Sample the next token and accept it into the sampler's history.
    /// `None` means no token was produced this step.
    fn sample(&mut self, n_probs: usize) -> Result<Option<SampledToken>, BackendError>;

    /// Drop cache entries at positions `from..`.
    fn truncate_cache(&mut self, from: usize);

    /// Remove `discard` cache entries starting at `keep` and move the entries
    /// up to `n_past` down to close the gap.
    fn shift_cache(&mut self, keep: usize, discard: usize, n_past: usize);

    fn clear_cache(&mut self) {
        self.truncate_cache(0);
    }

    /// Evaluate `token` at position `pos` for `n_sequences` parallel
    /// sequences. Used by the benchmark.
    fn evaluate_parallel(
        &mut self,
        token: TokenId,
        pos: usize,
        n_sequences: usize,
    ) -> Result<(), BackendError> {
        for _ in 0..n_sequences {
            self.evaluate(&[token], pos)?;
        }
        Ok(())
    }

    /// Engine-side timing counters, when the engine keeps them.
    fn timings(&self) -> Option<TimingCounters> {
        None
    }

    fn reset_timings(&mut self) {}

    /// Embedding vector for the sequence currently in the cache.
    fn embedding(&self) -> Result<Vec<f32>, BackendError> {
        Err(BackendError::Embedding(
            "engine does not produce embeddings".to_string(),
        ))
    }

    /// Opaque engine state stored alongside a saved session.
    fn state_snapshot(&self) -> Vec<u8> {
        Vec::new()
    }

    fn restore_state(&mut self, _state: &[u8]) -> Result<(), BackendError> {
        Ok(())
    }
}
