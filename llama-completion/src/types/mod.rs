//! Core types shared across the completion controller.

pub mod completion;
pub mod ids;
pub mod sampling;
pub mod session;

pub use completion::{
    CandidateView, CompletionResult, CompletionTokenOutput, PartialCompletion, StopReason,
    TokenProbability, TokenProbabilityView,
};
pub use ids::ContextId;
pub use sampling::{LogitBias, LogitBiasEntry, ParameterError, SamplerConfig, SamplingParameters};
pub use session::{GenerationSession, GenerationState};

/// Vocabulary index of a token.
pub type TokenId = i32;
