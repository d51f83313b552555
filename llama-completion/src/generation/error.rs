//! Error types for completion runs and context management.

use crate::backend::BackendError;
use crate::storage::SessionError;
use crate::types::{ContextId, ParameterError};
use llama_common::{ErrorCategory, LlamaError};
use thiserror::Error;

/// Errors that can occur while running or managing a completion context.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// Sampling or context parameters were rejected before generation.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The prompt could not be prepared for generation.
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// The engine failed mid-run.
    #[error(transparent)]
    Backend(BackendError),

    /// The context is already generating.
    #[error("Context is busy")]
    Busy,

    #[error("Context not found: {0}")]
    ContextNotFound(ContextId),

    #[error("Context limit reached ({limit} contexts)")]
    ContextLimit { limit: usize },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Invalid benchmark request: {0}")]
    InvalidBenchmark(String),

    /// The background task driving a stream failed.
    #[error("Completion worker failed: {0}")]
    Worker(String),
}

impl CompletionError {
    pub fn configuration<E: std::fmt::Display>(err: E) -> Self {
        Self::Configuration(err.to_string())
    }

    pub fn initialization<E: std::fmt::Display>(err: E) -> Self {
        Self::Initialization(err.to_string())
    }
}

impl From<ParameterError> for CompletionError {
    fn from(err: ParameterError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<BackendError> for CompletionError {
    fn from(err: BackendError) -> Self {
        if err.is_configuration() {
            Self::Configuration(err.to_string())
        } else {
            Self::Backend(err)
        }
    }
}

impl LlamaError for CompletionError {
    fn category(&self) -> ErrorCategory {
        match self {
            CompletionError::Configuration(_)
            | CompletionError::Initialization(_)
            | CompletionError::Busy
            | CompletionError::ContextNotFound(_)
            | CompletionError::ContextLimit { .. }
            | CompletionError::InvalidBenchmark(_) => ErrorCategory::User,
            CompletionError::Backend(err) => err.category(),
            CompletionError::Session(err) => err.category(),
            CompletionError::Worker(_) => ErrorCategory::Internal,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            CompletionError::Configuration(_) => "COMPLETION_CONFIG",
            CompletionError::Initialization(_) => "COMPLETION_INIT",
            CompletionError::Backend(err) => err.error_code(),
            CompletionError::Busy => "COMPLETION_BUSY",
            CompletionError::ContextNotFound(_) => "COMPLETION_CONTEXT_NOT_FOUND",
            CompletionError::ContextLimit { .. } => "COMPLETION_CONTEXT_LIMIT",
            CompletionError::Session(err) => err.error_code(),
            CompletionError::InvalidBenchmark(_) => "COMPLETION_BENCH",
            CompletionError::Worker(_) => "COMPLETION_WORKER",
        }
    }
}
