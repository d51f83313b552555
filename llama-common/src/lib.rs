//! # Llama Common
//!
//! Shared types, traits, and utilities for the llama-completion workspace.
//! Error categorisation, validated configuration and logging helpers live here
//! so the library and the CLI report problems the same way.

pub mod config;
pub mod error;
pub mod logging;

// Re-export main traits for convenience
pub use config::{DefaultConfig, ValidatedConfig};
pub use error::{ErrorCategory, LlamaError};
pub use logging::{init_tracing, Pretty};
