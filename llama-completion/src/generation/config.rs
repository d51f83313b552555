//! Context window configuration.

use crate::types::ParameterError;
use llama_common::ValidatedConfig;
use serde::{Deserialize, Serialize};

/// Smallest context window accepted. Prompt fitting keeps at least four
/// positions free after the kept prefix.
pub const MIN_CONTEXT_SIZE: usize = 8;

/// Settings that stay fixed for the lifetime of a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Context window size in tokens.
    pub n_ctx: usize,
    /// Maximum tokens per evaluate call.
    pub n_batch: usize,
    /// Prompt tokens preserved when the window overflows. `-1` keeps the
    /// whole prompt.
    pub n_keep: i32,
    /// Whether the context answers embedding requests.
    pub embedding: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            n_ctx: 512,
            n_batch: 512,
            n_keep: -1,
            embedding: false,
        }
    }
}

impl ContextConfig {
    pub fn new(n_ctx: usize) -> Self {
        Self {
            n_ctx,
            ..Default::default()
        }
    }

    pub fn with_n_batch(mut self, n_batch: usize) -> Self {
        self.n_batch = n_batch;
        self
    }

    pub fn with_n_keep(mut self, n_keep: i32) -> Self {
        self.n_keep = n_keep;
        self
    }

    pub fn with_embedding(mut self, embedding: bool) -> Self {
        self.embedding = embedding;
        self
    }
}

impl ValidatedConfig for ContextConfig {
    type Error = ParameterError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.n_ctx < MIN_CONTEXT_SIZE {
            return Err(ParameterError::new(
                "n_ctx",
                format!(
                    "must be at least {}, got {}",
                    MIN_CONTEXT_SIZE, self.n_ctx
                ),
            ));
        }
        if self.n_ctx > u32::MAX as usize {
            return Err(ParameterError::new("n_ctx", "must fit in 32 bits"));
        }
        if self.n_batch == 0 {
            return Err(ParameterError::new("n_batch", "must be greater than 0"));
        }
        if self.n_keep < -1 {
            return Err(ParameterError::new(
                "n_keep",
                format!("must be -1 or greater, got {}", self.n_keep),
            ));
        }
        Ok(())
    }

    fn merge_with_defaults(self, defaults: Self) -> Self {
        let builtin = Self::default();
        Self {
            n_ctx: if self.n_ctx != builtin.n_ctx {
                self.n_ctx
            } else {
                defaults.n_ctx
            },
            n_batch: if self.n_batch != builtin.n_batch {
                self.n_batch
            } else {
                defaults.n_batch
            },
            n_keep: if self.n_keep != builtin.n_keep {
                self.n_keep
            } else {
                defaults.n_keep
            },
            embedding: self.embedding || defaults.embedding,
        }
    }

    fn description() -> &'static str {
        "Context window size, evaluation batch size, kept prompt prefix and embedding mode"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llama_common::DefaultConfig;
    use rstest::rstest;

    #[test]
    fn test_default_context_config() {
        let config = ContextConfig::validated_default().unwrap();
        assert_eq!(config.n_ctx, 512);
        assert_eq!(config.n_batch, 512);
        assert_eq!(config.n_keep, -1);
        assert!(!config.embedding);
    }

    #[rstest]
    #[case(ContextConfig::new(4), "n_ctx")]
    #[case(ContextConfig::new(64).with_n_batch(0), "n_batch")]
    #[case(ContextConfig::new(64).with_n_keep(-3), "n_keep")]
    fn test_invalid_context_config(#[case] config: ContextConfig, #[case] field: &str) {
        assert_eq!(config.validate().unwrap_err().field, field);
    }

    #[test]
    fn test_merge_with_defaults() {
        let merged = ContextConfig::new(2048).merge_with_defaults(ContextConfig {
            n_ctx: 1024,
            n_batch: 64,
            n_keep: 4,
            embedding: true,
        });
        assert_eq!(merged.n_ctx, 2048);
        assert_eq!(merged.n_batch, 64);
        assert_eq!(merged.n_keep, 4);
        assert!(merged.embedding);
    }
}
