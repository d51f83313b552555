//! Records produced while generating and the summary returned at run end.

use crate::metrics::RunMetrics;
use crate::types::TokenId;
use serde::{Deserialize, Serialize};

/// Probability the sampler assigned to one candidate token.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenProbability {
    pub token: TokenId,
    pub prob: f32,
}

/// One generated token plus its top candidates. Never mutated after it is
/// appended to the run's probability log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionTokenOutput {
    pub token: TokenId,
    pub probs: Vec<TokenProbability>,
}

/// A candidate rendered for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateView {
    pub tok_str: String,
    pub prob: f32,
}

/// A probability record rendered for delivery: the chosen token's text plus
/// its candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenProbabilityView {
    pub content: String,
    pub probs: Vec<CandidateView>,
}

/// One delivery to a streaming sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialCompletion {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_probabilities: Option<Vec<TokenProbabilityView>>,
}

impl PartialCompletion {
    pub fn text(&self) -> &str {
        &self.token
    }
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopReason {
    /// The model produced its end-of-sequence token.
    Eos,
    /// A stop string matched in full.
    Word { stopping_word: String },
    /// The generation budget ran out.
    Limit,
    /// The run was interrupted from outside.
    Interrupted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Eos => write!(f, "eos"),
            StopReason::Word { stopping_word } => write!(f, "word({:?})", stopping_word),
            StopReason::Limit => write!(f, "limit"),
            StopReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub text: String,
    pub completion_probabilities: Vec<TokenProbabilityView>,
    pub tokens_predicted: usize,
    pub tokens_evaluated: usize,
    pub tokens_cached: usize,
    pub truncated: bool,
    pub stop_reason: StopReason,
    pub timings: RunMetrics,
}

impl CompletionResult {
    pub fn stopped_eos(&self) -> bool {
        matches!(self.stop_reason, StopReason::Eos)
    }

    pub fn stopped_word(&self) -> bool {
        matches!(self.stop_reason, StopReason::Word { .. })
    }

    pub fn stopped_limit(&self) -> bool {
        matches!(self.stop_reason, StopReason::Limit)
    }

    pub fn interrupted(&self) -> bool {
        matches!(self.stop_reason, StopReason::Interrupted)
    }

    /// The stop string that ended the run, if any.
    pub fn stopping_word(&self) -> Option<&str> {
        match &self.stop_reason {
            StopReason::Word { stopping_word } => Some(stopping_word),
            _ => None,
        }
    }
}
