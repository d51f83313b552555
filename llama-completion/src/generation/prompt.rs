//! Fitting a tokenized prompt into the context window.

use crate::types::TokenId;
use tracing::debug;

/// A prompt after it has been fitted to the context window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FittedPrompt {
    pub tokens: Vec<TokenId>,
    /// Number of leading tokens preserved on overflow.
    pub n_keep: usize,
    pub truncated: bool,
}

/// Fit `tokens` into a window of `n_ctx` tokens.
///
/// A negative `n_keep` keeps the whole prompt; the kept prefix is clamped to
/// `n_ctx - 4`. When the prompt does not fit, whole blocks of half the
/// remaining window are erased right after the kept prefix.
pub fn fit_prompt(tokens: Vec<TokenId>, n_ctx: usize, n_keep: i32) -> FittedPrompt {
    let len = tokens.len();
    let requested = usize::try_from(n_keep).unwrap_or(len);
    let n_keep = requested.min(n_ctx.saturating_sub(4));

    if len < n_ctx {
        return FittedPrompt {
            tokens,
            n_keep,
            truncated: false,
        };
    }

    let n_left = (n_ctx - n_keep) / 2;
    let erased_blocks = (len - n_keep - n_left - 1) / n_left;
    let resume = n_keep + erased_blocks * n_left;

    let mut fitted = Vec::with_capacity(len - erased_blocks * n_left);
    fitted.extend_from_slice(&tokens[..n_keep]);
    fitted.extend_from_slice(&tokens[resume..]);

    debug!(
        n_ctx,
        n_keep,
        n_left,
        original = len,
        fitted = fitted.len(),
        "prompt truncated to fit context window"
    );

    FittedPrompt {
        tokens: fitted,
        n_keep,
        truncated: true,
    }
}

/// Length of the shared prefix of two token sequences.
pub fn common_prefix(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Cache position from which `prompt` must be evaluated, given what the
/// context already holds. At least the last prompt token is always
/// re-evaluated so the sampler has fresh logits.
pub fn reuse_point(previous: &[TokenId], prompt: &[TokenId]) -> usize {
    let shared = common_prefix(previous, prompt);
    if shared == prompt.len() {
        shared.saturating_sub(1)
    } else {
        shared
    }
}
