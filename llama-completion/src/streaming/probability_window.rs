//! Slicing and rendering of per-token probability records.

use crate::backend::{BackendError, Tokenizer};
use crate::types::{CandidateView, CompletionTokenOutput, TokenId, TokenProbabilityView};

/// Records covering `count` tokens starting at `from`, clipped to the log.
///
/// Never reads past the end of `log`; a short window is returned instead.
pub fn probability_window(
    log: &[CompletionTokenOutput],
    from: usize,
    count: usize,
) -> &[CompletionTokenOutput] {
    let start = from.min(log.len());
    let end = from.saturating_add(count).min(log.len());
    &log[start..end]
}

/// Text for one token piece. A lone byte that is not valid UTF-8 on its own
/// is shown as `byte: \xNN`.
pub fn render_piece(piece: &[u8]) -> String {
    match piece {
        [byte] if byte & 0x80 == 0x80 => format!("byte: \\x{:x}", byte),
        _ => String::from_utf8_lossy(piece).into_owned(),
    }
}

fn render_token<T: Tokenizer + ?Sized>(
    tokenizer: &T,
    token: TokenId,
) -> Result<String, BackendError> {
    Ok(render_piece(&tokenizer.token_to_piece(token)?))
}

/// Render records for delivery.
pub fn render_window<T: Tokenizer + ?Sized>(
    records: &[CompletionTokenOutput],
    tokenizer: &T,
) -> Result<Vec<TokenProbabilityView>, BackendError> {
    records
        .iter()
        .map(|record| {
            let probs = record
                .probs
                .iter()
                .map(|candidate| {
                    Ok(CandidateView {
                        tok_str: render_token(tokenizer, candidate.token)?,
                        prob: candidate.prob,
                    })
                })
                .collect::<Result<Vec<_>, BackendError>>()?;
            Ok(TokenProbabilityView {
                content: render_token(tokenizer, record.token)?,
                probs,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::types::TokenProbability;
    use proptest::prelude::*;

    fn record(token: TokenId) -> CompletionTokenOutput {
        CompletionTokenOutput {
            token,
            probs: vec![TokenProbability { token, prob: 0.5 }],
        }
    }

    #[test]
    fn test_window_clips_to_log_length() {
        let log: Vec<_> = (2..6).map(record).collect();
        assert_eq!(probability_window(&log, 1, 2).len(), 2);
        assert_eq!(probability_window(&log, 3, 5).len(), 1);
        assert!(probability_window(&log, 9, 1).is_empty());
        assert!(probability_window(&log, 0, 0).is_empty());
    }

    #[test]
    fn test_render_piece() {
        assert_eq!(render_piece(b"abc"), "abc");
        assert_eq!(render_piece(&[0xE2]), "byte: \\xe2");
        assert_eq!(render_piece(b"a"), "a");
        assert_eq!(render_piece(&[]), "");
    }

    #[test]
    fn test_render_window_uses_tokenizer_pieces() {
        let backend = ScriptedBackend::from_pieces(&[" 2", "\n"]);
        let log = vec![CompletionTokenOutput {
            token: 2,
            probs: vec![
                TokenProbability { token: 2, prob: 0.75 },
                TokenProbability { token: 3, prob: 0.25 },
            ],
        }];
        let views = render_window(&log, &backend).unwrap();
        assert_eq!(views[0].content, " 2");
        assert_eq!(views[0].probs[1].tok_str, "\n");
        assert_eq!(views[0].probs[1].prob, 0.25);
    }

    proptest! {
        #[test]
        fn window_never_exceeds_log(len in 0usize..32, from in 0usize..64, count in 0usize..64) {
            let log: Vec<_> = (0..len as TokenId).map(record).collect();
            let window = probability_window(&log, from, count);
            prop_assert!(window.len() <= count);
            prop_assert!(window.len() <= len.saturating_sub(from));
        }
    }
}
