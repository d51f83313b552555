use super::probability_window::{probability_window, render_window};
use crate::backend::{BackendError, Tokenizer};
use crate::stopper::{StopMatch, StopSequenceMatcher};
use crate::types::{CompletionTokenOutput, PartialCompletion};
use tracing::{trace, warn};

/// Outcome of one emitter pass.
#[derive(Debug, Default, PartialEq)]
pub struct Emission {
    /// Text that became safe to send, if any.
    pub delivery: Option<PartialCompletion>,
    /// Stop string that matched in full during this pass.
    pub stopping_word: Option<String>,
}

/// Decides how much generated text is safe to hand to the consumer.
///
/// The emitter owns the "already sent" cursors over the generated text and
/// the probability log. After each appended token it checks the unsent text
/// against the stop strings:
///
/// - a full match truncates the text at the match and sends whatever unsent
///   text remains before it;
/// - a partial match withholds everything unsent, unless generation has ended
///   and the match does not start at the first unsent byte, in which case the
///   text before the match is sent;
/// - no match sends the whole unsent suffix.
///
/// When `n_probs > 0` the delivered text is re-tokenized to find how many
/// probability records it covers, and those records go out with it. Text the
/// tokenizer rejects takes every record up to the current token.
#[derive(Debug, Clone)]
pub struct StreamingEmitter {
    matcher: StopSequenceMatcher,
    n_probs: usize,
    sent_text: usize,
    sent_probs: usize,
}

impl StreamingEmitter {
    pub fn new(stops: Vec<String>, n_probs: usize) -> Self {
        Self {
            matcher: StopSequenceMatcher::new(stops),
            n_probs,
            sent_text: 0,
            sent_probs: 0,
        }
    }

    pub fn sent_text_cursor(&self) -> usize {
        self.sent_text
    }

    pub fn sent_prob_cursor(&self) -> usize {
        self.sent_probs
    }

    /// Run one pass after a token has been appended to `text`.
    pub fn process<T: Tokenizer + ?Sized>(
        &mut self,
        text: &mut String,
        probs: &[CompletionTokenOutput],
        last_token_len: usize,
        has_next_token: bool,
        tokenizer: &T,
    ) -> Result<Emission, BackendError> {
        let found = self
            .matcher
            .check(&text[self.sent_text..], last_token_len);

        let mut emission = Emission::default();
        let send_len = match found {
            Some(StopMatch::Full { offset, stop_index }) => {
                text.truncate(self.sent_text + offset);
                self.sent_text = self.sent_text.min(text.len());
                emission.stopping_word = self.matcher.stop(stop_index).map(str::to_string);
                trace!(offset, "stop string matched, text truncated");
                text.len() - self.sent_text
            }
            Some(StopMatch::Partial { offset }) => {
                if !has_next_token && offset > 0 {
                    offset
                } else {
                    0
                }
            }
            None => text.len() - self.sent_text,
        };

        if send_len == 0 {
            return Ok(emission);
        }

        let start = self.sent_text;
        self.sent_text += send_len;
        let chunk = text[start..self.sent_text].to_string();

        let completion_probabilities = if self.n_probs > 0 {
            let covered = match tokenizer.tokenize(&chunk, false) {
                Ok(tokens) => tokens.len(),
                Err(e) => {
                    warn!(
                        error = %e,
                        "could not re-tokenize delivered text, sending all pending probabilities"
                    );
                    probs.len().saturating_sub(self.sent_probs)
                }
            };
            let window = probability_window(probs, self.sent_probs, covered);
            self.sent_probs = (self.sent_probs + window.len()).min(probs.len());
            Some(render_window(window, tokenizer)?)
        } else {
            None
        };

        emission.delivery = Some(PartialCompletion {
            token: chunk,
            completion_probabilities,
        });
        Ok(emission)
    }

    /// Final pass once generation has ended.
    pub fn flush<T: Tokenizer + ?Sized>(
        &mut self,
        text: &mut String,
        probs: &[CompletionTokenOutput],
        tokenizer: &T,
    ) -> Result<Emission, BackendError> {
        self.process(text, probs, 0, false, tokenizer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::types::TokenProbability;
    use proptest::prelude::*;

    fn backend() -> ScriptedBackend {
        ScriptedBackend::from_pieces(&[" 2", "\n", " done", "...", "E", "N", "D", " more", "x"])
    }

    fn record(token: i32) -> CompletionTokenOutput {
        CompletionTokenOutput {
            token,
            probs: vec![TokenProbability { token, prob: 1.0 }],
        }
    }

    /// Append pieces one by one, returning everything delivered.
    fn drive(
        emitter: &mut StreamingEmitter,
        backend: &ScriptedBackend,
        pieces: &[&str],
    ) -> (String, Vec<String>, Option<String>) {
        let mut text = String::new();
        let mut probs = Vec::new();
        let mut delivered = Vec::new();
        for piece in pieces {
            text.push_str(piece);
            let token = backend.token_id(piece).unwrap();
            probs.push(record(token));
            let emission = emitter
                .process(&mut text, &probs, piece.len(), true, backend)
                .unwrap();
            if let Some(chunk) = emission.delivery {
                delivered.push(chunk.token);
            }
            if emission.stopping_word.is_some() {
                return (text, delivered, emission.stopping_word);
            }
        }
        (text, delivered, None)
    }

    #[test]
    fn test_double_newline_stop() {
        let backend = backend();
        let mut emitter = StreamingEmitter::new(vec!["\n\n".to_string()], 0);
        let (text, delivered, word) = drive(&mut emitter, &backend, &[" 2", "\n", "\n", " done"]);
        assert_eq!(delivered, vec![" 2".to_string()]);
        assert_eq!(text, " 2");
        assert_eq!(word.as_deref(), Some("\n\n"));
    }

    #[test]
    fn test_partial_match_is_withheld_then_dropped() {
        let backend = backend();
        let mut emitter = StreamingEmitter::new(vec!["END".to_string()], 0);
        let (text, delivered, word) =
            drive(&mut emitter, &backend, &["...", "E", "N", "D", " more"]);
        assert_eq!(delivered, vec!["...".to_string()]);
        assert_eq!(text, "...");
        assert_eq!(word.as_deref(), Some("END"));
    }

    #[test]
    fn test_full_match_sends_unsent_prefix() {
        let backend = backend();
        let mut emitter = StreamingEmitter::new(vec!["END".to_string()], 0);
        // The first "E" is withheld until "END" completes after it
        let (text, delivered, word) = drive(&mut emitter, &backend, &["x", "E", "E", "N", "D"]);
        assert_eq!(delivered, vec!["x".to_string(), "E".to_string()]);
        assert_eq!(text, "xE");
        assert_eq!(word.as_deref(), Some("END"));
        assert_eq!(emitter.sent_text_cursor(), text.len());
    }

    #[test]
    fn test_flush_sends_safe_prefix_only() {
        let backend = backend();
        let mut emitter = StreamingEmitter::new(vec!["END".to_string()], 0);
        let mut text = "...EN".to_string();
        let probs = vec![record(5), record(6), record(7)];

        let pass = emitter.process(&mut text, &probs, 1, true, &backend).unwrap();
        assert!(pass.delivery.is_none());

        let flushed = emitter.flush(&mut text, &probs, &backend).unwrap();
        assert_eq!(flushed.delivery.unwrap().token, "...");
        assert_eq!(text, "...EN");

        // Offset zero stays withheld
        let again = emitter.flush(&mut text, &probs, &backend).unwrap();
        assert!(again.delivery.is_none());
        assert_eq!(emitter.sent_text_cursor(), 3);
    }

    #[test]
    fn test_probabilities_follow_delivered_tokens() {
        let backend = backend();
        let mut emitter = StreamingEmitter::new(vec!["\n\n".to_string()], 2);
        let mut text = String::new();
        let mut probs = Vec::new();

        text.push_str(" 2");
        probs.push(record(2));
        let first = emitter.process(&mut text, &probs, 2, true, &backend).unwrap();
        let window = first.delivery.unwrap().completion_probabilities.unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].content, " 2");
        assert_eq!(emitter.sent_prob_cursor(), 1);

        text.push('\n');
        probs.push(record(3));
        let held = emitter.process(&mut text, &probs, 1, true, &backend).unwrap();
        assert!(held.delivery.is_none());
        assert_eq!(emitter.sent_prob_cursor(), 1);

        text.push_str(" done");
        probs.push(record(4));
        let second = emitter.process(&mut text, &probs, 5, true, &backend).unwrap();
        let window = second.delivery.unwrap().completion_probabilities.unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[1].content, " done");
        assert_eq!(emitter.sent_prob_cursor(), 3);
    }

    #[test]
    fn test_untokenizable_delivery_takes_pending_records() {
        let backend = backend();
        let mut emitter = StreamingEmitter::new(Vec::new(), 1);
        let mut text = "zz".to_string();
        let probs = vec![record(2), record(3)];

        let pass = emitter.process(&mut text, &probs, 2, true, &backend).unwrap();

        let chunk = pass.delivery.unwrap();
        assert_eq!(chunk.token, "zz");
        assert_eq!(chunk.completion_probabilities.unwrap().len(), 2);
        assert_eq!(emitter.sent_prob_cursor(), 2);
    }

    proptest! {
        #[test]
        fn deliveries_never_contain_stop_and_cursor_is_monotonic(
            picks in proptest::collection::vec(0usize..9, 0..40)
        ) {
            let backend = backend();
            let pieces = [" 2", "\n", " done", "...", "E", "N", "D", " more", "x"];
            let mut emitter = StreamingEmitter::new(vec!["END".to_string(), "\n\n".to_string()], 0);
            let mut text = String::new();
            let mut probs = Vec::new();
            let mut delivered = String::new();
            let mut last_cursor = 0;

            for pick in picks {
                let piece = pieces[pick];
                text.push_str(piece);
                probs.push(record(pick as i32 + 2));
                let emission = emitter.process(&mut text, &probs, piece.len(), true, &backend).unwrap();
                if let Some(chunk) = emission.delivery {
                    delivered.push_str(&chunk.token);
                }
                prop_assert!(emitter.sent_text_cursor() >= last_cursor);
                prop_assert!(emitter.sent_text_cursor() <= text.len());
                last_cursor = emitter.sent_text_cursor();
                if emission.stopping_word.is_some() {
                    break;
                }
            }

            prop_assert!(!delivered.contains("END"));
            prop_assert!(!delivered.contains("\n\n"));
            prop_assert!(text.starts_with(&delivered));
        }
    }
}
