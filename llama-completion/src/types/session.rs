//! Live state of a single completion run.

use crate::types::{CompletionTokenOutput, StopReason};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Lifecycle of a run on a context.
///
/// Every run goes `Idle -> Initializing -> Predicting -> <terminal>` and then
/// back to `Idle` once its result has been assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    Idle,
    Initializing,
    Predicting,
    StoppedEos,
    StoppedWord,
    StoppedLimit,
    Interrupted,
}

impl GenerationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationState::StoppedEos
                | GenerationState::StoppedWord
                | GenerationState::StoppedLimit
                | GenerationState::Interrupted
        )
    }

    /// Whether a run may move from this state to `next`.
    pub fn can_transition_to(&self, next: GenerationState) -> bool {
        use GenerationState::*;
        match (self, next) {
            (Idle, Initializing) | (Initializing, Predicting) => true,
            (Predicting, next) => next.is_terminal(),
            (current, Idle) => current.is_terminal(),
            _ => false,
        }
    }
}

/// Per-run generation state. A fresh session is created for every run and is
/// discarded once the result has been assembled.
#[derive(Debug)]
pub struct GenerationSession {
    pub(crate) generated_text: String,
    pub(crate) generated_token_probs: Vec<CompletionTokenOutput>,
    /// Bytes of a multi-byte character whose remaining bytes have not arrived.
    pending_bytes: Vec<u8>,
    pub(crate) incomplete: bool,
    pub(crate) has_next_token: bool,
    pub(crate) is_interrupted: bool,
    pub(crate) stopped_eos: bool,
    pub(crate) stopped_word: bool,
    pub(crate) stopped_limit: bool,
    pub(crate) stopping_word: Option<String>,
    pub(crate) num_tokens_predicted: usize,
    pub(crate) num_prompt_tokens: usize,
    pub(crate) truncated: bool,
    state: GenerationState,
}

impl Default for GenerationSession {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationSession {
    pub fn new() -> Self {
        Self {
            generated_text: String::new(),
            generated_token_probs: Vec::new(),
            pending_bytes: Vec::new(),
            incomplete: false,
            has_next_token: false,
            is_interrupted: false,
            stopped_eos: false,
            stopped_word: false,
            stopped_limit: false,
            stopping_word: None,
            num_tokens_predicted: 0,
            num_prompt_tokens: 0,
            truncated: false,
            state: GenerationState::Idle,
        }
    }

    pub fn state(&self) -> GenerationState {
        self.state
    }

    pub fn generated_text(&self) -> &str {
        &self.generated_text
    }

    pub fn generated_token_probs(&self) -> &[CompletionTokenOutput] {
        &self.generated_token_probs
    }

    pub fn num_tokens_predicted(&self) -> usize {
        self.num_tokens_predicted
    }

    pub fn num_prompt_tokens(&self) -> usize {
        self.num_prompt_tokens
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub(crate) fn transition(&mut self, next: GenerationState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal generation state change {:?} -> {:?}",
            self.state,
            next
        );
        trace!(from = ?self.state, to = ?next, "generation state change");
        self.state = next;
    }

    /// Append a token's raw bytes to the generated text.
    ///
    /// Bytes that end partway through a UTF-8 sequence are held back until
    /// the rest of the character arrives, and `incomplete` reports that case.
    /// Invalid sequences are replaced with U+FFFD.
    pub(crate) fn append_piece(&mut self, piece: &[u8]) {
        self.pending_bytes.extend_from_slice(piece);
        loop {
            match std::str::from_utf8(&self.pending_bytes) {
                Ok(text) => {
                    self.generated_text.push_str(text);
                    self.pending_bytes.clear();
                    self.incomplete = false;
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    if let Ok(prefix) = std::str::from_utf8(&self.pending_bytes[..valid]) {
                        self.generated_text.push_str(prefix);
                    }
                    match err.error_len() {
                        None => {
                            self.pending_bytes.drain(..valid);
                            self.incomplete = true;
                            return;
                        }
                        Some(len) => {
                            self.generated_text.push(char::REPLACEMENT_CHARACTER);
                            self.pending_bytes.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    /// Flush held-back bytes at run end, replacing them lossily.
    pub(crate) fn flush_pending_bytes(&mut self) {
        if !self.pending_bytes.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending_bytes).into_owned();
            self.generated_text.push_str(&tail);
            self.pending_bytes.clear();
        }
        self.incomplete = false;
    }

    /// Stop reason by precedence: interruption, EOS, stop word, budget.
    pub(crate) fn stop_reason(&self) -> StopReason {
        if self.is_interrupted {
            StopReason::Interrupted
        } else if self.stopped_eos {
            StopReason::Eos
        } else if self.stopped_word {
            StopReason::Word {
                stopping_word: self.stopping_word.clone().unwrap_or_default(),
            }
        } else {
            StopReason::Limit
        }
    }

    pub(crate) fn terminal_state(&self) -> GenerationState {
        match self.stop_reason() {
            StopReason::Interrupted => GenerationState::Interrupted,
            StopReason::Eos => GenerationState::StoppedEos,
            StopReason::Word { .. } => GenerationState::StoppedWord,
            StopReason::Limit => GenerationState::StoppedLimit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_append_ascii_pieces() {
        let mut session = GenerationSession::new();
        session.append_piece(b" 2");
        session.append_piece(b"\n");
        assert_eq!(session.generated_text(), " 2\n");
        assert!(!session.incomplete);
    }

    #[test]
    fn test_split_multibyte_character_is_held_back() {
        let mut session = GenerationSession::new();
        let euro = "€".as_bytes();
        session.append_piece(&euro[..1]);
        assert!(session.incomplete);
        assert_eq!(session.generated_text(), "");

        session.append_piece(&euro[1..]);
        assert!(!session.incomplete);
        assert_eq!(session.generated_text(), "€");
    }

    #[test]
    fn test_invalid_bytes_are_replaced() {
        let mut session = GenerationSession::new();
        session.append_piece(&[b'a', 0xFF, b'b']);
        assert_eq!(session.generated_text(), "a\u{FFFD}b");
        assert!(!session.incomplete);
    }

    #[test]
    fn test_flush_pending_bytes() {
        let mut session = GenerationSession::new();
        session.append_piece(&[0xE2, 0x82]);
        assert!(session.incomplete);
        session.flush_pending_bytes();
        assert!(!session.incomplete);
        assert_eq!(session.generated_text(), "\u{FFFD}");
    }

    #[test]
    fn test_stop_reason_precedence() {
        let mut session = GenerationSession::new();
        session.stopped_limit = true;
        session.stopped_word = true;
        session.stopping_word = Some("END".to_string());
        assert_eq!(
            session.stop_reason(),
            StopReason::Word {
                stopping_word: "END".to_string()
            }
        );

        session.stopped_eos = true;
        assert_eq!(session.stop_reason(), StopReason::Eos);

        session.is_interrupted = true;
        assert_eq!(session.terminal_state(), GenerationState::Interrupted);
        assert!(session.terminal_state().is_terminal());
    }

    #[test]
    fn test_run_returns_to_idle() {
        let mut session = GenerationSession::new();
        assert_eq!(session.state(), GenerationState::Idle);
        session.transition(GenerationState::Initializing);
        session.transition(GenerationState::Predicting);
        session.stopped_limit = true;
        session.transition(session.terminal_state());
        assert_eq!(session.state(), GenerationState::StoppedLimit);
        session.transition(GenerationState::Idle);
        assert_eq!(session.state(), GenerationState::Idle);
    }

    #[rstest]
    #[case(GenerationState::Idle, GenerationState::Initializing, true)]
    #[case(GenerationState::Initializing, GenerationState::Predicting, true)]
    #[case(GenerationState::Predicting, GenerationState::StoppedEos, true)]
    #[case(GenerationState::Predicting, GenerationState::Interrupted, true)]
    #[case(GenerationState::StoppedWord, GenerationState::Idle, true)]
    #[case(GenerationState::Interrupted, GenerationState::Idle, true)]
    #[case(GenerationState::Idle, GenerationState::Predicting, false)]
    #[case(GenerationState::Predicting, GenerationState::Idle, false)]
    #[case(GenerationState::StoppedEos, GenerationState::Predicting, false)]
    #[case(GenerationState::Initializing, GenerationState::StoppedLimit, false)]
    fn test_state_changes(
        #[case] from: GenerationState,
        #[case] to: GenerationState,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }
}
