//! Scripted backend for fixture playback
//!
//! Replays a recorded vocabulary and token script instead of running a model.
//! Tokenization is greedy longest-match over the vocabulary pieces, and every
//! call to `sample` returns the next scripted step. Text that ends partway
//! through a piece maps to that piece; anything else the vocabulary does not
//! cover maps to the fixture's `unk` token, one character at a time. Once the script runs out
//! the backend produces EOS.

use super::{BackendError, InferenceBackend, ModelInfo, SampledToken, Tokenizer};
use crate::types::{SamplerConfig, TokenId, TokenProbability};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

/// One vocabulary entry: either UTF-8 text or raw bytes for pieces that
/// split a multi-byte character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VocabEntry {
    Text(String),
    Bytes { bytes: Vec<u8> },
}

impl VocabEntry {
    fn as_bytes(&self) -> &[u8] {
        match self {
            VocabEntry::Text(text) => text.as_bytes(),
            VocabEntry::Bytes { bytes } => bytes,
        }
    }
}

/// One recorded sampler step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptStep {
    /// Produce this token.
    Token(TokenId),
    /// Produce `token` (or nothing, when `null`) with these candidates.
    Sampled {
        token: Option<TokenId>,
        #[serde(default)]
        candidates: Vec<TokenProbability>,
    },
}

impl ScriptStep {
    fn token(&self) -> Option<TokenId> {
        match self {
            ScriptStep::Token(token) => Some(*token),
            ScriptStep::Sampled { token, .. } => *token,
        }
    }
}

/// Length of the vectors [`ScriptedBackend`] returns from `embedding`.
pub const SCRIPTED_EMBEDDING_SIZE: usize = 8;

/// Recorded fixture format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedFixture {
    #[serde(default = "default_description")]
    pub description: String,
    pub vocab: Vec<VocabEntry>,
    #[serde(default)]
    pub bos: Option<TokenId>,
    pub eos: TokenId,
    /// Token standing in for characters no piece covers.
    #[serde(default)]
    pub unk: Option<TokenId>,
    #[serde(default)]
    pub script: Vec<ScriptStep>,
}

fn default_description() -> String {
    "scripted".to_string()
}

/// Observable side effects of a [`ScriptedBackend`], shared with tests after
/// the backend has been moved into a context.
#[derive(Debug, Default, Clone)]
pub struct BackendRecord {
    /// Tokens held in the simulated KV cache, by position.
    pub cache: Vec<TokenId>,
    /// Every `evaluate` call as `(n_past, tokens)`.
    pub evaluations: Vec<(usize, Vec<TokenId>)>,
    /// Every `shift_cache` call as `(keep, discard)`.
    pub shifts: Vec<(usize, usize)>,
    pub last_config: Option<SamplerConfig>,
    pub samples: usize,
}

#[derive(Debug, Clone, Default)]
pub struct BackendProbe(Arc<Mutex<BackendRecord>>);

impl BackendProbe {
    pub fn snapshot(&self) -> BackendRecord {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, BackendRecord> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Backend that plays back a recorded token script.
#[derive(Debug)]
pub struct ScriptedBackend {
    description: String,
    vocab: Vec<Vec<u8>>,
    bos: Option<TokenId>,
    eos: TokenId,
    unk: Option<TokenId>,
    script: Vec<ScriptStep>,
    cursor: usize,
    last_token: Option<TokenId>,
    fail_evaluation_at: Option<usize>,
    record: BackendProbe,
}

impl ScriptedBackend {
    pub fn new(fixture: ScriptedFixture) -> Self {
        Self {
            description: fixture.description,
            vocab: fixture
                .vocab
                .iter()
                .map(|entry| entry.as_bytes().to_vec())
                .collect(),
            bos: fixture.bos,
            eos: fixture.eos,
            unk: fixture.unk,
            script: fixture.script,
            cursor: 0,
            last_token: None,
            fail_evaluation_at: None,
            record: BackendProbe::default(),
        }
    }

    /// Load a fixture from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| BackendError::Fixture {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let fixture: ScriptedFixture =
            serde_json::from_str(&content).map_err(|e| BackendError::Fixture {
                path: path.display().to_string(),
                message: format!("invalid fixture JSON: {}", e),
            })?;
        debug!(
            "Loaded fixture {} with {} vocabulary entries and {} scripted steps",
            path.display(),
            fixture.vocab.len(),
            fixture.script.len()
        );
        Ok(Self::new(fixture))
    }

    /// Text vocabulary with `<s>` at 0 (BOS) and `</s>` at 1 (EOS) prepended.
    pub fn from_pieces(pieces: &[&str]) -> Self {
        let mut vocab = vec![
            VocabEntry::Text("<s>".to_string()),
            VocabEntry::Text("</s>".to_string()),
        ];
        vocab.extend(pieces.iter().map(|p| VocabEntry::Text(p.to_string())));
        Self::new(ScriptedFixture {
            description: default_description(),
            vocab,
            bos: Some(0),
            eos: 1,
            unk: None,
            script: Vec::new(),
        })
    }

    pub fn with_script(mut self, script: Vec<ScriptStep>) -> Self {
        self.script = script;
        self.cursor = 0;
        self
    }

    /// Script the tokens that `text` tokenizes to.
    pub fn with_script_text(self, text: &str) -> Result<Self, BackendError> {
        let tokens = self.tokenize(text, false)?;
        Ok(self.with_script(tokens.into_iter().map(ScriptStep::Token).collect()))
    }

    /// Fail every evaluate call once `call` calls (zero based) have succeeded.
    pub fn with_evaluation_failure(mut self, call: usize) -> Self {
        self.fail_evaluation_at = Some(call);
        self
    }

    pub fn probe(&self) -> BackendProbe {
        self.record.clone()
    }

    pub fn token_id(&self, piece: &str) -> Option<TokenId> {
        self.vocab
            .iter()
            .position(|bytes| bytes.as_slice() == piece.as_bytes())
            .map(|index| index as TokenId)
    }

    pub fn eos(&self) -> TokenId {
        self.eos
    }

    fn is_special(&self, token: TokenId) -> bool {
        token == self.eos || Some(token) == self.bos
    }

    fn piece(&self, token: TokenId) -> Result<&[u8], BackendError> {
        usize::try_from(token)
            .ok()
            .and_then(|index| self.vocab.get(index))
            .map(Vec::as_slice)
            .ok_or(BackendError::UnknownToken(token))
    }

    /// Shortest non-special piece that `rest` is a proper prefix of.
    fn completing_piece(&self, rest: &[u8]) -> Option<TokenId> {
        self.vocab
            .iter()
            .enumerate()
            .filter(|(index, piece)| {
                piece.len() > rest.len()
                    && !self.is_special(*index as TokenId)
                    && piece.starts_with(rest)
            })
            .min_by_key(|(_, piece)| piece.len())
            .map(|(index, _)| index as TokenId)
    }

    fn is_excluded(&self, token: TokenId) -> bool {
        self.record
            .lock()
            .last_config
            .as_ref()
            .map(|config| {
                config
                    .logit_bias
                    .iter()
                    .any(|(id, bias)| *id == token && *bias == f32::NEG_INFINITY)
            })
            .unwrap_or(false)
    }
}

impl Tokenizer for ScriptedBackend {
    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>, BackendError> {
        let bytes = text.as_bytes();
        let mut tokens = Vec::new();
        if add_special {
            if let Some(bos) = self.bos {
                tokens.push(bos);
            }
        }

        let mut pos = 0;
        while pos < bytes.len() {
            let rest = &bytes[pos..];
            let best = self
                .vocab
                .iter()
                .enumerate()
                .filter(|(index, piece)| {
                    !piece.is_empty()
                        && !self.is_special(*index as TokenId)
                        && rest.starts_with(piece)
                })
                .max_by_key(|(_, piece)| piece.len());

            if let Some((index, piece)) = best {
                tokens.push(index as TokenId);
                pos += piece.len();
                continue;
            }

            // Text cut short inside a piece, as when a stop string ends it
            if let Some(index) = self.completing_piece(rest) {
                tokens.push(index);
                break;
            }

            match self.unk {
                Some(unk) => {
                    tokens.push(unk);
                    pos += utf8_len(rest);
                }
                None => {
                    return Err(BackendError::Tokenization(format!(
                        "no vocabulary piece matches input at byte {}",
                        pos
                    )))
                }
            }
        }
        Ok(tokens)
    }

    fn detokenize(&self, tokens: &[TokenId]) -> Result<String, BackendError> {
        let mut bytes = Vec::new();
        for &token in tokens {
            let piece = self.piece(token)?;
            if !self.is_special(token) {
                bytes.extend_from_slice(piece);
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
        let piece = self.piece(token)?;
        if self.is_special(token) {
            return Ok(Vec::new());
        }
        Ok(piece.to_vec())
    }
}

impl InferenceBackend for ScriptedBackend {
    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            description: self.description.clone(),
            size_bytes: self.vocab.iter().map(|p| p.len() as u64).sum(),
            n_params: self.vocab.len() as u64,
            n_vocab: self.vocab.len(),
            eos_token: self.eos,
        }
    }

    fn configure(&mut self, config: &SamplerConfig) -> Result<(), BackendError> {
        if let Some(grammar) = &config.grammar {
            if !grammar.contains("root") {
                return Err(BackendError::Grammar(
                    "grammar does not define a root rule".to_string(),
                ));
            }
        }
        self.record.lock().last_config = Some(config.clone());
        Ok(())
    }

    fn evaluate(&mut self, tokens: &[TokenId], n_past: usize) -> Result<(), BackendError> {
        for &token in tokens {
            self.piece(token)?;
        }

        let mut record = self.record.lock();
        if Some(record.evaluations.len()) == self.fail_evaluation_at {
            return Err(BackendError::evaluation(n_past, "scripted evaluation failure"));
        }
        if n_past > record.cache.len() {
            return Err(BackendError::evaluation(
                n_past,
                format!("cache holds only {} positions", record.cache.len()),
            ));
        }
        record.cache.truncate(n_past);
        record.cache.extend_from_slice(tokens);
        record.evaluations.push((n_past, tokens.to_vec()));
        trace!(n_past, n_tokens = tokens.len(), "scripted evaluate");
        Ok(())
    }

    fn sample(&mut self, n_probs: usize) -> Result<Option<SampledToken>, BackendError> {
        self.record.lock().samples += 1;

        loop {
            let Some(step) = self.script.get(self.cursor).cloned() else {
                let token = if self.is_excluded(self.eos) {
                    self.last_token.unwrap_or(self.eos)
                } else {
                    self.eos
                };
                return Ok(Some(SampledToken {
                    token,
                    candidates: single_candidate(token, n_probs),
                }));
            };
            self.cursor += 1;

            let Some(token) = step.token() else {
                return Ok(None);
            };
            self.piece(token)?;
            if self.is_excluded(token) {
                trace!(token, "skipping excluded scripted token");
                continue;
            }
            self.last_token = Some(token);

            let candidates = match step {
                ScriptStep::Sampled { candidates, .. } if !candidates.is_empty() => {
                    candidates.into_iter().take(n_probs).collect()
                }
                _ => single_candidate(token, n_probs),
            };
            return Ok(Some(SampledToken { token, candidates }));
        }
    }

    fn truncate_cache(&mut self, from: usize) {
        self.record.lock().cache.truncate(from);
    }

    fn shift_cache(&mut self, keep: usize, discard: usize, n_past: usize) {
        let mut record = self.record.lock();
        let end = (keep + discard).min(n_past).min(record.cache.len());
        if keep < end {
            record.cache.drain(keep..end);
        }
        record.shifts.push((keep, discard));
    }

    /// Deterministic unit vector derived from the cached tokens and their
    /// positions, so equal caches give equal embeddings.
    fn embedding(&self) -> Result<Vec<f32>, BackendError> {
        let record = self.record.lock();
        if record.cache.is_empty() {
            return Err(BackendError::Embedding("nothing has been evaluated".to_string()));
        }

        let mut values = vec![0.0f32; SCRIPTED_EMBEDDING_SIZE];
        for (position, &token) in record.cache.iter().enumerate() {
            for (dim, value) in values.iter_mut().enumerate() {
                let mix = (token as i64 + 1) * (dim as i64 + 3) + position as i64 * 7;
                *value += (mix % 17) as f32 - 8.0;
            }
        }
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            values.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(values)
    }

    fn state_snapshot(&self) -> Vec<u8> {
        let record = self.record.lock();
        let mut buf = BytesMut::with_capacity(record.cache.len() * 4);
        for &token in &record.cache {
            buf.put_i32_le(token);
        }
        buf.to_vec()
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<(), BackendError> {
        if state.len() % 4 != 0 {
            return Err(BackendError::State(format!(
                "state length {} is not a whole number of tokens",
                state.len()
            )));
        }
        let mut buf = state;
        let mut cache = Vec::with_capacity(state.len() / 4);
        while buf.has_remaining() {
            cache.push(buf.get_i32_le());
        }
        self.record.lock().cache = cache;
        Ok(())
    }
}

/// Byte length of the first character of `bytes`, or 1 when it is not valid UTF-8.
fn utf8_len(bytes: &[u8]) -> usize {
    let width = match bytes.first() {
        Some(b) if *b < 0x80 => 1,
        Some(b) if *b >= 0xF0 => 4,
        Some(b) if *b >= 0xE0 => 3,
        Some(b) if *b >= 0xC0 => 2,
        _ => 1,
    };
    width.min(bytes.len()).max(1)
}

fn single_candidate(token: TokenId, n_probs: usize) -> Vec<TokenProbability> {
    if n_probs == 0 {
        Vec::new()
    } else {
        vec![TokenProbability { token, prob: 1.0 }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SamplingParameters;

    fn counting_backend() -> ScriptedBackend {
        ScriptedBackend::from_pieces(&["Count", ":", " 1", " 2", "\n", " done", " "])
    }

    #[test]
    fn test_greedy_tokenize_prefers_longest_piece() {
        let backend = counting_backend();
        let tokens = backend.tokenize("Count: 1", true).unwrap();
        assert_eq!(tokens, vec![0, 2, 3, 4]);
        assert_eq!(backend.detokenize(&tokens).unwrap(), "Count: 1");
    }

    #[test]
    fn test_tokenize_unknown_input_fails() {
        let backend = counting_backend();
        assert!(matches!(
            backend.tokenize("xyz", false),
            Err(BackendError::Tokenization(_))
        ));
    }

    #[test]
    fn test_text_cut_inside_a_piece_maps_to_that_piece() {
        let backend = ScriptedBackend::from_pieces(&[" 2", "xE", "xEN", "ND"]);
        assert_eq!(backend.tokenize(" 2x", false).unwrap(), vec![2, 3]);
        assert_eq!(backend.tokenize("xEN", false).unwrap(), vec![4]);
    }

    #[test]
    fn test_uncovered_characters_fall_back_to_unk() {
        let fixture: ScriptedFixture = serde_json::from_str(
            r#"{"vocab": ["<s>", "</s>", "<unk>", " 2"], "bos": 0, "eos": 1, "unk": 2}"#,
        )
        .unwrap();
        let backend = ScriptedBackend::new(fixture);

        let tokens = backend.tokenize(" 2\u{fffd}é 2", false).unwrap();
        assert_eq!(tokens, vec![3, 2, 2, 3]);
    }

    #[test]
    fn test_special_tokens_have_empty_pieces() {
        let backend = counting_backend();
        assert!(backend.token_to_piece(1).unwrap().is_empty());
        assert_eq!(backend.token_to_piece(5).unwrap(), b" 2".to_vec());
        assert!(matches!(
            backend.token_to_piece(99),
            Err(BackendError::UnknownToken(99))
        ));
    }

    #[test]
    fn test_script_then_eos() {
        let mut backend = counting_backend().with_script_text(" 2\n").unwrap();
        assert_eq!(backend.sample(0).unwrap().unwrap().token, 5);
        assert_eq!(backend.sample(0).unwrap().unwrap().token, 6);
        assert_eq!(backend.sample(0).unwrap().unwrap().token, backend.eos());
        assert_eq!(backend.probe().snapshot().samples, 3);
    }

    #[test]
    fn test_candidates_are_clipped_to_n_probs() {
        let mut backend = counting_backend().with_script(vec![ScriptStep::Sampled {
            token: Some(5),
            candidates: vec![
                TokenProbability { token: 5, prob: 0.6 },
                TokenProbability { token: 4, prob: 0.3 },
                TokenProbability { token: 6, prob: 0.1 },
            ],
        }]);
        let sampled = backend.sample(2).unwrap().unwrap();
        assert_eq!(sampled.candidates.len(), 2);
        assert_eq!(sampled.candidates[1].token, 4);
    }

    #[test]
    fn test_null_step_produces_no_token() {
        let mut backend = counting_backend().with_script(vec![ScriptStep::Sampled {
            token: None,
            candidates: Vec::new(),
        }]);
        assert!(backend.sample(0).unwrap().is_none());
    }

    #[test]
    fn test_excluded_tokens_are_skipped() {
        let mut backend = counting_backend().with_script_text(" 2 1").unwrap();
        let config = SamplingParameters::default()
            .with_logit_bias(5, crate::types::LogitBias::Exclude)
            .sampler_config(1, 9);
        backend.configure(&config).unwrap();
        assert_eq!(backend.sample(0).unwrap().unwrap().token, 4);
    }

    #[test]
    fn test_grammar_without_root_is_rejected() {
        let mut backend = counting_backend();
        let config = SamplingParameters::default()
            .with_grammar("expr ::= [0-9]+")
            .sampler_config(1, 9);
        assert!(matches!(
            backend.configure(&config),
            Err(BackendError::Grammar(_))
        ));
    }

    #[test]
    fn test_cache_evaluate_shift_and_state() {
        let mut backend = counting_backend();
        let probe = backend.probe();
        backend.evaluate(&[0, 2, 3, 4], 0).unwrap();
        backend.evaluate(&[5], 4).unwrap();
        assert_eq!(probe.snapshot().cache, vec![0, 2, 3, 4, 5]);

        backend.shift_cache(1, 2, 5);
        assert_eq!(probe.snapshot().cache, vec![0, 4, 5]);

        let state = backend.state_snapshot();
        backend.clear_cache();
        assert!(probe.snapshot().cache.is_empty());
        backend.restore_state(&state).unwrap();
        assert_eq!(probe.snapshot().cache, vec![0, 4, 5]);

        assert!(backend.restore_state(&[1, 2, 3]).is_err());
        assert!(backend.evaluate(&[5], 10).is_err());
    }

    #[test]
    fn test_fixture_parses_mixed_entries() {
        let json = r#"{
            "vocab": ["<s>", "</s>", "a", {"bytes": [226, 130]}, {"bytes": [172]}],
            "bos": 0,
            "eos": 1,
            "script": [2, {"token": 3, "candidates": [{"token": 3, "prob": 0.9}]}, {"token": null}]
        }"#;
        let fixture: ScriptedFixture = serde_json::from_str(json).unwrap();
        assert_eq!(fixture.description, "scripted");
        assert_eq!(fixture.script[0], ScriptStep::Token(2));
        let backend = ScriptedBackend::new(fixture);
        assert_eq!(backend.token_to_piece(3).unwrap(), vec![226, 130]);
        assert_eq!(backend.model_info().n_vocab, 5);
    }

    #[test]
    fn test_embedding_follows_cache_contents() {
        let mut backend = counting_backend();
        assert!(matches!(backend.embedding(), Err(BackendError::Embedding(_))));

        backend.evaluate(&[0, 2, 3, 4], 0).unwrap();
        let first = backend.embedding().unwrap();
        assert_eq!(first.len(), SCRIPTED_EMBEDDING_SIZE);
        let norm: f32 = first.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert_eq!(backend.embedding().unwrap(), first);

        backend.evaluate(&[5], 4).unwrap();
        assert_ne!(backend.embedding().unwrap(), first);
    }

    #[test]
    fn test_from_file_missing_path() {
        let err = ScriptedBackend::from_file("/nonexistent/fixture.json").unwrap_err();
        assert!(matches!(err, BackendError::Fixture { .. }));
    }
}
