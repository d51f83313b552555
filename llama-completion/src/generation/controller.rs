//! The per-context generation loop.

use super::prompt::{fit_prompt, reuse_point};
use super::{CompletionError, ContextConfig, InterruptHandle, PredictingFlag};
use crate::backend::{InferenceBackend, ModelInfo};
use crate::bench::{run_bench, BenchReport, BenchRequest};
use crate::metrics::{RunMetrics, TimingCounters};
use crate::storage::{PersistedSession, SessionError, SessionStore};
use crate::stopper::TokenBudget;
use crate::streaming::probability_window::render_window;
use crate::streaming::{CompletionSink, Emission, NullSink, StreamingEmitter};
use crate::types::{
    CompletionResult, CompletionTokenOutput, GenerationSession, GenerationState, SamplingParameters,
    TokenId,
};
use llama_common::{Pretty, ValidatedConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Result of restoring a saved session into a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedSession {
    pub tokens_loaded: usize,
    pub prompt: String,
}

/// An inference backend plus the token buffer mirroring its cache.
///
/// The context persists across runs: a later prompt that shares a prefix with
/// the buffer only evaluates the tokens after that prefix. One run executes
/// at a time; `complete` takes `&mut self`.
pub struct CompletionContext {
    backend: Box<dyn InferenceBackend>,
    config: ContextConfig,
    /// Tokens known to the context, prompt followed by generated tokens.
    embd: Vec<TokenId>,
    /// Number of `embd` tokens already evaluated into the cache.
    n_past: usize,
    /// Kept prefix length for the current prompt.
    n_keep: usize,
    eos_token: TokenId,
    interrupt: InterruptHandle,
    predicting: PredictingFlag,
}

impl std::fmt::Debug for CompletionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionContext")
            .field("config", &self.config)
            .field("tokens", &self.embd.len())
            .field("n_past", &self.n_past)
            .field("predicting", &self.predicting.get())
            .finish()
    }
}

enum Evaluated {
    Done,
    Interrupted,
}

impl CompletionContext {
    pub fn new(
        backend: Box<dyn InferenceBackend>,
        config: ContextConfig,
    ) -> Result<Self, CompletionError> {
        let config = config.validated()?;
        debug!("Creating completion context: {}", Pretty(&config));
        let eos_token = backend.model_info().eos_token;
        Ok(Self {
            backend,
            config,
            embd: Vec::new(),
            n_past: 0,
            n_keep: 0,
            eos_token,
            interrupt: InterruptHandle::new(),
            predicting: PredictingFlag::default(),
        })
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn model_info(&self) -> ModelInfo {
        self.backend.model_info()
    }

    /// Handle that interrupts the run in flight from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub(crate) fn predicting_flag(&self) -> PredictingFlag {
        self.predicting.clone()
    }

    pub fn is_predicting(&self) -> bool {
        self.predicting.get()
    }

    /// Tokens currently held by the context.
    pub fn tokens(&self) -> &[TokenId] {
        &self.embd
    }

    pub fn n_past(&self) -> usize {
        self.n_past
    }

    /// Tokenize without special tokens.
    pub fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, CompletionError> {
        Ok(self.backend.tokenize(text, false)?)
    }

    pub fn detokenize(&self, tokens: &[TokenId]) -> Result<String, CompletionError> {
        Ok(self.backend.detokenize(tokens)?)
    }

    /// Run one completion for `prompt`, delivering safe text to `sink` as it
    /// is generated.
    pub fn complete<S>(
        &mut self,
        prompt: &str,
        params: &SamplingParameters,
        sink: &mut S,
    ) -> Result<CompletionResult, CompletionError>
    where
        S: CompletionSink + ?Sized,
    {
        let interrupt = self.interrupt.rearm();
        let _predicting = self.predicting.raise();
        let mut session = GenerationSession::new();
        let mut timings = TimingCounters::default();

        session.transition(GenerationState::Initializing);
        self.initialize(prompt, params, &mut session, &mut timings, &interrupt)?;

        let mut budget = TokenBudget::new(params.n_predict);
        if budget.is_exhausted() {
            session.has_next_token = false;
            session.stopped_limit = true;
        }
        let mut emitter = StreamingEmitter::new(params.stop.clone(), params.n_probs);

        session.transition(GenerationState::Predicting);
        while session.has_next_token {
            if interrupt.is_cancelled() {
                session.is_interrupted = true;
                break;
            }

            let Some(output) =
                self.next_token(params, &mut session, &mut budget, &mut timings, &interrupt)?
            else {
                continue;
            };

            let piece = if session.stopped_eos {
                Vec::new()
            } else {
                self.backend.token_to_piece(output.token)?
            };
            trace!(token = output.token, bytes = piece.len(), "token sampled");

            session.append_piece(&piece);
            if !session.stopped_eos {
                session.generated_token_probs.push(output);
            }

            if session.incomplete && !session.has_next_token && !session.stopped_eos {
                session.has_next_token = true;
                budget.extend();
            }
            if !session.has_next_token && budget.is_exhausted() {
                session.stopped_limit = true;
            }
            if session.incomplete {
                continue;
            }

            let emission = emitter.process(
                &mut session.generated_text,
                &session.generated_token_probs,
                piece.len(),
                session.has_next_token,
                &*self.backend,
            )?;
            if !dispatch(emission, &mut session, sink) {
                break;
            }
        }

        session.flush_pending_bytes();
        if !session.is_interrupted && !session.stopped_word {
            let emission = emitter.flush(
                &mut session.generated_text,
                &session.generated_token_probs,
                &*self.backend,
            )?;
            dispatch(emission, &mut session, sink);
        }

        session.transition(session.terminal_state());
        let result = self.finish(session, params, timings)?;
        info!(
            stop_reason = %result.stop_reason,
            tokens_predicted = result.tokens_predicted,
            tokens_evaluated = result.tokens_evaluated,
            truncated = result.truncated,
            "completion finished"
        );
        Ok(result)
    }

    fn initialize(
        &mut self,
        prompt: &str,
        params: &SamplingParameters,
        session: &mut GenerationSession,
        timings: &mut TimingCounters,
        interrupt: &CancellationToken,
    ) -> Result<(), CompletionError> {
        params.validate()?;
        debug!("Sampling parameters: {}", Pretty(params));

        let info = self.backend.model_info();
        self.eos_token = info.eos_token;
        let sampler = params.sampler_config(info.eos_token, info.n_vocab);
        self.backend.configure(&sampler)?;
        self.backend.reset_timings();

        let prompt_tokens = self
            .backend
            .tokenize(prompt, true)
            .map_err(CompletionError::initialization)?;
        if prompt_tokens.is_empty() {
            return Err(CompletionError::Initialization(
                "prompt produced no tokens".to_string(),
            ));
        }

        let fitted = fit_prompt(prompt_tokens, self.config.n_ctx, self.config.n_keep);
        if fitted.truncated {
            warn!(
                n_ctx = self.config.n_ctx,
                n_keep = fitted.n_keep,
                "prompt exceeded the context window and was truncated"
            );
        }

        let n_past = reuse_point(&self.embd[..self.n_past], &fitted.tokens);
        session.num_prompt_tokens = fitted.tokens.len();
        session.truncated = fitted.truncated;
        self.n_keep = fitted.n_keep;
        self.embd = fitted.tokens;
        self.n_past = n_past;
        self.backend.truncate_cache(n_past);

        info!(
            prompt_tokens = session.num_prompt_tokens,
            reused = n_past,
            "completion started"
        );

        session.has_next_token = true;
        let started = Instant::now();
        let to_evaluate = self.embd.len() - self.n_past;
        match self.evaluate_pending(interrupt)? {
            Evaluated::Done => timings.record_prompt(started.elapsed(), to_evaluate),
            Evaluated::Interrupted => {
                debug!("Interrupted during prompt evaluation");
                session.is_interrupted = true;
                session.has_next_token = false;
            }
        }
        Ok(())
    }

    /// Evaluate buffered tokens the cache does not hold yet, `n_batch` at a
    /// time.
    fn evaluate_pending(
        &mut self,
        interrupt: &CancellationToken,
    ) -> Result<Evaluated, CompletionError> {
        while self.n_past < self.embd.len() {
            if interrupt.is_cancelled() {
                return Ok(Evaluated::Interrupted);
            }
            let end = (self.n_past + self.config.n_batch).min(self.embd.len());
            self.backend.evaluate(&self.embd[self.n_past..end], self.n_past)?;
            trace!(from = self.n_past, to = end, "evaluated batch");
            self.n_past = end;
        }
        Ok(Evaluated::Done)
    }

    /// Drop half of the tokens after the kept prefix once the window is full.
    fn shift_context(&mut self, session: &mut GenerationSession) -> bool {
        let n_left = self.n_past.saturating_sub(self.n_keep + 1);
        let n_discard = n_left / 2;
        if n_discard == 0 {
            return false;
        }

        let keep = self.n_keep + 1;
        debug!(
            n_past = self.n_past,
            n_keep = self.n_keep,
            n_discard,
            "context window full, shifting"
        );
        self.backend.shift_cache(keep, n_discard, self.n_past);
        self.embd.drain(keep..keep + n_discard);
        self.n_past -= n_discard;
        session.truncated = true;
        true
    }

    /// Evaluate pending tokens and sample the next one.
    fn next_token(
        &mut self,
        params: &SamplingParameters,
        session: &mut GenerationSession,
        budget: &mut TokenBudget,
        timings: &mut TimingCounters,
        interrupt: &CancellationToken,
    ) -> Result<Option<CompletionTokenOutput>, CompletionError> {
        if self.embd.len() >= self.config.n_ctx && !self.shift_context(session) {
            warn!("context window full and nothing left to discard, ending generation");
            session.has_next_token = false;
            session.stopped_limit = true;
            return Ok(None);
        }

        let started = Instant::now();
        if let Evaluated::Interrupted = self.evaluate_pending(interrupt)? {
            session.is_interrupted = true;
            session.has_next_token = false;
            return Ok(None);
        }
        let sampled = self.backend.sample(params.n_probs)?;
        timings.record_generation_time(started.elapsed());

        let Some(sampled) = sampled else {
            trace!("sampler produced no token");
            return Ok(None);
        };

        timings.record_generated_token();
        session.num_tokens_predicted += 1;
        self.embd.push(sampled.token);
        budget.consume();

        if !params.ignore_eos && sampled.token == self.eos_token {
            debug!("End of sequence token sampled");
            session.has_next_token = false;
            session.stopped_eos = true;
        } else {
            session.has_next_token = !budget.is_exhausted();
        }

        Ok(Some(CompletionTokenOutput {
            token: sampled.token,
            probs: sampled.candidates,
        }))
    }

    fn finish(
        &self,
        mut session: GenerationSession,
        params: &SamplingParameters,
        timings: TimingCounters,
    ) -> Result<CompletionResult, CompletionError> {
        let completion_probabilities = if params.n_probs > 0 {
            render_window(&session.generated_token_probs, &*self.backend)?
        } else {
            Vec::new()
        };
        let timings = self.backend.timings().unwrap_or(timings);
        let stop_reason = session.stop_reason();
        session.transition(GenerationState::Idle);

        Ok(CompletionResult {
            stop_reason,
            text: session.generated_text,
            completion_probabilities,
            tokens_predicted: session.num_tokens_predicted,
            tokens_evaluated: session.num_prompt_tokens,
            tokens_cached: self.n_past,
            truncated: session.truncated,
            timings: RunMetrics::from(timings),
        })
    }

    /// Evaluate `text` without generating and return the engine's embedding
    /// for it. Only contexts created with `embedding` enabled answer.
    pub fn embedding(&mut self, text: &str) -> Result<Vec<f32>, CompletionError> {
        if !self.config.embedding {
            return Err(CompletionError::Configuration(
                "embedding is not enabled for this context".to_string(),
            ));
        }

        let params = SamplingParameters::default().with_n_predict(0);
        let result = self.complete(text, &params, &mut NullSink)?;
        if result.interrupted() {
            return Err(CompletionError::Initialization(
                "interrupted before the text was evaluated".to_string(),
            ));
        }
        let embedding = self.backend.embedding()?;
        debug!(n_embd = embedding.len(), tokens = result.tokens_evaluated, "embedding computed");
        Ok(embedding)
    }

    /// Save the context's evaluated tokens to `path`, at most `max_count` of
    /// them. A sampled token the cache has not seen yet is not saved.
    pub fn save_session(
        &self,
        path: impl AsRef<Path>,
        max_count: Option<usize>,
    ) -> Result<usize, SessionError> {
        let session = PersistedSession::new(self.embd[..self.n_past].to_vec(), self.config.n_ctx)
            .with_engine_state(self.backend.state_snapshot());
        SessionStore::save(path.as_ref(), &session, max_count)
    }

    /// Replace the context's tokens with a saved session.
    ///
    /// The context is left untouched when the file cannot be read or holds
    /// more tokens than the window.
    pub fn load_session(&mut self, path: impl AsRef<Path>) -> Result<LoadedSession, SessionError> {
        self.load_session_with_capacity(path, self.config.n_ctx)
    }

    /// Like [`load_session`](Self::load_session), refusing files with more
    /// than `capacity` tokens. The capacity never exceeds the window.
    pub fn load_session_with_capacity(
        &mut self,
        path: impl AsRef<Path>,
        capacity: usize,
    ) -> Result<LoadedSession, SessionError> {
        let capacity = capacity.min(self.config.n_ctx);
        let persisted = SessionStore::load(path.as_ref(), capacity)?;
        let prompt = self
            .backend
            .detokenize(&persisted.tokens)
            .map_err(|e| SessionError::Restore(e.to_string()))?;
        self.backend
            .restore_state(&persisted.engine_state)
            .map_err(|e| SessionError::Restore(e.to_string()))?;

        let tokens_loaded = persisted.tokens.len();
        self.embd = persisted.tokens;
        // Without engine state the cache holds none of the loaded tokens
        self.n_past = if persisted.engine_state.is_empty() {
            0
        } else {
            tokens_loaded
        };
        self.backend.truncate_cache(self.n_past);
        debug!(tokens_loaded, n_past = self.n_past, "session restored");

        Ok(LoadedSession {
            tokens_loaded,
            prompt,
        })
    }

    /// Measure prompt and generation throughput. The token buffer and cache
    /// are cleared afterwards.
    pub fn bench(&mut self, request: &BenchRequest) -> Result<BenchReport, CompletionError> {
        let report = run_bench(&mut *self.backend, &self.config, request);
        self.embd.clear();
        self.n_past = 0;
        self.backend.clear_cache();
        report
    }
}

/// Apply an emitter pass to the session and deliver its text. Returns
/// `false` when the sink has gone away.
fn dispatch<S>(emission: Emission, session: &mut GenerationSession, sink: &mut S) -> bool
where
    S: CompletionSink + ?Sized,
{
    if let Some(word) = emission.stopping_word {
        debug!("Stop string {:?} matched", word);
        session.stopped_word = true;
        session.stopping_word = Some(word);
        session.has_next_token = false;
    }
    if let Some(chunk) = emission.delivery {
        if sink.deliver(chunk).is_err() {
            warn!("Completion sink closed, stopping generation");
            session.is_interrupted = true;
            session.has_next_token = false;
            return false;
        }
    }
    true
}
