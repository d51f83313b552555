//! Explicit registry of live completion contexts.

use crate::backend::InferenceBackend;
use crate::bench::{BenchReport, BenchRequest};
use crate::generation::{
    CompletionContext, CompletionError, ContextConfig, InterruptHandle, PredictingFlag,
};
use crate::streaming::{stream_completion, CompletionSink, CompletionStream};
use crate::types::{CompletionResult, ContextId, SamplingParameters};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use tracing::{debug, info};

/// Default maximum number of live contexts.
pub const DEFAULT_CONTEXT_LIMIT: usize = 8;

#[derive(Clone)]
struct RegistryEntry {
    context: Arc<Mutex<CompletionContext>>,
    interrupt: InterruptHandle,
    predicting: PredictingFlag,
}

/// Owns contexts by [`ContextId`] and serializes access to each.
///
/// Every context sits behind its own mutex. Operations on a context that is
/// already generating fail with [`CompletionError::Busy`] instead of
/// waiting. Interrupting and the predicting check go through handles that do
/// not need the context lock.
pub struct ContextRegistry {
    contexts: Mutex<HashMap<ContextId, RegistryEntry>>,
    limit: usize,
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_LIMIT)
    }
}

impl ContextRegistry {
    pub fn new(limit: usize) -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ContextId, RegistryEntry>> {
        self.contexts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entry(&self, id: ContextId) -> Result<RegistryEntry, CompletionError> {
        self.entries()
            .get(&id)
            .cloned()
            .ok_or(CompletionError::ContextNotFound(id))
    }

    /// Create a context over `backend` and register it.
    pub fn register(
        &self,
        backend: Box<dyn InferenceBackend>,
        config: ContextConfig,
    ) -> Result<ContextId, CompletionError> {
        let mut entries = self.entries();
        if entries.len() >= self.limit {
            return Err(CompletionError::ContextLimit { limit: self.limit });
        }

        let context = CompletionContext::new(backend, config)?;
        let id = ContextId::new();
        entries.insert(
            id,
            RegistryEntry {
                interrupt: context.interrupt_handle(),
                predicting: context.predicting_flag(),
                context: Arc::new(Mutex::new(context)),
            },
        );
        info!(context_id = %id, live = entries.len(), "context registered");
        Ok(id)
    }

    /// Remove a context. A second release of the same id fails with
    /// `ContextNotFound`.
    pub fn release(&self, id: ContextId) -> Result<(), CompletionError> {
        let entry = self
            .entries()
            .remove(&id)
            .ok_or(CompletionError::ContextNotFound(id))?;
        entry.interrupt.interrupt();
        info!(context_id = %id, "context released");
        Ok(())
    }

    /// Run `f` with exclusive access to the context.
    pub fn with_context<R>(
        &self,
        id: ContextId,
        f: impl FnOnce(&mut CompletionContext) -> R,
    ) -> Result<R, CompletionError> {
        let entry = self.entry(id)?;
        let mut guard = match entry.context.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!(context_id = %id, "context is busy");
                return Err(CompletionError::Busy);
            }
        };
        Ok(f(&mut guard))
    }

    pub fn complete<S>(
        &self,
        id: ContextId,
        prompt: &str,
        params: &SamplingParameters,
        sink: &mut S,
    ) -> Result<CompletionResult, CompletionError>
    where
        S: CompletionSink + ?Sized,
    {
        self.with_context(id, |context| context.complete(prompt, params, sink))?
    }

    pub fn embedding(&self, id: ContextId, text: &str) -> Result<Vec<f32>, CompletionError> {
        self.with_context(id, |context| context.embedding(text))?
    }

    /// Stream a completion from a blocking worker. Requires a Tokio runtime.
    pub fn stream(
        &self,
        id: ContextId,
        prompt: impl Into<String>,
        params: SamplingParameters,
        buffer: usize,
    ) -> Result<CompletionStream, CompletionError> {
        let entry = self.entry(id)?;
        Ok(stream_completion(entry.context, prompt.into(), params, buffer))
    }

    /// Ask the context's current run to stop. Does not wait for it.
    pub fn stop_completion(&self, id: ContextId) -> Result<(), CompletionError> {
        let entry = self.entry(id)?;
        entry.interrupt.interrupt();
        debug!(context_id = %id, "interrupt requested");
        Ok(())
    }

    pub fn is_predicting(&self, id: ContextId) -> Result<bool, CompletionError> {
        Ok(self.entry(id)?.predicting.get())
    }

    pub fn bench(&self, id: ContextId, request: &BenchRequest) -> Result<BenchReport, CompletionError> {
        if self.is_predicting(id)? {
            return Err(CompletionError::Busy);
        }
        self.with_context(id, |context| context.bench(request))?
    }
}
