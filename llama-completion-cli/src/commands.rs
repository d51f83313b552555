//! Command handlers. Each one writes its output to the given writer so the
//! handlers can be exercised without a terminal.

use std::io::{self, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use llama_common::ValidatedConfig;
use llama_completion::{
    BenchReport, BenchRequest, CompletionConfig, CompletionContext, CompletionResult,
    CompletionSink, NullSink, PartialCompletion, SamplingParameters, ScriptedBackend,
};
use llama_completion::streaming::SinkClosed;
use tracing::{debug, warn};

use crate::cli::SamplingArgs;

/// Environment variable consulted when `--fixture` is not given.
pub const FIXTURE_ENV: &str = "LLAMA_COMPLETE_FIXTURE";

/// Everything a command needs: the loaded configuration and a context over
/// the fixture backend.
pub struct Runtime {
    pub config: CompletionConfig,
    pub context: CompletionContext,
}

impl Runtime {
    pub fn open(config_file: Option<&Path>, fixture: Option<&Path>) -> Result<Self> {
        let config = CompletionConfig::load(config_file).context("failed to load configuration")?;
        Self::with_config(config, fixture)
    }

    /// Like [`open`](Self::open), with embedding turned on for the context.
    pub fn open_for_embedding(config_file: Option<&Path>, fixture: Option<&Path>) -> Result<Self> {
        let mut config =
            CompletionConfig::load(config_file).context("failed to load configuration")?;
        config.context.embedding = true;
        Self::with_config(config, fixture)
    }

    fn with_config(config: CompletionConfig, fixture: Option<&Path>) -> Result<Self> {
        let fixture = match fixture {
            Some(path) => path.to_path_buf(),
            None => match std::env::var_os(FIXTURE_ENV) {
                Some(path) => path.into(),
                None => bail!("no model fixture given, pass --fixture or set {}", FIXTURE_ENV),
            },
        };
        let backend = ScriptedBackend::from_file(&fixture)?;
        debug!("Using fixture {}", fixture.display());

        let context = CompletionContext::new(Box::new(backend), config.context.clone())?;
        Ok(Self { config, context })
    }
}

impl SamplingArgs {
    /// Apply the flags given on the command line on top of `base`.
    pub fn apply(&self, base: &SamplingParameters) -> Result<SamplingParameters> {
        let mut params = base.clone();
        if !self.stop.is_empty() {
            params.stop = self.stop.clone();
        }
        if let Some(n_predict) = self.n_predict {
            params.n_predict = n_predict;
        }
        if let Some(n_probs) = self.n_probs {
            params.n_probs = n_probs;
        }
        if let Some(seed) = self.seed {
            params.seed = seed;
        }
        if let Some(temperature) = self.temperature {
            params.temperature = temperature;
        }
        if self.ignore_eos {
            params.ignore_eos = true;
        }
        Ok(params.validated()?)
    }
}

/// Stream a completion to `out`, or print its result as JSON.
pub fn run_complete<W: Write>(
    runtime: &mut Runtime,
    prompt: &str,
    sampling: &SamplingArgs,
    json: bool,
    out: &mut W,
) -> Result<()> {
    let params = sampling.apply(&runtime.config.sampling)?;

    if json {
        let result = runtime.context.complete(prompt, &params, &mut NullSink)?;
        serde_json::to_writer_pretty(&mut *out, &result)?;
        writeln!(out)?;
        return Ok(());
    }

    let mut sink = WriterSink::new(&mut *out);
    let result = runtime.context.complete(prompt, &params, &mut sink)?;
    if let Some(e) = sink.into_error() {
        return Err(e).context("failed to write completion output");
    }
    writeln!(out)?;

    if result.interrupted() {
        warn!("completion was interrupted");
    }
    eprintln!("{}", summary(&result));
    Ok(())
}

/// Sink writing each delivery straight to a writer. A failed write closes
/// the sink, which stops generation.
pub struct WriterSink<'a, W: Write> {
    out: &'a mut W,
    error: Option<io::Error>,
}

impl<'a, W: Write> WriterSink<'a, W> {
    pub fn new(out: &'a mut W) -> Self {
        Self { out, error: None }
    }

    /// The write error that closed the sink, if any.
    pub fn into_error(self) -> Option<io::Error> {
        self.error
    }
}

impl<W: Write> CompletionSink for WriterSink<'_, W> {
    fn deliver(&mut self, chunk: PartialCompletion) -> Result<(), SinkClosed> {
        if self.error.is_some() {
            return Err(SinkClosed);
        }
        match self
            .out
            .write_all(chunk.token.as_bytes())
            .and_then(|_| self.out.flush())
        {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(error = %e, "output closed, stopping generation");
                self.error = Some(e);
                Err(SinkClosed)
            }
        }
    }
}

/// One-line run summary printed after streamed output.
pub fn summary(result: &CompletionResult) -> String {
    format!(
        "stop: {} | predicted: {} ({:.2} t/s) | prompt: {} | cached: {}{}",
        result.stop_reason,
        result.tokens_predicted,
        result.timings.predicted_per_second,
        result.tokens_evaluated,
        result.tokens_cached,
        if result.truncated { " | truncated" } else { "" }
    )
}

/// Evaluate `prompt` without generating and save the context's tokens.
pub fn run_session_save<W: Write>(
    runtime: &mut Runtime,
    prompt: &str,
    path: &Path,
    max_count: Option<usize>,
    out: &mut W,
) -> Result<()> {
    let params = runtime.config.sampling.clone().with_n_predict(0);
    runtime.context.complete(prompt, &params, &mut NullSink)?;

    let saved = runtime
        .context
        .save_session(path, max_count)
        .with_context(|| format!("failed to save session to {}", path.display()))?;
    writeln!(out, "Saved {} tokens to {}", saved, path.display())?;
    Ok(())
}

/// Load a session file into the context and print what it restored.
pub fn run_session_load<W: Write>(
    runtime: &mut Runtime,
    path: &Path,
    capacity: Option<usize>,
    out: &mut W,
) -> Result<()> {
    let capacity = capacity.unwrap_or(runtime.context.config().n_ctx);
    let loaded = runtime
        .context
        .load_session_with_capacity(path, capacity)
        .with_context(|| format!("failed to load session from {}", path.display()))?;
    serde_json::to_writer_pretty(&mut *out, &loaded)?;
    writeln!(out)?;
    Ok(())
}

/// Print the embedding of `prompt` as JSON.
pub fn run_embed<W: Write>(runtime: &mut Runtime, prompt: &str, out: &mut W) -> Result<()> {
    let embedding = runtime.context.embedding(prompt)?;
    serde_json::to_writer(&mut *out, &serde_json::json!({ "embedding": embedding }))?;
    writeln!(out)?;
    Ok(())
}

/// Run the benchmark and print a markdown row or a JSON array.
pub fn run_bench<W: Write>(
    runtime: &mut Runtime,
    request: &BenchRequest,
    json: bool,
    out: &mut W,
) -> Result<()> {
    let report = runtime.context.bench(request)?;
    if json {
        writeln!(out, "{}", report.to_json())?;
    } else {
        writeln!(out, "{}", BenchReport::markdown_header())?;
        writeln!(out, "{}", report)?;
    }
    Ok(())
}
