//! End-of-run timing summary.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Raw timing counters accumulated during a run.
///
/// The controller keeps its own counters; an engine that tracks timings
/// itself can report them through
/// [`InferenceBackend::timings`](crate::backend::InferenceBackend::timings)
/// and those take precedence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingCounters {
    pub prompt_ms: f64,
    pub prompt_tokens: usize,
    pub generation_ms: f64,
    pub generation_tokens: usize,
}

impl TimingCounters {
    pub fn record_prompt(&mut self, elapsed: Duration, tokens: usize) {
        self.prompt_ms += elapsed.as_secs_f64() * 1e3;
        self.prompt_tokens += tokens;
    }

    pub fn record_generation_time(&mut self, elapsed: Duration) {
        self.generation_ms += elapsed.as_secs_f64() * 1e3;
    }

    pub fn record_generated_token(&mut self) {
        self.generation_tokens += 1;
    }
}

/// Throughput and latency summary derived once a run has finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub prompt_n: usize,
    pub prompt_ms: f64,
    pub prompt_per_token_ms: f64,
    pub prompt_per_second: f64,
    pub predicted_n: usize,
    pub predicted_ms: f64,
    pub predicted_per_token_ms: f64,
    pub predicted_per_second: f64,
}

impl RunMetrics {
    pub fn from_counters(counters: &TimingCounters) -> Self {
        Self {
            prompt_n: counters.prompt_tokens,
            prompt_ms: counters.prompt_ms,
            prompt_per_token_ms: per_token_ms(counters.prompt_ms, counters.prompt_tokens),
            prompt_per_second: per_second(counters.prompt_ms, counters.prompt_tokens),
            predicted_n: counters.generation_tokens,
            predicted_ms: counters.generation_ms,
            predicted_per_token_ms: per_token_ms(
                counters.generation_ms,
                counters.generation_tokens,
            ),
            predicted_per_second: per_second(counters.generation_ms, counters.generation_tokens),
        }
    }
}

impl From<TimingCounters> for RunMetrics {
    fn from(counters: TimingCounters) -> Self {
        Self::from_counters(&counters)
    }
}

fn per_token_ms(ms: f64, tokens: usize) -> f64 {
    if tokens == 0 || ms <= 0.0 {
        0.0
    } else {
        ms / tokens as f64
    }
}

fn per_second(ms: f64, tokens: usize) -> f64 {
    if tokens == 0 || ms <= 0.0 {
        0.0
    } else {
        1e3 / ms * tokens as f64
    }
}
