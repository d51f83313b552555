//! Prompt-processing and token-generation throughput measurement.

use crate::backend::InferenceBackend;
use crate::generation::{CompletionError, ContextConfig};
use crate::types::TokenId;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

/// Benchmark shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchRequest {
    /// Prompt tokens evaluated per repetition.
    pub pp: usize,
    /// Generation steps per repetition.
    pub tg: usize,
    /// Parallel sequences evaluated at each generation step.
    pub pl: usize,
    /// Repetitions.
    pub nr: usize,
}

impl BenchRequest {
    pub fn new(pp: usize, tg: usize, pl: usize, nr: usize) -> Self {
        Self { pp, tg, pl, nr }
    }

    fn validate(&self, config: &ContextConfig) -> Result<(), CompletionError> {
        if self.pp == 0 || self.tg == 0 || self.pl == 0 || self.nr == 0 {
            return Err(CompletionError::InvalidBenchmark(
                "pp, tg, pl and nr must all be greater than 0".to_string(),
            ));
        }
        if self.pp > config.n_ctx {
            return Err(CompletionError::InvalidBenchmark(format!(
                "pp ({}) exceeds the context window ({})",
                self.pp, config.n_ctx
            )));
        }
        if self.tg > config.n_ctx {
            return Err(CompletionError::InvalidBenchmark(format!(
                "tg ({}) exceeds the context window ({})",
                self.tg, config.n_ctx
            )));
        }
        Ok(())
    }
}

/// Benchmark outcome, in tokens per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchReport {
    pub model_description: String,
    pub model_size: u64,
    pub model_n_params: u64,
    pub pp_avg: f64,
    pub pp_std: f64,
    pub tg_avg: f64,
    pub tg_std: f64,
}

impl BenchReport {
    /// `[description, size, n_params, pp_avg, pp_std, tg_avg, tg_std]`
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!([
            self.model_description,
            self.model_size,
            self.model_n_params,
            self.pp_avg,
            self.pp_std,
            self.tg_avg,
            self.tg_std,
        ])
    }

    pub fn markdown_header() -> &'static str {
        "| model | size | params | pp t/s | tg t/s |\n| --- | --- | --- | --- | --- |"
    }
}

/// One markdown table row.
impl std::fmt::Display for BenchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "| {} | {:.2} MiB | {:.2} M | {:.2} ± {:.2} | {:.2} ± {:.2} |",
            self.model_description,
            self.model_size as f64 / 1024.0 / 1024.0,
            self.model_n_params as f64 / 1e6,
            self.pp_avg,
            self.pp_std,
            self.tg_avg,
            self.tg_std
        )
    }
}

/// Mean and sample standard deviation; the deviation is 0 for one sample.
fn mean_and_std(samples: &[f64]) -> (f64, f64) {
    let n = samples.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let avg = samples.iter().sum::<f64>() / n as f64;
    if n == 1 {
        return (avg, 0.0);
    }
    let var = samples.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / (n - 1) as f64;
    (avg, var.max(0.0).sqrt())
}

fn rate(tokens: usize, seconds: f64) -> f64 {
    if seconds <= 0.0 {
        0.0
    } else {
        tokens as f64 / seconds
    }
}

pub(crate) fn run_bench(
    backend: &mut dyn InferenceBackend,
    config: &ContextConfig,
    request: &BenchRequest,
) -> Result<BenchReport, CompletionError> {
    request.validate(config)?;
    let info = backend.model_info();
    let filler: TokenId = 0;
    let prompt = vec![filler; request.pp];

    let mut pp_speeds = Vec::with_capacity(request.nr);
    let mut tg_speeds = Vec::with_capacity(request.nr);

    for repetition in 0..request.nr {
        backend.clear_cache();

        let started = Instant::now();
        for (index, chunk) in prompt.chunks(config.n_batch).enumerate() {
            backend.evaluate(chunk, index * config.n_batch)?;
        }
        let pp_seconds = started.elapsed().as_secs_f64();

        backend.clear_cache();

        let started = Instant::now();
        for pos in 0..request.tg {
            backend.evaluate_parallel(filler, pos, request.pl)?;
        }
        let tg_seconds = started.elapsed().as_secs_f64();

        backend.clear_cache();

        let pp_speed = rate(request.pp, pp_seconds);
        let tg_speed = rate(request.pl * request.tg, tg_seconds);
        debug!(repetition, pp_speed, tg_speed, "bench repetition finished");
        pp_speeds.push(pp_speed);
        tg_speeds.push(tg_speed);
    }

    let (pp_avg, pp_std) = mean_and_std(&pp_speeds);
    let (tg_avg, tg_std) = mean_and_std(&tg_speeds);
    info!(pp_avg, tg_avg, "bench finished");

    Ok(BenchReport {
        model_description: info.description,
        model_size: info.size_bytes,
        model_n_params: info.n_params,
        pp_avg,
        pp_std,
        tg_avg,
        tg_std,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;

    #[test]
    fn test_mean_and_sample_std() {
        assert_eq!(mean_and_std(&[]), (0.0, 0.0));
        assert_eq!(mean_and_std(&[5.0]), (5.0, 0.0));
        let (avg, std) = mean_and_std(&[2.0, 4.0, 6.0]);
        assert_eq!(avg, 4.0);
        assert!((std - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_rate_handles_zero_time() {
        assert_eq!(rate(10, 0.0), 0.0);
        assert_eq!(rate(10, 2.0), 5.0);
    }

    #[test]
    fn test_run_bench_clears_cache_and_reports_model() {
        let mut backend = ScriptedBackend::from_pieces(&["a", "b"]);
        let probe = backend.probe();
        let config = ContextConfig::new(32).with_n_batch(4);
        let report = run_bench(&mut backend, &config, &BenchRequest::new(10, 3, 2, 2)).unwrap();

        let record = probe.snapshot();
        assert!(record.cache.is_empty());
        // per repetition: 3 prompt chunks plus 3 steps of 2 sequences
        assert_eq!(record.evaluations.len(), 2 * (3 + 3 * 2));
        assert_eq!(report.model_description, "scripted");
        assert_eq!(report.model_n_params, 4);
        assert!(report.pp_std >= 0.0);
    }

    #[test]
    fn test_invalid_requests() {
        let mut backend = ScriptedBackend::from_pieces(&["a"]);
        let config = ContextConfig::new(16);
        assert!(matches!(
            run_bench(&mut backend, &config, &BenchRequest::new(0, 1, 1, 1)),
            Err(CompletionError::InvalidBenchmark(_))
        ));
        assert!(matches!(
            run_bench(&mut backend, &config, &BenchRequest::new(64, 1, 1, 1)),
            Err(CompletionError::InvalidBenchmark(_))
        ));
    }

    #[test]
    fn test_report_renderings() {
        let report = BenchReport {
            model_description: "tiny".to_string(),
            model_size: 2 * 1024 * 1024,
            model_n_params: 3_000_000,
            pp_avg: 100.0,
            pp_std: 1.5,
            tg_avg: 20.0,
            tg_std: 0.0,
        };
        let json = report.to_json();
        assert_eq!(json[0], "tiny");
        assert_eq!(json[3], 100.0);
        assert_eq!(
            report.to_string(),
            "| tiny | 2.00 MiB | 3.00 M | 100.00 ± 1.50 | 20.00 ± 0.00 |"
        );
        assert!(BenchReport::markdown_header().starts_with("| model"));
    }
}
