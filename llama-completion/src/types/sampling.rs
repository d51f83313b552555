//! Sampling parameters supplied per run and the resolved sampler configuration
//! handed to the backend.

use crate::types::TokenId;
use llama_common::ValidatedConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A configuration value failed validation.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ParameterError {
    pub field: &'static str,
    pub reason: String,
}

impl ParameterError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Adjustment applied to one token's score before sampling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogitBias {
    /// Never sample this token.
    Exclude,
    /// Add this value to the token's logit.
    Add(f32),
}

impl LogitBias {
    pub fn value(&self) -> f32 {
        match self {
            LogitBias::Exclude => f32::NEG_INFINITY,
            LogitBias::Add(bias) => *bias,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogitBiasEntry {
    pub token: TokenId,
    pub bias: LogitBias,
}

/// Parameters for a single completion run.
///
/// These are immutable for the duration of a run. Values are checked with
/// [`ValidatedConfig::validate`] before the sampler is configured, so a bad
/// request never reaches prompt evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParameters {
    /// Maximum number of tokens to generate. Negative means unlimited.
    pub n_predict: i32,
    /// Number of alternative candidates to report per token. Zero disables
    /// probability reporting.
    pub n_probs: usize,
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub typical_p: f32,
    pub tfs_z: f32,
    pub xtc_threshold: f32,
    pub xtc_probability: f32,
    /// Lookback window for the repetition penalties. `-1` means the whole
    /// context, `0` disables them.
    pub penalty_last_n: i32,
    pub penalty_repeat: f32,
    pub penalty_freq: f32,
    pub penalty_present: f32,
    pub penalize_nl: bool,
    /// Mirostat mode: 0 disabled, 1 or 2 for the respective algorithm.
    pub mirostat: u8,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    /// RNG seed. `-1` picks a random seed per run.
    pub seed: i64,
    /// Stop strings, checked in order.
    pub stop: Vec<String>,
    pub ignore_eos: bool,
    pub logit_bias: Vec<LogitBiasEntry>,
    /// Grammar text constraining the output, passed to the backend verbatim.
    pub grammar: Option<String>,
    /// Worker threads for the backend. Zero lets the backend decide.
    pub n_threads: u32,
}

impl Default for SamplingParameters {
    fn default() -> Self {
        Self {
            n_predict: -1,
            n_probs: 0,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            typical_p: 1.0,
            tfs_z: 1.0,
            xtc_threshold: 0.0,
            xtc_probability: 0.0,
            penalty_last_n: 64,
            penalty_repeat: 1.0,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            penalize_nl: false,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            seed: -1,
            stop: Vec::new(),
            ignore_eos: false,
            logit_bias: Vec::new(),
            grammar: None,
            n_threads: 0,
        }
    }
}

impl SamplingParameters {
    pub fn with_n_predict(mut self, n_predict: i32) -> Self {
        self.n_predict = n_predict;
        self
    }

    pub fn with_n_probs(mut self, n_probs: usize) -> Self {
        self.n_probs = n_probs;
        self
    }

    pub fn with_stop<I, S>(mut self, stop: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop = stop.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_ignore_eos(mut self, ignore_eos: bool) -> Self {
        self.ignore_eos = ignore_eos;
        self
    }

    pub fn with_logit_bias(mut self, token: TokenId, bias: LogitBias) -> Self {
        self.logit_bias.push(LogitBiasEntry { token, bias });
        self
    }

    pub fn with_grammar(mut self, grammar: impl Into<String>) -> Self {
        self.grammar = Some(grammar.into());
        self
    }

    /// Resolve these parameters into the configuration applied to the sampler.
    ///
    /// A seed of `-1` becomes a random seed. Bias entries for tokens outside
    /// `[0, n_vocab)` are dropped, and `ignore_eos` excludes the EOS token.
    pub fn sampler_config(&self, eos_token: TokenId, n_vocab: usize) -> SamplerConfig {
        let seed = if self.seed < 0 {
            rand::random::<u32>()
        } else {
            self.seed as u32
        };

        let mut logit_bias: Vec<(TokenId, f32)> = self
            .logit_bias
            .iter()
            .filter(|entry| entry.token >= 0 && (entry.token as usize) < n_vocab)
            .map(|entry| (entry.token, entry.bias.value()))
            .collect();

        if self.ignore_eos {
            logit_bias.push((eos_token, f32::NEG_INFINITY));
        }

        SamplerConfig {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            min_p: self.min_p,
            typical_p: self.typical_p,
            tfs_z: self.tfs_z,
            xtc_threshold: self.xtc_threshold,
            xtc_probability: self.xtc_probability,
            penalty_last_n: self.penalty_last_n,
            penalty_repeat: self.penalty_repeat,
            penalty_freq: self.penalty_freq,
            penalty_present: self.penalty_present,
            penalize_nl: self.penalize_nl,
            mirostat: self.mirostat,
            mirostat_tau: self.mirostat_tau,
            mirostat_eta: self.mirostat_eta,
            seed,
            n_probs: self.n_probs,
            logit_bias,
            grammar: self.grammar.clone(),
            n_threads: self.n_threads,
        }
    }
}

fn check_unit(field: &'static str, value: f32) -> Result<(), ParameterError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ParameterError::new(
            field,
            format!("must be between 0.0 and 1.0, got {}", value),
        ));
    }
    Ok(())
}

fn check_non_negative(field: &'static str, value: f32) -> Result<(), ParameterError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ParameterError::new(
            field,
            format!("must be a finite non-negative number, got {}", value),
        ));
    }
    Ok(())
}

fn prefer<T: PartialEq>(value: T, builtin: T, fallback: T) -> T {
    if value != builtin {
        value
    } else {
        fallback
    }
}

impl ValidatedConfig for SamplingParameters {
    type Error = ParameterError;

    fn validate(&self) -> Result<(), Self::Error> {
        check_non_negative("temperature", self.temperature)?;
        check_unit("top_p", self.top_p)?;
        check_unit("min_p", self.min_p)?;
        check_unit("typical_p", self.typical_p)?;
        check_unit("xtc_threshold", self.xtc_threshold)?;
        check_unit("xtc_probability", self.xtc_probability)?;
        check_non_negative("tfs_z", self.tfs_z)?;
        check_non_negative("penalty_repeat", self.penalty_repeat)?;
        check_non_negative("mirostat_tau", self.mirostat_tau)?;
        check_non_negative("mirostat_eta", self.mirostat_eta)?;

        if !self.penalty_freq.is_finite() {
            return Err(ParameterError::new("penalty_freq", "must be finite"));
        }
        if !self.penalty_present.is_finite() {
            return Err(ParameterError::new("penalty_present", "must be finite"));
        }
        if self.penalty_last_n < -1 {
            return Err(ParameterError::new(
                "penalty_last_n",
                format!("must be -1 or greater, got {}", self.penalty_last_n),
            ));
        }
        if self.mirostat > 2 {
            return Err(ParameterError::new(
                "mirostat",
                format!("must be 0, 1 or 2, got {}", self.mirostat),
            ));
        }
        if self.seed < -1 || self.seed > i64::from(u32::MAX) {
            return Err(ParameterError::new(
                "seed",
                format!("must be -1 or fit in 32 bits, got {}", self.seed),
            ));
        }
        if let Some(index) = self.stop.iter().position(|s| s.is_empty()) {
            return Err(ParameterError::new(
                "stop",
                format!("stop string at index {} is empty", index),
            ));
        }
        for entry in &self.logit_bias {
            if let LogitBias::Add(bias) = entry.bias {
                if !bias.is_finite() {
                    return Err(ParameterError::new(
                        "logit_bias",
                        format!(
                            "bias for token {} must be finite, use exclude instead",
                            entry.token
                        ),
                    ));
                }
            }
        }
        if let Some(grammar) = &self.grammar {
            if grammar.trim().is_empty() {
                return Err(ParameterError::new("grammar", "grammar text is empty"));
            }
        }
        Ok(())
    }

    fn merge_with_defaults(self, defaults: Self) -> Self {
        let builtin = Self::default();
        Self {
            n_predict: prefer(self.n_predict, builtin.n_predict, defaults.n_predict),
            n_probs: prefer(self.n_probs, builtin.n_probs, defaults.n_probs),
            temperature: prefer(self.temperature, builtin.temperature, defaults.temperature),
            top_k: prefer(self.top_k, builtin.top_k, defaults.top_k),
            top_p: prefer(self.top_p, builtin.top_p, defaults.top_p),
            min_p: prefer(self.min_p, builtin.min_p, defaults.min_p),
            typical_p: prefer(self.typical_p, builtin.typical_p, defaults.typical_p),
            tfs_z: prefer(self.tfs_z, builtin.tfs_z, defaults.tfs_z),
            xtc_threshold: prefer(
                self.xtc_threshold,
                builtin.xtc_threshold,
                defaults.xtc_threshold,
            ),
            xtc_probability: prefer(
                self.xtc_probability,
                builtin.xtc_probability,
                defaults.xtc_probability,
            ),
            penalty_last_n: prefer(
                self.penalty_last_n,
                builtin.penalty_last_n,
                defaults.penalty_last_n,
            ),
            penalty_repeat: prefer(
                self.penalty_repeat,
                builtin.penalty_repeat,
                defaults.penalty_repeat,
            ),
            penalty_freq: prefer(self.penalty_freq, builtin.penalty_freq, defaults.penalty_freq),
            penalty_present: prefer(
                self.penalty_present,
                builtin.penalty_present,
                defaults.penalty_present,
            ),
            penalize_nl: self.penalize_nl || defaults.penalize_nl,
            mirostat: prefer(self.mirostat, builtin.mirostat, defaults.mirostat),
            mirostat_tau: prefer(self.mirostat_tau, builtin.mirostat_tau, defaults.mirostat_tau),
            mirostat_eta: prefer(self.mirostat_eta, builtin.mirostat_eta, defaults.mirostat_eta),
            seed: prefer(self.seed, builtin.seed, defaults.seed),
            stop: if self.stop.is_empty() {
                defaults.stop
            } else {
                self.stop
            },
            ignore_eos: self.ignore_eos || defaults.ignore_eos,
            logit_bias: if self.logit_bias.is_empty() {
                defaults.logit_bias
            } else {
                self.logit_bias
            },
            grammar: self.grammar.or(defaults.grammar),
            n_threads: prefer(self.n_threads, builtin.n_threads, defaults.n_threads),
        }
    }

    fn description() -> &'static str {
        "Sampling parameters for a completion run"
    }
}

/// Sampler configuration after seed and logit-bias resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplerConfig {
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub typical_p: f32,
    pub tfs_z: f32,
    pub xtc_threshold: f32,
    pub xtc_probability: f32,
    pub penalty_last_n: i32,
    pub penalty_repeat: f32,
    pub penalty_freq: f32,
    pub penalty_present: f32,
    pub penalize_nl: bool,
    pub mirostat: u8,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub seed: u32,
    pub n_probs: usize,
    pub logit_bias: Vec<(TokenId, f32)>,
    pub grammar: Option<String>,
    pub n_threads: u32,
}
