//! CLI definition for the llama-complete command-line interface.
//!
//! Only depends on `clap` and `std`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// llama-complete - streaming completion over a recorded model fixture
#[derive(Parser, Debug)]
#[command(name = "llama-complete")]
#[command(version)]
#[command(about = "Streaming text completion with stop strings and session files")]
pub struct Cli {
    /// Enable debug output to stderr
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Recorded model fixture (JSON) to run against
    #[arg(short, long, global = true, value_name = "PATH")]
    pub fixture: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Complete a prompt, streaming text to stdout as it becomes safe to show
    Complete {
        /// Prompt text
        #[arg(short, long)]
        prompt: String,

        #[command(flatten)]
        sampling: SamplingArgs,

        /// Print the final result as JSON instead of streaming text
        #[arg(long)]
        json: bool,
    },
    /// Print the embedding of a prompt as JSON
    Embed {
        /// Text to embed
        #[arg(short, long)]
        prompt: String,
    },
    /// Save or load a context session file
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Measure prompt processing and generation throughput
    Bench {
        /// Prompt tokens per repetition
        #[arg(long, default_value_t = 128)]
        pp: usize,
        /// Generation steps per repetition
        #[arg(long, default_value_t = 32)]
        tg: usize,
        /// Parallel sequences per generation step
        #[arg(long, default_value_t = 1)]
        pl: usize,
        /// Repetitions
        #[arg(long, default_value_t = 3)]
        nr: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// Evaluate a prompt and save the context's tokens
    Save {
        /// Prompt to evaluate before saving
        #[arg(short, long)]
        prompt: String,
        /// Session file to write
        #[arg(long, value_name = "PATH")]
        path: PathBuf,
        /// Save at most this many tokens
        #[arg(long)]
        max_count: Option<usize>,
    },
    /// Load a session file and print what it holds
    Load {
        /// Session file to read
        #[arg(long, value_name = "PATH")]
        path: PathBuf,
        /// Refuse files holding more tokens than this (defaults to the context size)
        #[arg(long)]
        capacity: Option<usize>,
    },
}

/// Per-run overrides for the configured sampling parameters.
#[derive(Args, Debug, Default)]
pub struct SamplingArgs {
    /// Stop string (repeatable)
    #[arg(short, long = "stop", value_name = "TEXT")]
    pub stop: Vec<String>,
    /// Maximum tokens to generate (-1 for unlimited)
    #[arg(short = 'n', long, allow_hyphen_values = true)]
    pub n_predict: Option<i32>,
    /// Candidate probabilities to report per token
    #[arg(long)]
    pub n_probs: Option<usize>,
    /// Sampler seed (-1 for random)
    #[arg(long, allow_hyphen_values = true)]
    pub seed: Option<i64>,
    /// Sampling temperature
    #[arg(short, long)]
    pub temperature: Option<f32>,
    /// Keep generating past the end-of-sequence token
    #[arg(long)]
    pub ignore_eos: bool,
}
