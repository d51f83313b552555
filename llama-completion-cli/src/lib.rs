//! Command-line front end for `llama-completion`.
//!
//! The binary loads layered configuration, builds a completion context over a
//! recorded model fixture and runs one command against it:
//!
//! - `complete`: stream a completion to stdout
//! - `session save` / `session load`: persist and restore the context tokens
//! - `bench`: measure prompt and generation throughput

pub mod cli;
pub mod commands;

pub use cli::{Cli, Commands, SamplingArgs, SessionCommands};
pub use commands::Runtime;
