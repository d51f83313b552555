//! llama-complete - streaming completion command-line interface.
//!
//! Exit codes:
//! - 0: Success
//! - 1: Error

use std::io;

use anyhow::Result;
use clap::Parser;
use llama_common::init_tracing;
use llama_complete::commands::{
    run_bench, run_complete, run_embed, run_session_load, run_session_save,
};
use llama_complete::{Cli, Commands, Runtime, SessionCommands};
use llama_completion::BenchRequest;

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug, &["llama-complete", "llama-completion"]);

    let exit_code = match dispatch_command(cli) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

/// Dispatch a parsed CLI to the appropriate command handler.
fn dispatch_command(cli: Cli) -> Result<()> {
    let mut runtime = match cli.command {
        Commands::Embed { .. } => {
            Runtime::open_for_embedding(cli.config.as_deref(), cli.fixture.as_deref())?
        }
        _ => Runtime::open(cli.config.as_deref(), cli.fixture.as_deref())?,
    };
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Commands::Complete {
            prompt,
            sampling,
            json,
        } => run_complete(&mut runtime, &prompt, &sampling, json, &mut out),
        Commands::Embed { prompt } => run_embed(&mut runtime, &prompt, &mut out),
        Commands::Session { command } => match command {
            SessionCommands::Save {
                prompt,
                path,
                max_count,
            } => run_session_save(&mut runtime, &prompt, &path, max_count, &mut out),
            SessionCommands::Load { path, capacity } => {
                run_session_load(&mut runtime, &path, capacity, &mut out)
            }
        },
        Commands::Bench {
            pp,
            tg,
            pl,
            nr,
            json,
        } => run_bench(
            &mut runtime,
            &BenchRequest::new(pp, tg, pl, nr),
            json,
            &mut out,
        ),
    }
}
