mod capture;
mod cli;
mod commands;
mod comparator;
mod config;
mod context;
mod metrics;
mod model;
mod pipeline;
mod policy;
mod stage;
mod supervisor;
mod util;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

fn main() {
    init_tracing();

    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            error!(error = %err, "command failed");
            for cause in err.chain().skip(1) {
                error!(cause = %cause, "caused by");
            }
            std::process::exit(1);
        }
    }
}

/// Runs the selected command; `Ok(false)` means the stage or verdict failed.
fn run() -> Result<bool> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Exec(args) => commands::exec::run(args),
        Commands::Capture(args) => commands::capture::run(args),
        Commands::Compare(args) => commands::compare::run(args),
        Commands::SetupDiff(args) => commands::setup_diff::run(args),
        Commands::Report(args) => commands::report::run(args),
        Commands::Status(args) => commands::status::run(args),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
