mod cli;
mod commands;

use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

fn main() {
    init_tracing();

    if let Err(err) = run() {
        error!(error = %err, "neurograde command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.name();
    let store = cli.command.store();
    debug!(
        command,
        version = env!("CARGO_PKG_VERSION"),
        db_path = %store.resolved_db_path().display(),
        record_path = %store.resolved_record_path().display(),
        "dispatching command"
    );
    let started = Instant::now();

    let outcome = match cli.command {
        Commands::Ingest(args) => commands::ingest::run(args),
        Commands::Train(args) => commands::train::run(args),
        Commands::Lookup(args) => commands::lookup::run(args),
        Commands::Status(args) => commands::status::run(args),
    };
    debug!(
        command,
        duration_ms = started.elapsed().as_millis() as u64,
        ok = outcome.is_ok(),
        "command finished"
    );
    outcome
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
