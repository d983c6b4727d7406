//! Procwrap - run child processes with timeouts and concurrency limits.
//!
//! - `procwrap run` runs one command in the foreground and relays its output
//!   and exit status
//! - `procwrap batch` runs many commands through a bounded pool and reports
//!   how each one ended

mod cli;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use cli::{execute, Cli};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    cli::logging::init(cli.verbose);
    execute(cli).await
}
