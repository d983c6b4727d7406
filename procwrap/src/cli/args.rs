//! CLI argument definitions.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

/// Procwrap - run child processes with timeouts and concurrency limits
#[derive(Parser, Debug)]
#[command(name = "procwrap")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log more (-v debug, -vv trace); `PROCWRAP_LOG` takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one command in the foreground, relaying its output and exit code
    Run {
        /// Kill the command after this many milliseconds (0 = never)
        #[arg(long, env = "PROCWRAP_TIMEOUT_MS", default_value_t = 0)]
        timeout_ms: u64,

        /// Count the timeout from the spawn request instead of the spawn
        #[arg(long)]
        timeout_from_request: bool,

        /// Join the arguments into one string and run it through /bin/sh
        #[arg(long)]
        shell: bool,

        /// Command and its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Run shell commands or manifest jobs through a pool
    Batch {
        /// Maximum number of jobs running at once
        #[arg(short = 'j', long, env = "PROCWRAP_JOBS", default_value_t = 4)]
        jobs: usize,

        /// Default per-job timeout in milliseconds (0 = never)
        #[arg(long, env = "PROCWRAP_TIMEOUT_MS", default_value_t = 0)]
        timeout_ms: u64,

        /// JSON manifest with a `jobs` array
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Shell commands, run after the manifest jobs
        commands: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["procwrap", "-v", "run", "--timeout-ms", "50", "--", "ls", "-la"]).unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Run {
                timeout_ms,
                timeout_from_request,
                shell,
                command,
            } => {
                assert_eq!(timeout_ms, 50);
                assert!(!timeout_from_request);
                assert!(!shell);
                assert_eq!(command, vec!["ls", "-la"]);
            }
            Commands::Batch { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn test_run_requires_command() {
        assert!(Cli::try_parse_from(["procwrap", "run"]).is_err());
    }

    #[test]
    fn test_parse_batch() {
        let cli = Cli::try_parse_from(["procwrap", "batch", "-j", "2", "--json", "echo a", "echo b"]).unwrap();
        match cli.command {
            Commands::Batch {
                jobs,
                json,
                manifest,
                commands,
                ..
            } => {
                assert_eq!(jobs, 2);
                assert!(json);
                assert!(manifest.is_none());
                assert_eq!(commands, vec!["echo a", "echo b"]);
            }
            Commands::Run { .. } => panic!("expected batch"),
        }
    }
}
