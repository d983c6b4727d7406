//! CLI command execution.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use procwrap::process::{
    Accumulate, Command, ExitOutcome, IoDescriptor, PipeDirection, ProcessConfig, ProcessHandle,
    ProcessPool, ProcessState, KILL_SIGNAL, STDERR, STDIN, STDOUT,
};

use super::args::{Cli, Commands};

/// Exit status reported for a child killed by `signal`, following the
/// shell convention.
const fn signal_exit(signal: i32) -> i32 {
    128 + signal
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Process exit status for a batch run.
const fn batch_status(failed: usize) -> i32 {
    if failed == 0 {
        0
    } else {
        1
    }
}

// === Manifest ===

/// Job manifest read by `batch --manifest`.
#[derive(Debug, Deserialize)]
struct Manifest {
    jobs: Vec<JobSpec>,
}

#[derive(Debug, Deserialize)]
struct JobSpec {
    #[serde(default)]
    name: Option<String>,
    command: JobCommand,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    working_dir: Option<PathBuf>,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// A shell string, or an argument vector executed directly.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JobCommand {
    Shell(String),
    Argv(Vec<String>),
}

impl JobSpec {
    fn from_shell(script: String) -> Self {
        Self {
            name: None,
            command: JobCommand::Shell(script),
            timeout_ms: None,
            working_dir: None,
            env: HashMap::new(),
        }
    }

    fn to_command(&self) -> Command {
        let mut command = match &self.command {
            JobCommand::Shell(script) => Command::shell(script.clone()),
            JobCommand::Argv(argv) => Command::from_argv(argv.iter().cloned()),
        };
        if let Some(dir) = &self.working_dir {
            command = command.working_dir(dir);
        }
        command.envs(self.env.clone())
    }
}

fn load_manifest(path: &Path) -> Result<Vec<JobSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    let manifest: Manifest = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse manifest {}", path.display()))?;
    Ok(manifest.jobs)
}

// === Report ===

#[derive(Debug, Serialize)]
struct JobReport {
    index: usize,
    name: String,
    state: ProcessState,
    started_at: Option<DateTime<Utc>>,
    outcome: Option<ExitOutcome>,
    timed_out: bool,
    execution_ms: Option<u64>,
    stdout: String,
    stderr: String,
    error: Option<String>,
}

impl JobReport {
    fn succeeded(&self) -> bool {
        self.error.is_none() && self.outcome.is_some_and(ExitOutcome::success)
    }
}

// === Command Execution ===

pub async fn execute(cli: Cli) -> Result<ExitCode> {
    let status = match cli.command {
        Commands::Run {
            timeout_ms,
            timeout_from_request,
            shell,
            command,
        } => run_one(command, shell, timeout_ms, timeout_from_request).await?,
        Commands::Batch {
            jobs,
            timeout_ms,
            manifest,
            json,
            commands,
        } => {
            let mut specs = match manifest {
                Some(path) => load_manifest(&path)?,
                None => Vec::new(),
            };
            specs.extend(commands.into_iter().map(JobSpec::from_shell));
            if specs.is_empty() {
                bail!("Nothing to run: pass commands or --manifest");
            }
            run_batch(specs, jobs, timeout_ms, json).await?
        }
    };
    Ok(exit_code(status))
}

/// Strategy that forwards every chunk to `out` and keeps nothing.
fn relay<W: Write + Send + 'static>(mut out: W) -> impl Accumulate {
    move |data: Vec<u8>, chunk: &[u8]| {
        if let Err(error) = out.write_all(chunk).and_then(|()| out.flush()) {
            debug!(error = %error, "could not relay child output");
        }
        data
    }
}

async fn run_one(
    argv: Vec<String>,
    shell: bool,
    timeout_ms: u64,
    timeout_from_request: bool,
) -> Result<i32> {
    let command = if shell {
        Command::shell(argv.join(" "))
    } else {
        Command::from_argv(argv)
    };
    let command = command.descriptors([
        IoDescriptor::inherited(STDIN, std::io::stdin()),
        IoDescriptor::pipe_with(STDOUT, PipeDirection::Write, relay(std::io::stdout())),
        IoDescriptor::pipe_with(STDERR, PipeDirection::Write, relay(std::io::stderr())),
    ]);
    let name = command.display_name();

    let mut handle = ProcessHandle::new(command);
    handle.configure(
        ProcessConfig::new()
            .timeout_millis(timeout_ms)
            .start_timeout_before_open(timeout_from_request),
    )?;
    handle
        .exec()
        .await
        .with_context(|| format!("Failed to run `{name}`"))?;

    let outcome = handle.outcome()?;
    debug!(
        command = %name,
        %outcome,
        execution_ms = handle.execution_time_millis()?,
        "command finished"
    );
    Ok(match outcome {
        ExitOutcome::Exited(code) => code,
        ExitOutcome::Killed(signal) => {
            if signal == KILL_SIGNAL && timeout_ms > 0 {
                eprintln!("procwrap: `{name}` timed out after {timeout_ms} ms");
            }
            signal_exit(signal)
        }
    })
}

async fn run_batch(specs: Vec<JobSpec>, jobs: usize, timeout_ms: u64, json: bool) -> Result<i32> {
    let mut handles = Vec::with_capacity(specs.len());
    for spec in &specs {
        let mut handle = ProcessHandle::new(spec.to_command());
        handle.set_timeout_millis(spec.timeout_ms.unwrap_or(timeout_ms))?;
        handles.push(handle);
    }

    let batch_instant = Instant::now();
    let batch_started = Utc::now();

    let mut errors: HashMap<usize, String> = HashMap::new();
    {
        let mut pool = ProcessPool::new(jobs).context("Invalid job count")?;
        for handle in &mut handles {
            pool.add(handle)?;
        }
        pool.exec().await?;
        for failure in pool.failures() {
            warn!(index = failure.index, error = %failure.error, "job failed");
            errors.insert(failure.index, error_chain(&failure.error));
        }
    }

    let reports: Vec<JobReport> = handles
        .iter()
        .zip(&specs)
        .enumerate()
        .map(|(index, (handle, spec))| {
            let outcome = handle.outcome().ok();
            JobReport {
                index,
                name: spec.name.clone().unwrap_or_else(|| handle.command_name()),
                state: handle.state(),
                started_at: handle.requested_at().and_then(|requested| {
                    chrono::Duration::from_std(requested.saturating_duration_since(batch_instant))
                        .ok()
                        .map(|offset| batch_started + offset)
                }),
                outcome,
                timed_out: handle.config().timeout.is_some()
                    && outcome == Some(ExitOutcome::Killed(KILL_SIGNAL)),
                execution_ms: handle.execution_time_millis().ok(),
                stdout: handle.stdout(),
                stderr: handle.stderr(),
                error: errors.remove(&index),
            }
        })
        .collect();

    if json {
        let out = serde_json::to_string_pretty(&reports).context("Failed to serialize report")?;
        println!("{out}");
    } else {
        print_reports(&reports);
    }

    let failed = reports.iter().filter(|report| !report.succeeded()).count();
    Ok(batch_status(failed))
}

/// `error: cause: cause` on one line.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

fn print_reports(reports: &[JobReport]) {
    for report in reports {
        println!("== [{}] {} ==", report.index, report.name);
        print!("{}", report.stdout);
        if !report.stderr.is_empty() {
            eprint!("{}", report.stderr);
        }

        let status = match (&report.error, report.outcome) {
            (Some(error), _) => format!("failed: {error}"),
            (None, Some(_)) if report.timed_out => String::from("timed out"),
            (None, Some(outcome)) => outcome.to_string(),
            (None, None) => String::from("did not run"),
        };
        match report.execution_ms {
            Some(ms) => println!("-- {status} in {ms} ms"),
            None => println!("-- {status}"),
        }
    }
}
