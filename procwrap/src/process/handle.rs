//! Lifecycle of a single child process.
//!
//! A [`ProcessHandle`] owns its child and the parent ends of the child's
//! pipes. All state lives behind one lock, shared by every path that can
//! end the child: the foreground loop, caller-driven polls, the timeout
//! coordinator's timer, recycle and drop. Whoever takes the lock first
//! reaps the child; everyone after finds it gone.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ExitStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::command::Command;
use super::coordinator::TimeoutCoordinator;
use super::descriptor::{DescriptorNumber, IoDescriptor, STDERR, STDOUT};
use super::pipe::{PipeWriter, ReadEnd};
use super::readiness::{cap, wait_ready, IDLE_TICK, POLL_TICK};
use super::spawn::spawn;
use crate::error::{ProcError, Result};

/// Signal used for hard termination, reported as the exit code of a
/// killed child.
pub const KILL_SIGNAL: i32 = Signal::SIGKILL as i32;

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitOutcome {
    Exited(i32),
    Killed(i32),
}

impl ExitOutcome {
    /// Exit code, or the signal number for a killed child.
    pub const fn code(self) -> i32 {
        match self {
            Self::Exited(code) | Self::Killed(code) => code,
        }
    }

    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        status.code().map_or_else(
            || Self::Killed(status.signal().unwrap_or(KILL_SIGNAL)),
            Self::Exited,
        )
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Killed(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// Lifecycle state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Created,
    /// Spawn requested, not yet confirmed.
    Started,
    Running,
    /// Exit observed, not yet finalized.
    Exited(i32),
    /// Kill observed, not yet finalized.
    Killed(i32),
    Closed,
}

/// Reference point the timeout is measured from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeoutStart {
    /// When the spawn was requested.
    Requested,
    /// When the spawn was confirmed.
    #[default]
    Opened,
}

/// Per-handle settings, fixed while the handle is not `Created`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessConfig {
    pub timeout: Option<Duration>,
    pub timeout_start: TimeoutStart,
    pub background: bool,
}

impl ProcessConfig {
    pub const fn new() -> Self {
        Self {
            timeout: None,
            timeout_start: TimeoutStart::Opened,
            background: false,
        }
    }

    /// Timeout in milliseconds; 0 disables it.
    pub const fn timeout_millis(mut self, millis: u64) -> Self {
        self.timeout = if millis == 0 {
            None
        } else {
            Some(Duration::from_millis(millis))
        };
        self
    }

    pub const fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Measure the timeout from the spawn request instead of the
    /// confirmed open.
    pub const fn start_timeout_before_open(mut self, before_open: bool) -> Self {
        self.timeout_start = if before_open {
            TimeoutStart::Requested
        } else {
            TimeoutStart::Opened
        };
        self
    }

    /// Return from `exec` right after spawn; the caller drives progress.
    pub const fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }
}

struct HandleState {
    command: Command,
    config: ProcessConfig,
    child: Option<Child>,
    requested: Option<Instant>,
    opened: Option<Instant>,
    closed: Option<Instant>,
    outcome: Option<ExitOutcome>,
}

impl HandleState {
    fn deadline(&self) -> Option<Instant> {
        let base = match self.config.timeout_start {
            TimeoutStart::Requested => self.requested,
            TimeoutStart::Opened => self.opened,
        }?;
        self.config.timeout.map(|timeout| base + timeout)
    }

    fn past_deadline(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    fn state(&self) -> ProcessState {
        if self.closed.is_some() {
            return ProcessState::Closed;
        }
        match (self.outcome, &self.child, self.requested) {
            (Some(ExitOutcome::Exited(code)), _, _) => ProcessState::Exited(code),
            (Some(ExitOutcome::Killed(signal)), _, _) => ProcessState::Killed(signal),
            (None, Some(_), _) => ProcessState::Running,
            (None, None, Some(_)) => ProcessState::Started,
            (None, None, None) => ProcessState::Created,
        }
    }

    fn ensure_created(&self, operation: &str) -> Result<()> {
        if self.requested.is_some() {
            return Err(ProcError::usage(format!(
                "cannot {operation}: process was already executed, recycle it first"
            )));
        }
        Ok(())
    }

    fn read_ends(&self) -> Vec<ReadEnd> {
        if self.child.is_none() {
            return Vec::new();
        }
        self.command
            .write_pipes()
            .filter_map(|pipe| pipe.delegate().read_end())
            .collect()
    }

    fn drain(&mut self) {
        for pipe in self.command.write_pipes_mut() {
            pipe.delegate_mut().read_chunk();
        }
    }

    fn close_pipes(&mut self) {
        for pipe in self.command.pipes_mut() {
            pipe.delegate_mut().close();
        }
    }

    fn closed_since(&self, from: Option<Instant>) -> Result<u64> {
        let closed = self
            .closed
            .ok_or_else(|| ProcError::usage("process has not been closed yet"))?;
        let elapsed = closed.saturating_duration_since(from.unwrap_or(closed));
        Ok(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Shared part of a handle: what the coordinator refers to.
pub(crate) struct HandleCell {
    id: Uuid,
    state: Mutex<HandleState>,
    // Copy of the live deadline, readable without the state lock.
    deadline: Mutex<Option<Instant>>,
    coordinator: Arc<TimeoutCoordinator>,
}

impl HandleCell {
    pub(crate) const fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn armed_deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    fn publish_deadline(&self, deadline: Option<Instant>) {
        *self.deadline.lock() = deadline;
    }

    /// Query the OS once. The exit status is kept the first time it shows.
    fn check_running(&self, st: &mut HandleState) -> Result<bool> {
        if st.outcome.is_some() {
            return Ok(false);
        }
        let Some(child) = st.child.as_mut() else {
            return Ok(false);
        };
        let pid = child.id();
        match child.try_wait() {
            Ok(Some(status)) => {
                st.outcome = Some(status.into());
                // An exited child no longer bounds the coordinator's timer.
                self.publish_deadline(None);
                self.coordinator.recompute_deadline();
                Ok(false)
            }
            Ok(None) => Ok(true),
            Err(source) => {
                warn!(pid, error = %source, "status query failed, killing process");
                self.shutdown(st);
                Err(ProcError::StatusQuery { pid, source })
            }
        }
    }

    /// Hard termination.
    fn shutdown(&self, st: &mut HandleState) {
        st.close_pipes();
        if let Some(mut child) = st.child.take() {
            let pid = child.id();
            if st.outcome.is_none() {
                if let Err(error) = child.kill() {
                    debug!(pid, error = %error, "kill failed, process already gone");
                } else {
                    debug!(pid, "sent SIGKILL");
                }
            }
            match child.wait() {
                Ok(status) => {
                    if st.outcome.is_none() {
                        st.outcome = Some(status.into());
                    }
                }
                Err(error) => {
                    warn!(pid, error = %error, "failed to reap killed process");
                    if st.outcome.is_none() {
                        st.outcome = Some(ExitOutcome::Killed(KILL_SIGNAL));
                    }
                }
            }
        }
        st.closed = Some(Instant::now());
        self.publish_deadline(None);
        self.coordinator.recompute_deadline();
    }

    /// Graceful end, once the child is known to have exited.
    fn finalize(&self, st: &mut HandleState) {
        let Some(mut child) = st.child.take() else {
            return;
        };
        let pid = child.id();

        for pipe in st.command.write_pipes_mut() {
            let number = pipe.number();
            let delegate = pipe.delegate_mut();
            if let Err(error) = delegate.make_blocking() {
                debug!(pid, number, error = %error, "could not switch pipe to blocking");
            }
            delegate.read_chunk();
        }
        st.close_pipes();

        match child.wait() {
            Ok(status) => {
                if st.outcome.is_none() {
                    st.outcome = Some(status.into());
                }
            }
            Err(error) => warn!(pid, error = %error, "failed to reap process"),
        }
        debug!(pid, outcome = ?st.outcome, "process finished");

        st.closed = Some(Instant::now());
        self.publish_deadline(None);
        self.coordinator.recompute_deadline();
    }

    /// One non-waiting step; `true` while the child is still running.
    pub(crate) fn step(&self) -> Result<bool> {
        let mut st = self.state.lock();
        if st.child.is_none() {
            return Ok(false);
        }
        if !self.check_running(&mut st)? {
            self.finalize(&mut st);
            return Ok(false);
        }
        if st.past_deadline(Instant::now()) {
            debug!(handle = %self.id, "deadline reached, killing process");
            self.shutdown(&mut st);
            return Ok(false);
        }
        st.drain();
        Ok(true)
    }

    /// Read ends and deadline to wait on, or `None` once nothing is live.
    fn wait_plan(&self) -> Option<(Vec<ReadEnd>, Option<Instant>)> {
        let st = self.state.lock();
        st.child.as_ref().map(|_| (st.read_ends(), st.deadline()))
    }
}

/// A child process from configuration through spawn to reaping.
///
/// # Example
///
/// ```rust,no_run
/// use procwrap::process::{Command, ProcessConfig, ProcessHandle};
///
/// #[tokio::main]
/// async fn main() -> procwrap::Result<()> {
///     let mut handle = ProcessHandle::new(Command::shell("echo hello; exit 3"));
///     handle.configure(ProcessConfig::new().timeout_millis(5_000))?;
///     handle.exec().await?;
///
///     assert_eq!(handle.stdout(), "hello\n");
///     assert_eq!(handle.exit_code()?, 3);
///     Ok(())
/// }
/// ```
pub struct ProcessHandle {
    pub(crate) cell: Arc<HandleCell>,
}

impl ProcessHandle {
    /// Handle watched by the process-wide coordinator.
    pub fn new(command: Command) -> Self {
        Self::with_coordinator(command, TimeoutCoordinator::global())
    }

    pub fn with_coordinator(command: Command, coordinator: Arc<TimeoutCoordinator>) -> Self {
        Self {
            cell: Arc::new(HandleCell {
                id: Uuid::now_v7(),
                state: Mutex::new(HandleState {
                    command,
                    config: ProcessConfig::new(),
                    child: None,
                    requested: None,
                    opened: None,
                    closed: None,
                    outcome: None,
                }),
                deadline: Mutex::new(None),
                coordinator,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.cell.state.lock()
    }

    fn update(&mut self, operation: &str, apply: impl FnOnce(&mut HandleState)) -> Result<&mut Self> {
        {
            let mut st = self.lock();
            st.ensure_created(operation)?;
            apply(&mut *st);
        }
        Ok(self)
    }

    pub fn id(&self) -> Uuid {
        self.cell.id
    }

    pub fn config(&self) -> ProcessConfig {
        self.lock().config
    }

    pub fn configure(&mut self, config: ProcessConfig) -> Result<&mut Self> {
        self.update("configure", |st| st.config = config)
    }

    /// Timeout in milliseconds; 0 disables it.
    pub fn set_timeout_millis(&mut self, millis: u64) -> Result<&mut Self> {
        self.update("set timeout", |st| {
            st.config = st.config.timeout_millis(millis);
        })
    }

    /// Timeout in whole seconds; 0 disables it.
    pub fn set_timeout_secs(&mut self, secs: u64) -> Result<&mut Self> {
        self.set_timeout_millis(secs.saturating_mul(1000))
    }

    pub fn start_timeout_before_open(&mut self, before_open: bool) -> Result<&mut Self> {
        self.update("change timeout start", |st| {
            st.config = st.config.start_timeout_before_open(before_open);
        })
    }

    pub fn run_in_background(&mut self, background: bool) -> Result<&mut Self> {
        self.update("change background mode", |st| {
            st.config = st.config.background(background);
        })
    }

    /// Wire a descriptor, replacing any previous one with the same number.
    pub fn set_descriptor(&mut self, descriptor: IoDescriptor) -> Result<&mut Self> {
        self.update("set descriptor", |st| st.command.insert_descriptor(descriptor))
    }

    pub fn remove_descriptor(&mut self, number: DescriptorNumber) -> Result<Option<IoDescriptor>> {
        let mut st = self.lock();
        st.ensure_created("remove descriptor")?;
        Ok(st.command.remove_descriptor(number))
    }

    /// Borrow a descriptor. Holds the handle lock until dropped.
    pub fn descriptor(&self, number: DescriptorNumber) -> Option<MappedMutexGuard<'_, IoDescriptor>> {
        MutexGuard::try_map(self.lock(), |st| st.command.descriptors.get_mut(&number)).ok()
    }

    pub fn command_name(&self) -> String {
        self.lock().command.display_name()
    }

    /// Writer for the child's stdin, when stdin is a pipe.
    pub fn stdin_writer(&self) -> Option<PipeWriter> {
        self.lock().command.stdin_writer()
    }

    /// Spawn the child. In the foreground this returns once the child has
    /// exited or was killed at its deadline.
    pub async fn exec(&mut self) -> Result<()> {
        self.start()?;
        let background = self.lock().config.background;
        if background {
            return Ok(());
        }
        self.run_foreground().await
    }

    /// Spawn and register, without driving the child.
    pub(crate) fn start(&mut self) -> Result<()> {
        let cell = &self.cell;
        let mut st = cell.state.lock();
        st.ensure_created("exec")?;

        st.requested = Some(Instant::now());
        let spawned = match spawn(&st.command) {
            Ok(spawned) => spawned,
            Err(error) => {
                st.requested = None;
                return Err(error);
            }
        };
        st.opened = Some(Instant::now());
        let pid = spawned.child.id();
        st.child = Some(spawned.child);

        for (number, fd) in spawned.streams {
            let Some(pipe) = st.command.pipe_mut(number) else {
                continue;
            };
            if let Err(source) = pipe.delegate_mut().set_stream(fd) {
                warn!(pid, number, error = %source, "pipe setup failed, killing process");
                cell.shutdown(&mut st);
                return Err(ProcError::Pipe { number, source });
            }
        }

        let deadline = st.deadline();
        cell.publish_deadline(deadline);
        drop(st);

        cell.coordinator.register(cell);
        cell.coordinator.recompute_deadline();
        debug!(handle = %cell.id, pid, "process running");
        Ok(())
    }

    async fn run_foreground(&mut self) -> Result<()> {
        loop {
            let (ends, deadline) = {
                let mut st = self.lock();
                if st.child.is_none() {
                    break;
                }
                if !self.cell.check_running(&mut st)? {
                    break;
                }
                if st.past_deadline(Instant::now()) {
                    debug!(handle = %self.cell.id, "deadline reached, killing process");
                    self.cell.shutdown(&mut st);
                    break;
                }
                (st.read_ends(), st.deadline())
            };

            let bound = deadline.map(|at| at.saturating_duration_since(Instant::now()));
            let bound = if ends.is_empty() {
                Some(cap(bound, IDLE_TICK))
            } else {
                bound
            };
            wait_ready(&ends, bound).await;
            self.lock().drain();
        }

        let mut st = self.lock();
        self.cell.finalize(&mut st);
        Ok(())
    }

    /// Drive a background child one step, waiting briefly for output.
    ///
    /// Returns `false` once the child is finished, `true` to keep polling.
    pub async fn poll(&self) -> Result<bool> {
        let Some((ends, deadline)) = self.cell.wait_plan() else {
            return Ok(false);
        };
        let bound = deadline.map(|at| at.saturating_duration_since(Instant::now()));
        wait_ready(&ends, Some(cap(bound, POLL_TICK))).await;
        self.cell.step()
    }

    /// Like [`poll`](Self::poll) but never waits.
    pub fn try_poll(&self) -> Result<bool> {
        self.cell.step()
    }

    /// Whether the child is alive right now.
    pub fn is_running(&self) -> Result<bool> {
        let mut st = self.lock();
        if st.child.is_none() {
            return Ok(false);
        }
        self.cell.check_running(&mut st)
    }

    pub fn state(&self) -> ProcessState {
        self.lock().state()
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().child.as_ref().map(Child::id)
    }

    /// When the last spawn was requested.
    pub fn requested_at(&self) -> Option<Instant> {
        self.lock().requested
    }

    /// Instant the running child gets killed at, if it has a timeout.
    pub fn deadline(&self) -> Option<Instant> {
        self.cell.armed_deadline()
    }

    /// Whole seconds left until the deadline, rounded up; 0 without one
    /// or once the child is no longer running.
    pub fn remaining_timeout_seconds(&self) -> u64 {
        if !self.is_running().unwrap_or(false) {
            return 0;
        }
        remaining_secs(self.deadline(), Instant::now())
    }

    pub fn outcome(&self) -> Result<ExitOutcome> {
        let st = self.lock();
        if st.closed.is_none() {
            return Err(ProcError::usage("process has not been closed yet"));
        }
        st.outcome
            .ok_or_else(|| ProcError::usage("process closed without an exit status"))
    }

    /// Exit code, or [`KILL_SIGNAL`] for a child killed at its deadline.
    pub fn exit_code(&self) -> Result<i32> {
        self.outcome().map(ExitOutcome::code)
    }

    /// Milliseconds from confirmed open to close.
    pub fn execution_time_millis(&self) -> Result<u64> {
        let st = self.lock();
        st.closed_since(st.opened)
    }

    /// Milliseconds from spawn request to close.
    pub fn total_execution_time_millis(&self) -> Result<u64> {
        let st = self.lock();
        st.closed_since(st.requested)
    }

    /// Accumulated bytes of a pipe descriptor.
    pub fn output(&self, number: DescriptorNumber) -> Option<Vec<u8>> {
        self.lock()
            .command
            .pipe(number)
            .map(|pipe| pipe.data().to_vec())
    }

    pub fn stdout(&self) -> String {
        self.output_lossy(STDOUT)
    }

    pub fn stderr(&self) -> String {
        self.output_lossy(STDERR)
    }

    fn output_lossy(&self, number: DescriptorNumber) -> String {
        self.output(number)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    }

    pub(crate) fn read_ends(&self) -> Vec<ReadEnd> {
        self.lock().read_ends()
    }

    pub(crate) fn step(&self) -> Result<bool> {
        self.cell.step()
    }

    /// Back to `Created`, killing a live child first. Configuration and
    /// descriptors are kept.
    pub fn recycle(&mut self) -> &mut Self {
        {
            let mut st = self.lock();
            if st.child.is_some() {
                debug!(handle = %self.cell.id, "recycling live process");
                self.cell.shutdown(&mut st);
            }
            st.requested = None;
            st.opened = None;
            st.closed = None;
            st.outcome = None;
            for pipe in st.command.pipes_mut() {
                pipe.delegate_mut().reset();
            }
        }
        self.cell.publish_deadline(None);
        self.cell.coordinator.deregister(self.cell.id);
        self
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        {
            let mut st = self.lock();
            if st.child.is_some() {
                debug!(handle = %self.cell.id, "dropping live process");
                self.cell.shutdown(&mut st);
            }
        }
        self.cell.coordinator.deregister(self.cell.id);
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.lock();
        f.debug_struct("ProcessHandle")
            .field("id", &self.cell.id)
            .field("command", &st.command.display_name())
            .field("state", &st.state())
            .field("config", &st.config)
            .finish_non_exhaustive()
    }
}

fn remaining_secs(deadline: Option<Instant>, now: Instant) -> u64 {
    let Some(deadline) = deadline else {
        return 0;
    };
    let left = deadline.saturating_duration_since(now);
    (left.as_secs() + u64::from(left.subsec_nanos() > 0)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::descriptor::{FileMode, PipeDirection};
    use crate::process::pipe::{Accumulate, Append};
    use crate::process::testing::handshake;
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};

    fn isolated(command: Command, timeout_ms: u64) -> ProcessHandle {
        let mut handle = ProcessHandle::with_coordinator(command, TimeoutCoordinator::new());
        handle.set_timeout_millis(timeout_ms).unwrap();
        handle
    }

    #[tokio::test]
    async fn test_return_value() {
        let mut handle = isolated(Command::shell("echo \"a\"; exit 1"), 0);
        handle.exec().await.unwrap();

        assert!(!handle.is_running().unwrap());
        assert_eq!(handle.state(), ProcessState::Closed);
        assert_eq!(handle.stdout().trim(), "a");
        assert_eq!(handle.exit_code().unwrap(), 1);
        assert_eq!(handle.outcome().unwrap(), ExitOutcome::Exited(1));
        assert!(handle.execution_time_millis().unwrap() <= handle.total_execution_time_millis().unwrap());
        assert_eq!(handle.pid(), None);
    }

    #[tokio::test]
    async fn test_background_matches_foreground() {
        let script = "echo out; echo err >&2; exit 4";

        let mut fg = isolated(Command::shell(script), 0);
        fg.exec().await.unwrap();

        let mut bg = isolated(Command::shell(script), 0);
        bg.run_in_background(true).unwrap();
        bg.exec().await.unwrap();
        assert!(bg.pid().is_some());
        while bg.poll().await.unwrap() {}

        assert_eq!(bg.stdout(), fg.stdout());
        assert_eq!(bg.stderr(), "err\n");
        assert_eq!(bg.exit_code().unwrap(), fg.exit_code().unwrap());
        assert_eq!(bg.exit_code().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let mut handle = isolated(Command::shell("sleep 1 && echo a"), 10);
        handle.exec().await.unwrap();

        assert!(handle.execution_time_millis().unwrap() < 100);
        assert_eq!(handle.exit_code().unwrap(), KILL_SIGNAL);
        assert_eq!(handle.outcome().unwrap(), ExitOutcome::Killed(KILL_SIGNAL));
        assert_eq!(handle.stdout(), "");
    }

    struct BlockingAppend;

    impl Accumulate for BlockingAppend {
        fn accumulate(&mut self, accumulated: Vec<u8>, chunk: &[u8]) -> Vec<u8> {
            Append.accumulate(accumulated, chunk)
        }

        fn blocking(&self) -> bool {
            true
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_strategy_still_times_out() {
        let command = Command::shell("echo start; sleep 3; echo end").descriptor(IoDescriptor::pipe_with(
            STDOUT,
            PipeDirection::Write,
            BlockingAppend,
        ));
        let mut handle = isolated(command, 100);
        let start = Instant::now();
        handle.exec().await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(handle.outcome().unwrap(), ExitOutcome::Killed(KILL_SIGNAL));
        assert!(!handle.stdout().contains("end"));
    }

    #[tokio::test]
    async fn test_exit_before_deadline_keeps_output() {
        let mut handle = isolated(Command::shell("echo tail"), 150);
        handle.run_in_background(true).unwrap();
        handle.exec().await.unwrap();

        // Past the deadline, but the child exited well before it.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!handle.try_poll().unwrap());
        assert_eq!(handle.outcome().unwrap(), ExitOutcome::Exited(0));
        assert_eq!(handle.stdout(), "tail\n");
    }

    #[tokio::test]
    async fn test_timeout_from_request() {
        let mut handle = isolated(Command::new("sleep").arg("5"), 50);
        handle.start_timeout_before_open(true).unwrap();
        assert_eq!(handle.config().timeout_start, TimeoutStart::Requested);

        handle.exec().await.unwrap();
        assert_eq!(handle.exit_code().unwrap(), KILL_SIGNAL);
        assert!(handle.total_execution_time_millis().unwrap() >= 50);
    }

    #[tokio::test]
    async fn test_background_timeout_through_poll() {
        let mut handle = isolated(Command::new("sleep").arg("5"), 30);
        handle.run_in_background(true).unwrap();
        handle.exec().await.unwrap();

        let start = Instant::now();
        while handle.poll().await.unwrap() {}
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(handle.exit_code().unwrap(), KILL_SIGNAL);
    }

    #[tokio::test]
    async fn test_handshake_foreground() {
        let mut handle = isolated(handshake("done"), 5_000);
        handle.exec().await.unwrap();

        assert_eq!(handle.exit_code().unwrap(), 0);
        assert_eq!(handle.stdout().trim(), "done");
    }

    #[tokio::test]
    async fn test_handshake_background() {
        let mut handle = isolated(handshake("done"), 5_000);
        handle.run_in_background(true).unwrap();
        handle.exec().await.unwrap();
        while handle.poll().await.unwrap() {}

        assert_eq!(handle.exit_code().unwrap(), 0);
        assert_eq!(handle.stdout().trim(), "done");
    }

    #[tokio::test]
    async fn test_high_descriptor_pipe() {
        let mut handle = isolated(
            Command::shell("echo three >&3; echo one").descriptor(IoDescriptor::pipe(3, PipeDirection::Write)),
            5_000,
        );
        handle.exec().await.unwrap();

        assert_eq!(handle.output(3).unwrap(), b"three\n");
        assert_eq!(handle.stdout(), "one\n");
        assert!(handle.output(7).is_none());
    }

    #[tokio::test]
    async fn test_recycle_allows_reexec() {
        let mut handle = isolated(Command::shell("echo again"), 5_000);
        handle.exec().await.unwrap();
        assert_eq!(handle.stdout(), "again\n");

        handle.recycle();
        assert_eq!(handle.state(), ProcessState::Created);
        assert!(handle.exit_code().unwrap_err().is_usage());
        assert!(handle.execution_time_millis().unwrap_err().is_usage());
        assert_eq!(handle.stdout(), "");
        assert_eq!(handle.config().timeout, Some(Duration::from_millis(5_000)));

        handle.exec().await.unwrap();
        assert_eq!(handle.stdout(), "again\n");
        assert_eq!(handle.exit_code().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recycle_kills_running_child() {
        let mut handle = isolated(Command::new("sleep").arg("5"), 0);
        handle.run_in_background(true).unwrap();
        handle.exec().await.unwrap();
        let pid = handle.pid().unwrap();

        handle.recycle();
        assert_eq!(handle.state(), ProcessState::Created);
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn test_usage_errors_after_exec() {
        let mut handle = isolated(Command::new("sleep").arg("5"), 0);
        handle.run_in_background(true).unwrap();
        handle.exec().await.unwrap();

        assert!(handle.exec().await.unwrap_err().is_usage());
        assert!(handle.configure(ProcessConfig::new()).unwrap_err().is_usage());
        assert!(handle.set_timeout_secs(1).unwrap_err().is_usage());
        assert!(handle
            .set_descriptor(IoDescriptor::pipe(3, PipeDirection::Write))
            .unwrap_err()
            .is_usage());
        assert!(handle.remove_descriptor(STDOUT).unwrap_err().is_usage());
        assert!(handle.exit_code().unwrap_err().is_usage());
        assert_eq!(handle.state(), ProcessState::Running);
        handle.recycle();
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_created() {
        let coordinator = TimeoutCoordinator::new();
        let mut handle = ProcessHandle::with_coordinator(
            Command::new("nonexistent_command_12345"),
            Arc::clone(&coordinator),
        );

        let err = handle.exec().await.unwrap_err();
        assert!(matches!(err, ProcError::Spawn { .. }));
        assert_eq!(handle.state(), ProcessState::Created);
        assert!(coordinator.is_empty());

        // No partial state: a retry fails the same way, not as a usage error.
        assert!(matches!(handle.exec().await.unwrap_err(), ProcError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_drop_kills_child() {
        let mut handle = isolated(Command::new("sleep").arg("5"), 0);
        handle.run_in_background(true).unwrap();
        handle.exec().await.unwrap();
        let pid = handle.pid().unwrap();
        assert!(process_exists(pid));

        drop(handle);
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn test_remaining_timeout_seconds() {
        let mut handle = isolated(Command::new("sleep").arg("5"), 2_500);
        assert_eq!(handle.remaining_timeout_seconds(), 0);
        handle.run_in_background(true).unwrap();
        handle.exec().await.unwrap();

        let left = handle.remaining_timeout_seconds();
        assert!((2..=3).contains(&left), "left = {left}");
        assert!(handle.deadline().is_some());

        handle.recycle();
        assert_eq!(handle.remaining_timeout_seconds(), 0);
        assert_eq!(handle.deadline(), None);
    }

    #[tokio::test]
    async fn test_exited_child_has_no_remaining_timeout() {
        let coordinator = TimeoutCoordinator::new();
        let mut handle = ProcessHandle::with_coordinator(Command::new("true"), Arc::clone(&coordinator));
        handle.set_timeout_millis(5_000).unwrap();
        handle.run_in_background(true).unwrap();
        handle.exec().await.unwrap();
        assert!(coordinator.armed_deadline().is_some());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handle.remaining_timeout_seconds(), 0);
        assert_eq!(handle.state(), ProcessState::Exited(0));
        assert_eq!(coordinator.armed_deadline(), None);

        assert!(!handle.poll().await.unwrap());
        assert_eq!(handle.exit_code().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_inherited_stream_stays_open() {
        let file = Arc::new(tempfile::tempfile().unwrap());
        let command = Command::shell("echo inherited")
            .descriptor(IoDescriptor::inherited(STDOUT, Arc::clone(&file)));
        let mut handle = isolated(command, 5_000);
        handle.exec().await.unwrap();
        assert_eq!(handle.exit_code().unwrap(), 0);
        assert!(handle.output(STDOUT).is_none());
        drop(handle);

        let mut parent: &File = &file;
        parent.write_all(b"parent\n").unwrap();
        parent.seek(SeekFrom::Start(0)).unwrap();
        let mut text = String::new();
        parent.read_to_string(&mut text).unwrap();
        assert_eq!(text, "inherited\nparent\n");
    }

    #[tokio::test]
    async fn test_file_descriptors_through_exec() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let out = dir.path().join("out.txt");
        std::fs::write(&input, "line\n").unwrap();
        std::fs::write(&out, "stale contents\n").unwrap();

        let command = Command::shell("cat; echo note >&2").descriptors([
            IoDescriptor::file(crate::process::STDIN, &input, FileMode::Read),
            IoDescriptor::file(STDOUT, &out, FileMode::Write),
        ]);
        let mut handle = isolated(command, 5_000);
        handle.exec().await.unwrap();

        assert_eq!(handle.exit_code().unwrap(), 0);
        assert_eq!(handle.stderr(), "note\n");
        assert!(handle.output(STDOUT).is_none());
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "line\n");

        handle.recycle();
        handle.set_descriptor(IoDescriptor::file(STDOUT, &out, FileMode::Append)).unwrap();
        handle.exec().await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "line\nline\n");
    }

    #[tokio::test]
    async fn test_descriptor_access() {
        let mut handle = isolated(Command::new("true"), 0);
        assert!(handle.descriptor(STDOUT).is_some());

        let removed = handle.remove_descriptor(STDERR).unwrap();
        assert!(removed.is_some());
        assert!(handle.descriptor(STDERR).is_none());

        handle.exec().await.unwrap();
        assert!(handle.output(STDERR).is_none());
        assert_eq!(handle.exit_code().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_poll_before_exec() {
        let handle = isolated(Command::new("true"), 0);
        assert!(!handle.poll().await.unwrap());
        assert!(!handle.is_running().unwrap());
        assert_eq!(handle.state(), ProcessState::Created);
    }

    #[test]
    fn test_remaining_secs_rounding() {
        let now = Instant::now();
        assert_eq!(remaining_secs(None, now), 0);
        assert_eq!(remaining_secs(Some(now + Duration::from_millis(1_200)), now), 2);
        assert_eq!(remaining_secs(Some(now + Duration::from_secs(3)), now), 3);
        assert_eq!(remaining_secs(Some(now), now), 1);
    }

    #[test]
    fn test_config_builder() {
        let config = ProcessConfig::new()
            .timeout_millis(250)
            .start_timeout_before_open(true)
            .background(true);
        assert_eq!(config.timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.timeout_start, TimeoutStart::Requested);
        assert!(config.background);
        assert_eq!(ProcessConfig::new().timeout_millis(0).timeout, None);
    }

    #[test]
    fn test_exit_outcome_from_status() {
        assert_eq!(ExitOutcome::from(ExitStatus::from_raw(3 << 8)), ExitOutcome::Exited(3));
        assert_eq!(ExitOutcome::from(ExitStatus::from_raw(9)), ExitOutcome::Killed(KILL_SIGNAL));
        assert!(ExitOutcome::Exited(0).success());
        assert!(!ExitOutcome::Killed(9).success());
    }

    fn process_exists(pid: u32) -> bool {
        let pid = nix::unistd::Pid::from_raw(i32::try_from(pid).unwrap());
        nix::sys::signal::kill(pid, None).is_ok()
    }
}
