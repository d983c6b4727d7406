//! Process pool for running many handles with a concurrency limit.
//!
//! The pool borrows its handles; it never owns or finalizes them. Handles
//! are admitted in FIFO order up to the capacity, each started in
//! background mode, and driven together through one readiness wait over
//! every admitted pipe. A finished handle frees its slot for the next one
//! in the queue.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::handle::ProcessHandle;
use super::pipe::ReadEnd;
use super::readiness::{cap, wait_ready, IDLE_TICK, POLL_TICK};
use crate::error::{ProcError, Result};

/// Position of a handle in the pool, in the order it was added.
pub type MemberIndex = usize;

/// A member that could not be run to completion.
#[derive(Debug)]
pub struct PoolFailure {
    pub index: MemberIndex,
    pub error: ProcError,
}

/// A pool for running multiple handles with a concurrency limit.
///
/// # Example
///
/// ```rust,no_run
/// use procwrap::process::{Command, ProcessHandle, ProcessPool};
///
/// #[tokio::main]
/// async fn main() -> procwrap::Result<()> {
///     let mut first = ProcessHandle::new(Command::shell("sleep 1"));
///     let mut second = ProcessHandle::new(Command::shell("sleep 2"));
///
///     // At most one child at a time
///     let mut pool = ProcessPool::new(1)?;
///     pool.add(&mut first)?;
///     pool.add(&mut second)?;
///     pool.exec().await?;
///
///     for failure in pool.failures() {
///         eprintln!("member {} failed: {}", failure.index, failure.error);
///     }
///     Ok(())
/// }
/// ```
pub struct ProcessPool<'a> {
    members: Vec<&'a mut ProcessHandle>,
    queue: VecDeque<MemberIndex>,
    admitted: Vec<MemberIndex>,
    capacity: usize,
    background: bool,
    running: bool,
    failures: Vec<PoolFailure>,
}

impl<'a> ProcessPool<'a> {
    /// Create a pool running at most `capacity` children at once.
    pub fn new(capacity: usize) -> Result<Self> {
        let mut pool = Self::unbounded();
        pool.set_capacity(capacity)?;
        Ok(pool)
    }

    /// Create a pool that admits every handle at once.
    pub const fn unbounded() -> Self {
        Self {
            members: Vec::new(),
            queue: VecDeque::new(),
            admitted: Vec::new(),
            capacity: usize::MAX,
            background: false,
            running: false,
            failures: Vec::new(),
        }
    }

    pub fn set_capacity(&mut self, capacity: usize) -> Result<&mut Self> {
        if capacity == 0 {
            return Err(ProcError::usage("pool capacity must be at least 1"));
        }
        self.capacity = capacity;
        Ok(self)
    }

    /// Return from `exec` after the first admissions; the caller then
    /// drives the pool with [`poll`](Self::poll).
    pub fn run_in_background(&mut self, background: bool) -> &mut Self {
        self.background = background;
        self
    }

    /// Add a handle to the pool. Must be `Created` by the time the pool
    /// admits it.
    pub fn add(&mut self, handle: &'a mut ProcessHandle) -> Result<MemberIndex> {
        if self.running {
            return Err(ProcError::usage("cannot add to a running pool"));
        }
        self.members.push(handle);
        Ok(self.members.len() - 1)
    }

    /// Queue every member and run them to completion, or only start them
    /// in background mode.
    pub async fn exec(&mut self) -> Result<()> {
        if self.running {
            return Err(ProcError::usage("pool is already running"));
        }
        self.running = true;
        self.failures.clear();
        self.queue = (0..self.members.len()).collect();
        debug!(members = self.members.len(), capacity = self.capacity, "pool started");
        self.admit();

        if self.background {
            return Ok(());
        }
        while self.has_work() {
            self.iterate(None).await;
        }
        self.running = false;
        debug!(failures = self.failures.len(), "pool finished");
        Ok(())
    }

    /// One caller-driven iteration. Returns whether anything is still
    /// admitted or queued.
    pub async fn poll(&mut self) -> Result<bool> {
        if !self.running {
            return Err(ProcError::usage("pool is not running"));
        }
        self.iterate(Some(POLL_TICK)).await;
        if !self.has_work() {
            self.running = false;
        }
        Ok(self.running)
    }

    /// Recycle every member and forget the last run.
    pub fn recycle(&mut self) -> &mut Self {
        for handle in &mut self.members {
            handle.recycle();
        }
        self.queue.clear();
        self.admitted.clear();
        self.failures.clear();
        self.running = false;
        self
    }

    pub fn failures(&self) -> &[PoolFailure] {
        &self.failures
    }

    pub fn handle(&self, index: MemberIndex) -> Option<&ProcessHandle> {
        self.members.get(index).map(|handle| &**handle)
    }

    pub fn handles(&self) -> Box<dyn Iterator<Item = &ProcessHandle> + '_> {
        Box::new(self.members.iter().map(|handle| &**handle))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub const fn is_running(&self) -> bool {
        self.running
    }

    pub fn admitted_count(&self) -> usize {
        self.admitted.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    fn has_work(&self) -> bool {
        !self.admitted.is_empty() || !self.queue.is_empty()
    }

    async fn iterate(&mut self, tick: Option<Duration>) {
        let (ends, bound) = self.wait_plan();
        let bound = match tick {
            Some(tick) => Some(cap(bound, tick)),
            None => bound,
        };
        wait_ready(&ends, bound).await;
        self.step_admitted();
        self.admit();
    }

    /// Every admitted read end, bounded by the earliest admitted deadline.
    fn wait_plan(&self) -> (Vec<ReadEnd>, Option<Duration>) {
        let now = Instant::now();
        let mut ends = Vec::new();
        let mut earliest: Option<Instant> = None;
        let mut idle = false;

        for &index in &self.admitted {
            let handle = &self.members[index];
            let handle_ends = handle.read_ends();
            idle |= handle_ends.is_empty();
            ends.extend(handle_ends);
            if let Some(at) = handle.deadline() {
                earliest = Some(earliest.map_or(at, |current| current.min(at)));
            }
        }

        let bound = earliest.map(|at| at.saturating_duration_since(now));
        let bound = if idle { Some(cap(bound, IDLE_TICK)) } else { bound };
        (ends, bound)
    }

    fn step_admitted(&mut self) {
        let members = &self.members;
        let failures = &mut self.failures;
        self.admitted.retain(|&index| match members[index].step() {
            Ok(running) => {
                if !running {
                    debug!(index, "pool member finished");
                }
                running
            }
            Err(error) => {
                warn!(index, error = %error, "pool member failed");
                failures.push(PoolFailure { index, error });
                false
            }
        });
    }

    fn admit(&mut self) {
        while self.admitted.len() < self.capacity {
            let Some(index) = self.queue.pop_front() else {
                break;
            };
            match launch(&mut *self.members[index]) {
                Ok(()) => {
                    debug!(index, pid = ?self.members[index].pid(), "pool member admitted");
                    self.admitted.push(index);
                }
                Err(error) => {
                    warn!(index, error = %error, "pool member could not start");
                    self.failures.push(PoolFailure { index, error });
                }
            }
        }
    }
}

fn launch(handle: &mut ProcessHandle) -> Result<()> {
    handle.run_in_background(true)?;
    handle.start()
}

impl fmt::Debug for ProcessPool<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessPool")
            .field("members", &self.members.len())
            .field("queued", &self.queue.len())
            .field("admitted", &self.admitted)
            .field("capacity", &self.capacity)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}
