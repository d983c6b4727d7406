//! Child process lifecycle management.
//!
//! A [`Command`] describes what to run and how its descriptors are wired. A
//! [`ProcessHandle`] runs it, in the foreground or driven by `poll`, and
//! kills it at its deadline. A [`ProcessPool`] runs many handles under a
//! concurrency limit. Deadlines of background handles are enforced by a
//! shared [`TimeoutCoordinator`].

mod command;
mod coordinator;
mod descriptor;
mod handle;
mod pipe;
mod pool;
mod readiness;
mod spawn;

#[cfg(test)]
mod testing;

pub use command::{Command, Program, SHELL};
pub use coordinator::TimeoutCoordinator;
pub use descriptor::{
    DescriptorNumber, FileMode, IoDescriptor, PipeDescriptor, PipeDirection, Wiring, STDERR, STDIN,
    STDOUT,
};
pub use handle::{
    ExitOutcome, ProcessConfig, ProcessHandle, ProcessState, TimeoutStart, KILL_SIGNAL,
};
pub use pipe::{Accumulate, Append, PipeDelegate, PipeWriter, ReadStatus};
pub use pool::{MemberIndex, PoolFailure, ProcessPool};
