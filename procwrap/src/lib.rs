//! Procwrap - run child processes with timeouts, arbitrary descriptor
//! wiring and pluggable output accumulation.
//!
//! Timeouts end in `SIGKILL`; the signal shows up as the exit code, never
//! as an error.

pub mod error;
pub mod process;

pub use error::{ProcError, Result};
pub use process::{Command, ProcessConfig, ProcessHandle, ProcessPool};
