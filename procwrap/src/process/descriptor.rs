//! Descriptor wiring for child processes.

use std::fmt;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::pipe::{Accumulate, PipeDelegate, PipeWriter};

/// Descriptor number as seen by the child.
pub type DescriptorNumber = u32;

pub const STDIN: DescriptorNumber = 0;
pub const STDOUT: DescriptorNumber = 1;
pub const STDERR: DescriptorNumber = 2;

/// How a file redirect is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    /// Create or truncate.
    Write,
    /// Create or append.
    Append,
}

/// Which end of a pipe is handed to the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeDirection {
    /// The child reads (e.g. stdin); the parent writes.
    Read,
    /// The child writes (e.g. stdout); the parent reads and polls it.
    Write,
}

/// Spawn-time directive for one descriptor.
#[derive(Debug)]
pub enum Wiring<'a> {
    File { path: &'a Path, mode: FileMode },
    Inherited(BorrowedFd<'a>),
    Pipe(PipeDirection),
}

/// A pipe descriptor together with its delegate.
#[derive(Debug)]
pub struct PipeDescriptor {
    number: DescriptorNumber,
    direction: PipeDirection,
    delegate: PipeDelegate,
}

impl PipeDescriptor {
    pub fn new(number: DescriptorNumber, direction: PipeDirection) -> Self {
        Self {
            number,
            direction,
            delegate: PipeDelegate::new(direction),
        }
    }

    pub fn with_strategy(
        number: DescriptorNumber,
        direction: PipeDirection,
        strategy: impl Accumulate + 'static,
    ) -> Self {
        Self {
            number,
            direction,
            delegate: PipeDelegate::with_strategy(direction, strategy),
        }
    }

    pub const fn number(&self) -> DescriptorNumber {
        self.number
    }

    pub const fn direction(&self) -> PipeDirection {
        self.direction
    }

    /// Whether the child writes to this pipe.
    pub fn is_write_pipe(&self) -> bool {
        self.direction == PipeDirection::Write
    }

    pub const fn delegate(&self) -> &PipeDelegate {
        &self.delegate
    }

    pub fn delegate_mut(&mut self) -> &mut PipeDelegate {
        &mut self.delegate
    }

    pub fn writer(&self) -> PipeWriter {
        self.delegate.writer()
    }

    pub fn data(&self) -> &[u8] {
        self.delegate.data()
    }
}

/// How a numbered channel of the child is wired.
pub enum IoDescriptor {
    /// Redirect to a file on disk.
    File {
        number: DescriptorNumber,
        path: PathBuf,
        mode: FileMode,
    },
    /// Pass through a stream owned elsewhere. It is duplicated for the child
    /// and never closed here.
    Inherited {
        number: DescriptorNumber,
        stream: Arc<dyn AsFd + Send + Sync>,
    },
    /// A pipe with an accumulation delegate.
    Pipe(PipeDescriptor),
}

impl IoDescriptor {
    pub fn file(number: DescriptorNumber, path: impl Into<PathBuf>, mode: FileMode) -> Self {
        Self::File {
            number,
            path: path.into(),
            mode,
        }
    }

    pub fn inherited(number: DescriptorNumber, stream: impl AsFd + Send + Sync + 'static) -> Self {
        Self::Inherited {
            number,
            stream: Arc::new(stream),
        }
    }

    pub fn pipe(number: DescriptorNumber, direction: PipeDirection) -> Self {
        Self::Pipe(PipeDescriptor::new(number, direction))
    }

    pub fn pipe_with(
        number: DescriptorNumber,
        direction: PipeDirection,
        strategy: impl Accumulate + 'static,
    ) -> Self {
        Self::Pipe(PipeDescriptor::with_strategy(number, direction, strategy))
    }

    pub const fn number(&self) -> DescriptorNumber {
        match self {
            Self::File { number, .. } | Self::Inherited { number, .. } => *number,
            Self::Pipe(pipe) => pipe.number(),
        }
    }

    /// Directive consumed by the spawn primitive.
    pub fn description(&self) -> Wiring<'_> {
        match self {
            Self::File { path, mode, .. } => Wiring::File { path, mode: *mode },
            Self::Inherited { stream, .. } => Wiring::Inherited(stream.as_fd()),
            Self::Pipe(pipe) => Wiring::Pipe(pipe.direction()),
        }
    }

    pub const fn as_pipe(&self) -> Option<&PipeDescriptor> {
        match self {
            Self::Pipe(pipe) => Some(pipe),
            _ => None,
        }
    }

    pub fn as_pipe_mut(&mut self) -> Option<&mut PipeDescriptor> {
        match self {
            Self::Pipe(pipe) => Some(pipe),
            _ => None,
        }
    }
}

impl fmt::Debug for IoDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { number, path, mode } => f
                .debug_struct("File")
                .field("number", number)
                .field("path", path)
                .field("mode", mode)
                .finish(),
            Self::Inherited { number, stream } => f
                .debug_struct("Inherited")
                .field("number", number)
                .field("fd", &stream.as_fd())
                .finish(),
            Self::Pipe(pipe) => pipe.fmt(f),
        }
    }
}
