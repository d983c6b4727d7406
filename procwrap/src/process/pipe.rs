//! Parent-side pipe ends and the byte accumulation strategies fed by them.
//!
//! A [`PipeDelegate`] is attached to every pipe descriptor. Before spawn it
//! holds nothing but its strategy; after spawn it owns the parent end of the
//! pipe. Pipes the child writes to are read in non-blocking chunks and folded
//! into an accumulation buffer. Pipes the child reads from are exposed through
//! a [`PipeWriter`], which can be cloned out before spawn and handed to a
//! strategy that needs to answer the child.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tracing::debug;

use super::descriptor::PipeDirection;

const CHUNK_SIZE: usize = 8192;

/// Readable parent end of a pipe, shared with readiness waiters.
pub(crate) type ReadEnd = Arc<AsyncFd<File>>;

/// Folds newly read bytes into the accumulated output of a pipe.
///
/// Closures of the shape `FnMut(Vec<u8>, &[u8]) -> Vec<u8>` implement this
/// trait, so most callers never name it.
pub trait Accumulate: Send {
    /// Return the new accumulated buffer after `chunk` arrived.
    fn accumulate(&mut self, accumulated: Vec<u8>, chunk: &[u8]) -> Vec<u8>;

    /// Keep the stream in blocking mode instead of switching it to
    /// non-blocking on install. While the child runs, a blocking stream is
    /// read at most once per [`PipeDelegate::read_chunk`] and never waits.
    fn blocking(&self) -> bool {
        false
    }
}

/// Default strategy: append every chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct Append;

impl Accumulate for Append {
    fn accumulate(&mut self, mut accumulated: Vec<u8>, chunk: &[u8]) -> Vec<u8> {
        accumulated.extend_from_slice(chunk);
        accumulated
    }
}

impl<F> Accumulate for F
where
    F: FnMut(Vec<u8>, &[u8]) -> Vec<u8> + Send,
{
    fn accumulate(&mut self, accumulated: Vec<u8>, chunk: &[u8]) -> Vec<u8> {
        self(accumulated, chunk)
    }
}

/// Writing endpoint for a pipe the child reads from.
///
/// All clones share one slot. The slot is filled when the process spawns and
/// emptied when the pipe is closed; writes while it is empty fail with
/// [`io::ErrorKind::BrokenPipe`].
#[derive(Clone, Default)]
pub struct PipeWriter {
    slot: Arc<Mutex<Option<File>>>,
}

impl PipeWriter {
    /// Whether the writer is connected to a live child.
    pub fn is_connected(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Close the parent end, delivering EOF to the child.
    pub fn close(&self) {
        self.slot.lock().take();
    }

    fn install(&self, file: File) {
        *self.slot.lock() = Some(file);
    }

    fn with_file<T>(&self, op: impl FnOnce(&mut File) -> io::Result<T>) -> io::Result<T> {
        self.slot.lock().as_mut().map_or_else(
            || {
                Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe is not connected to a running process",
                ))
            },
            op,
        )
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_file(|file| file.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_file(Write::flush)
    }
}

impl fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeWriter")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Outcome of one drain attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Everything available was consumed; more may follow.
    Pending,
    /// The child closed its end.
    Eof,
    /// No readable stream is installed.
    Detached,
}

enum Stream {
    Detached,
    Reading {
        end: ReadEnd,
        exhausted: bool,
        mode: ReadMode,
    },
    Writing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    /// `O_NONBLOCK` set: read until `WouldBlock`.
    NonBlocking,
    /// Left blocking for the strategy: one read per call.
    Blocking,
    /// Final drain after exit: read until EOF.
    Draining,
}

/// Owner of a live pipe end plus its accumulated data.
pub struct PipeDelegate {
    direction: PipeDirection,
    strategy: Box<dyn Accumulate>,
    data: Vec<u8>,
    stream: Stream,
    writer: PipeWriter,
}

impl PipeDelegate {
    /// Delegate with the default append strategy.
    pub fn new(direction: PipeDirection) -> Self {
        Self::with_strategy(direction, Append)
    }

    pub fn with_strategy(direction: PipeDirection, strategy: impl Accumulate + 'static) -> Self {
        Self {
            direction,
            strategy: Box::new(strategy),
            data: Vec::new(),
            stream: Stream::Detached,
            writer: PipeWriter::default(),
        }
    }

    /// Install the parent end of the pipe after spawn.
    ///
    /// Any previous stream is closed and the accumulated data is reset. Must
    /// run inside a tokio runtime when the child writes to this pipe.
    pub fn set_stream(&mut self, fd: OwnedFd) -> io::Result<()> {
        self.close();
        self.data.clear();
        let file = File::from(fd);

        match self.direction {
            PipeDirection::Write => {
                let mode = if self.strategy.blocking() {
                    ReadMode::Blocking
                } else {
                    set_nonblocking(&file, true)?;
                    ReadMode::NonBlocking
                };
                if tokio::runtime::Handle::try_current().is_err() {
                    return Err(io::Error::other(
                        "pipe readers must be installed inside a tokio runtime",
                    ));
                }
                self.stream = Stream::Reading {
                    end: Arc::new(AsyncFd::new(file)?),
                    exhausted: false,
                    mode,
                };
            }
            PipeDirection::Read => {
                self.writer.install(file);
                self.stream = Stream::Writing;
            }
        }
        Ok(())
    }

    /// Read whatever is available and fold it through the strategy.
    ///
    /// In non-blocking mode this stops at `WouldBlock`. A blocking strategy
    /// gets a single read, done with `O_NONBLOCK` briefly set so a silent
    /// child cannot stall the caller. After
    /// [`make_blocking`](Self::make_blocking) it reads until EOF.
    pub fn read_chunk(&mut self) -> ReadStatus {
        let Stream::Reading {
            end,
            exhausted,
            mode,
        } = &mut self.stream
        else {
            return ReadStatus::Detached;
        };
        if *exhausted {
            return ReadStatus::Eof;
        }

        let single = *mode == ReadMode::Blocking;
        if single {
            if let Err(error) = set_nonblocking(end.get_ref(), true) {
                debug!(error = %error, "could not guard blocking read, skipping");
                return ReadStatus::Pending;
            }
        }

        let mut chunk = Vec::new();
        let mut buf = [0u8; CHUNK_SIZE];
        let mut file: &File = end.get_ref();
        let status = loop {
            match file.read(&mut buf) {
                Ok(0) => {
                    *exhausted = true;
                    break ReadStatus::Eof;
                }
                Ok(n) => {
                    chunk.extend_from_slice(&buf[..n]);
                    if single {
                        break ReadStatus::Pending;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break ReadStatus::Pending,
                Err(e) => {
                    debug!(error = %e, "pipe read failed, treating as closed");
                    *exhausted = true;
                    break ReadStatus::Eof;
                }
            }
        };

        if single {
            if let Err(error) = set_nonblocking(end.get_ref(), false) {
                debug!(error = %error, "could not restore blocking mode");
            }
        }

        if !chunk.is_empty() {
            let accumulated = mem::take(&mut self.data);
            self.data = self.strategy.accumulate(accumulated, &chunk);
        }
        status
    }

    /// Switch a readable stream to blocking mode for the final drain.
    pub fn make_blocking(&mut self) -> io::Result<()> {
        if let Stream::Reading { end, mode, .. } = &mut self.stream {
            set_nonblocking(end.get_ref(), false)?;
            *mode = ReadMode::Draining;
        }
        Ok(())
    }

    /// Release the OS stream, if any. Idempotent.
    pub fn close(&mut self) {
        self.stream = Stream::Detached;
        self.writer.close();
    }

    /// Close and forget accumulated data.
    pub(crate) fn reset(&mut self) {
        self.close();
        self.data.clear();
    }

    /// Readable end still worth waiting on, if any.
    pub(crate) fn read_end(&self) -> Option<ReadEnd> {
        match &self.stream {
            Stream::Reading {
                end,
                exhausted: false,
                ..
            } => Some(Arc::clone(end)),
            _ => None,
        }
    }

    pub const fn direction(&self) -> PipeDirection {
        self.direction
    }

    /// Bytes accumulated so far.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Writing endpoint; only connected for pipes the child reads from.
    pub fn writer(&self) -> PipeWriter {
        self.writer.clone()
    }

    pub const fn is_attached(&self) -> bool {
        !matches!(self.stream, Stream::Detached)
    }
}

impl fmt::Debug for PipeDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeDelegate")
            .field("direction", &self.direction)
            .field("attached", &self.is_attached())
            .field("buffered", &self.data.len())
            .finish_non_exhaustive()
    }
}

/// Toggle `O_NONBLOCK` on a descriptor.
pub(crate) fn set_nonblocking(fd: &impl AsRawFd, nonblocking: bool) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let mut flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL)?);
    flags.set(OFlag::O_NONBLOCK, nonblocking);
    fcntl(raw, FcntlArg::F_SETFL(flags))?;
    Ok(())
}
