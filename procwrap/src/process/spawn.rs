//! OS process creation with arbitrary descriptor bindings.
//!
//! Descriptors 0, 1 and 2 are bound through [`Stdio`]. Higher numbers are
//! remapped in the child right before `exec`: every source is first moved
//! above the highest target so that no `dup2` clobbers another source.
//! While spawning, every free number up to the highest target is held open
//! in the parent, so std's exec-error pipe lands above the targets and a
//! failed `exec` is still reported.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Stdio};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{dup2, pipe2};
use tracing::debug;

use super::command::{Command, Program, SHELL};
use super::descriptor::{DescriptorNumber, FileMode, PipeDirection, Wiring};
use super::descriptor::{STDERR, STDIN, STDOUT};
use crate::error::{ProcError, Result};

/// A freshly spawned child and the parent ends of its pipes.
#[derive(Debug)]
pub(crate) struct Spawned {
    pub child: Child,
    pub streams: BTreeMap<DescriptorNumber, OwnedFd>,
}

/// Spawn `command` with its descriptor map wired in.
pub(crate) fn spawn(command: &Command) -> Result<Spawned> {
    let program = command.display_name();
    let mut cmd = match &command.program {
        Program::Argv(argv) => {
            let (first, rest) = argv
                .split_first()
                .ok_or_else(|| ProcError::usage("argument vector is empty"))?;
            let mut cmd = std::process::Command::new(first);
            cmd.args(rest);
            cmd
        }
        Program::Shell(script) => {
            let mut cmd = std::process::Command::new(SHELL);
            cmd.arg("-c").arg(script);
            cmd
        }
    };

    // Set working directory
    if let Some(ref dir) = command.working_dir {
        cmd.current_dir(dir);
    }

    // Handle environment
    if command.env_clear {
        cmd.env_clear();
    }

    for key in &command.env_remove {
        cmd.env_remove(key);
    }

    for (key, value) in &command.env {
        cmd.env(key, value);
    }

    let spawn_error = |source: io::Error| ProcError::Spawn {
        program: program.clone(),
        source,
    };

    let mut streams = BTreeMap::new();
    let mut held = Vec::new();
    let mut remaps: Vec<(RawFd, RawFd)> = Vec::new();

    for (&number, descriptor) in &command.descriptors {
        let target = RawFd::try_from(number)
            .map_err(|_| ProcError::usage(format!("descriptor number {number} is out of range")))?;
        let (child_end, parent_end) = bind(descriptor.description()).map_err(spawn_error)?;
        if let Some(parent_end) = parent_end {
            streams.insert(number, parent_end);
        }

        match number {
            STDIN => {
                cmd.stdin(Stdio::from(child_end));
            }
            STDOUT => {
                cmd.stdout(Stdio::from(child_end));
            }
            STDERR => {
                cmd.stderr(Stdio::from(child_end));
            }
            _ => {
                remaps.push((child_end.as_raw_fd(), target));
                held.push(child_end);
            }
        }
    }

    let mut reserved = Vec::new();
    if let Some(ceiling) = remaps.iter().map(|&(_, target)| target).max() {
        reserved = reserve_through(ceiling).map_err(spawn_error)?;
        install_remaps(&mut cmd, remaps);
    }

    let child = cmd.spawn().map_err(spawn_error)?;
    debug!(pid = child.id(), program = %program, "spawned process");

    // Our copies of the child ends must go before the first read, or the
    // parent ends never see EOF.
    drop(reserved);
    drop(held);
    drop(cmd);

    Ok(Spawned { child, streams })
}

/// Open the child end (and for pipes the parent end) of one descriptor.
fn bind(wiring: Wiring<'_>) -> io::Result<(OwnedFd, Option<OwnedFd>)> {
    match wiring {
        Wiring::File { path, mode } => Ok((open(path, mode)?.into(), None)),
        Wiring::Inherited(fd) => Ok((fd.try_clone_to_owned()?, None)),
        Wiring::Pipe(direction) => {
            let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)?;
            Ok(match direction {
                PipeDirection::Read => (read_end, Some(write_end)),
                PipeDirection::Write => (write_end, Some(read_end)),
            })
        }
    }
}

fn open(path: &std::path::Path, mode: FileMode) -> io::Result<File> {
    match mode {
        FileMode::Read => File::open(path),
        FileMode::Write => OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path),
        FileMode::Append => OpenOptions::new().append(true).create(true).open(path),
    }
}

/// Occupy every free descriptor number up to `ceiling`. The placeholders
/// are close-on-exec and get replaced by `dup2` in the child.
fn reserve_through(ceiling: RawFd) -> io::Result<Vec<File>> {
    let mut reserved = Vec::new();
    let mut next = File::open("/dev/null")?;
    while next.as_raw_fd() <= ceiling {
        // try_clone takes the lowest free number
        let clone = next.try_clone()?;
        reserved.push(next);
        next = clone;
    }
    Ok(reserved)
}

#[allow(unsafe_code)]
fn install_remaps(cmd: &mut std::process::Command, mut remaps: Vec<(RawFd, RawFd)>) {
    let floor = remaps.iter().map(|&(_, target)| target).max().unwrap_or(2) + 1;
    // SAFETY: the hook runs between fork and exec. It only calls fcntl
    // and dup2, both async-signal-safe, and never allocates.
    unsafe {
        cmd.pre_exec(move || remap(&mut remaps, floor));
    }
}

/// Runs in the child: park every source above `floor`, then move each onto
/// its target. `dup2` clears close-on-exec on the target.
fn remap(pairs: &mut [(RawFd, RawFd)], floor: RawFd) -> io::Result<()> {
    for pair in pairs.iter_mut() {
        pair.0 = fcntl(pair.0, FcntlArg::F_DUPFD_CLOEXEC(floor))?;
    }
    for &(source, target) in pairs.iter() {
        dup2(source, target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::descriptor::IoDescriptor;
    use std::io::Read;

    fn read_all(fd: OwnedFd) -> String {
        let mut out = String::new();
        File::from(fd).read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn test_spawn_default_pipes() {
        let Spawned { mut child, mut streams } = spawn(&Command::shell("echo hello")).unwrap();
        assert_eq!(streams.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);

        drop(streams.remove(&STDIN));
        assert_eq!(read_all(streams.remove(&STDOUT).unwrap()), "hello\n");
        assert!(child.wait().unwrap().success());
    }

    #[test]
    fn test_spawn_with_env_and_dir() {
        let cmd = Command::shell("echo $MY_VAR; pwd")
            .env("MY_VAR", "test_value")
            .working_dir("/tmp");
        let Spawned { mut child, mut streams } = spawn(&cmd).unwrap();

        let out = read_all(streams.remove(&STDOUT).unwrap());
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("test_value"));
        // On macOS, /tmp is a symlink to /private/tmp
        assert!(lines.next().is_some_and(|dir| dir.contains("tmp")));
        child.wait().unwrap();
    }

    #[test]
    fn test_spawn_high_descriptor() {
        let cmd = Command::shell("echo three >&3")
            .descriptor(IoDescriptor::pipe(3, PipeDirection::Write));
        let Spawned { mut child, mut streams } = spawn(&cmd).unwrap();

        assert_eq!(read_all(streams.remove(&3).unwrap()), "three\n");
        assert!(child.wait().unwrap().success());
    }

    #[test]
    fn test_spawn_file_redirect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let cmd = Command::shell("echo redirected")
            .descriptor(IoDescriptor::file(STDOUT, &path, FileMode::Write));
        let Spawned { mut child, streams } = spawn(&cmd).unwrap();

        assert!(!streams.contains_key(&STDOUT));
        assert!(child.wait().unwrap().success());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "redirected\n");
    }

    #[test]
    fn test_spawn_nonexistent() {
        let err = spawn(&Command::new("nonexistent_command_12345")).unwrap_err();
        assert!(matches!(err, ProcError::Spawn { .. }));
    }

    #[test]
    fn test_spawn_nonexistent_with_high_descriptor() {
        for number in 3..=32 {
            let cmd = Command::new("nonexistent_command_12345")
                .descriptor(IoDescriptor::pipe(number, PipeDirection::Write));
            let result = spawn(&cmd);
            assert!(
                matches!(result, Err(ProcError::Spawn { .. })),
                "descriptor {number}: {result:?}"
            );
        }
    }

    #[test]
    fn test_spawn_file_read_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let log = dir.path().join("log.txt");
        std::fs::write(&input, "from file\n").unwrap();
        std::fs::write(&log, "first\n").unwrap();

        let cmd = Command::shell("cat; echo second >&4").descriptors([
            IoDescriptor::file(STDIN, &input, FileMode::Read),
            IoDescriptor::file(STDOUT, &log, FileMode::Append),
            IoDescriptor::file(4, &log, FileMode::Append),
        ]);
        let Spawned { mut child, streams } = spawn(&cmd).unwrap();

        assert!(!streams.contains_key(&STDIN));
        assert!(child.wait().unwrap().success());
        assert_eq!(
            std::fs::read_to_string(&log).unwrap(),
            "first\nfrom file\nsecond\n"
        );
    }

    #[test]
    fn test_spawn_empty_argv() {
        let err = spawn(&Command::from_argv(Vec::<String>::new())).unwrap_err();
        assert!(err.is_usage());
    }
}
