//! Shared fixtures for process tests.

use std::io::Write;

use super::command::Command;
use super::descriptor::{IoDescriptor, PipeDirection, STDOUT};

/// Prints `OK`, then echoes two lines read from stdin.
const HANDSHAKE: &str = "echo \"OK\" && read REPLY && echo $REPLY && read REPLY && echo $REPLY";

/// A command that answers the child over stdin from inside its stdout
/// strategy: `abc` after `OK`, then `last` after the echoed `abc`. What
/// remains accumulated at the end is the echoed `last`.
pub(crate) fn handshake(last: &'static str) -> Command {
    let command = Command::shell(HANDSHAKE);
    let mut stdin = command.stdin_writer().unwrap();
    let mut expect: Option<&'static [u8]> = None;

    let strategy = move |mut data: Vec<u8>, chunk: &[u8]| {
        data.extend_from_slice(chunk.trim_ascii_start());
        if expect.is_some_and(|line| data.starts_with(line)) {
            writeln!(stdin, "{last}").unwrap();
            expect = None;
            data.clear();
        } else if data.starts_with(b"OK") {
            writeln!(stdin, "abc").unwrap();
            expect = Some(b"abc");
            data.clear();
        }
        data
    };

    command.descriptor(IoDescriptor::pipe_with(STDOUT, PipeDirection::Write, strategy))
}
