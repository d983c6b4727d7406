//! Spawn specification for a child process.
//!
//! A [`Command`] names the program (an argument vector or a shell string),
//! the environment and working directory, and the descriptor map that wires
//! the child's numbered channels.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use super::descriptor::{DescriptorNumber, IoDescriptor, PipeDescriptor, PipeDirection};
use super::descriptor::{STDERR, STDIN, STDOUT};
use super::pipe::PipeWriter;

/// Shell used for raw command strings.
pub const SHELL: &str = "/bin/sh";

/// What to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Program {
    /// Executed directly; a kill reaches the program itself.
    Argv(Vec<String>),
    /// Run through `/bin/sh -c`. A kill reaches the shell, which does not
    /// necessarily take its own children down with it.
    Shell(String),
}

/// Spawn specification: program, environment and descriptor map.
#[derive(Debug)]
pub struct Command {
    pub(crate) program: Program,
    pub(crate) working_dir: Option<PathBuf>,
    pub(crate) env: HashMap<String, String>,
    pub(crate) env_remove: Vec<String>,
    pub(crate) env_clear: bool,
    pub(crate) descriptors: BTreeMap<DescriptorNumber, IoDescriptor>,
}

impl Command {
    /// Execute `program` directly with no arguments yet.
    pub fn new(program: impl Into<String>) -> Self {
        Self::with_program(Program::Argv(vec![program.into()]))
    }

    /// Execute a full argument vector; the first element is the program.
    pub fn from_argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_program(Program::Argv(argv.into_iter().map(Into::into).collect()))
    }

    /// Run `script` through the shell.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::with_program(Program::Shell(script.into()))
    }

    fn with_program(program: Program) -> Self {
        Self {
            program,
            working_dir: None,
            env: HashMap::new(),
            env_remove: Vec::new(),
            env_clear: false,
            descriptors: default_descriptors(),
        }
    }

    /// Add an argument. Ignored for shell strings.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        if let Program::Argv(argv) = &mut self.program {
            argv.push(arg.into());
        }
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Program::Argv(argv) = &mut self.program {
            argv.extend(args.into_iter().map(Into::into));
        }
        self
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set multiple environment variables.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    /// Remove an environment variable.
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    /// Clear the environment before setting variables.
    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    /// Wire a descriptor, replacing any previous wiring of the same number.
    pub fn descriptor(mut self, descriptor: IoDescriptor) -> Self {
        self.insert_descriptor(descriptor);
        self
    }

    /// Replace the whole descriptor map. Later entries win on duplicate
    /// numbers.
    pub fn descriptors(mut self, descriptors: impl IntoIterator<Item = IoDescriptor>) -> Self {
        self.descriptors.clear();
        for descriptor in descriptors {
            self.insert_descriptor(descriptor);
        }
        self
    }

    /// Leave a descriptor unwired; the child inherits the parent's.
    pub fn without_descriptor(mut self, number: DescriptorNumber) -> Self {
        self.descriptors.remove(&number);
        self
    }

    pub const fn program(&self) -> &Program {
        &self.program
    }

    /// Human-readable form for logs and reports.
    pub fn display_name(&self) -> String {
        match &self.program {
            Program::Argv(argv) => argv.join(" "),
            Program::Shell(script) => script.clone(),
        }
    }

    pub fn io_descriptor(&self, number: DescriptorNumber) -> Option<&IoDescriptor> {
        self.descriptors.get(&number)
    }

    /// Descriptor numbers in ascending order.
    pub fn descriptor_numbers(&self) -> impl Iterator<Item = DescriptorNumber> + '_ {
        self.descriptors.keys().copied()
    }

    /// Writer for the child's stdin, when stdin is a pipe.
    ///
    /// Obtain it before spawn to hand it to an accumulation strategy.
    pub fn stdin_writer(&self) -> Option<PipeWriter> {
        self.pipe(STDIN)
            .filter(|pipe| pipe.direction() == PipeDirection::Read)
            .map(PipeDescriptor::writer)
    }

    pub(crate) fn insert_descriptor(&mut self, descriptor: IoDescriptor) {
        self.descriptors.insert(descriptor.number(), descriptor);
    }

    pub(crate) fn remove_descriptor(&mut self, number: DescriptorNumber) -> Option<IoDescriptor> {
        self.descriptors.remove(&number)
    }

    pub(crate) fn pipe(&self, number: DescriptorNumber) -> Option<&PipeDescriptor> {
        self.descriptors.get(&number).and_then(IoDescriptor::as_pipe)
    }

    pub(crate) fn pipe_mut(&mut self, number: DescriptorNumber) -> Option<&mut PipeDescriptor> {
        self.descriptors
            .get_mut(&number)
            .and_then(IoDescriptor::as_pipe_mut)
    }

    pub(crate) fn pipes_mut(&mut self) -> impl Iterator<Item = &mut PipeDescriptor> {
        self.descriptors
            .values_mut()
            .filter_map(IoDescriptor::as_pipe_mut)
    }

    pub(crate) fn write_pipes(&self) -> impl Iterator<Item = &PipeDescriptor> {
        self.descriptors
            .values()
            .filter_map(IoDescriptor::as_pipe)
            .filter(|pipe| pipe.is_write_pipe())
    }

    pub(crate) fn write_pipes_mut(&mut self) -> impl Iterator<Item = &mut PipeDescriptor> {
        self.pipes_mut().filter(|pipe| pipe.is_write_pipe())
    }
}

fn default_descriptors() -> BTreeMap<DescriptorNumber, IoDescriptor> {
    [
        IoDescriptor::pipe(STDIN, PipeDirection::Read),
        IoDescriptor::pipe(STDOUT, PipeDirection::Write),
        IoDescriptor::pipe(STDERR, PipeDirection::Write),
    ]
    .into_iter()
    .map(|descriptor| (descriptor.number(), descriptor))
    .collect()
}
