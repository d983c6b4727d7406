//! CLI argument parsing module.

mod args;
mod commands;
pub mod logging;

pub use args::Cli;
pub use commands::execute;
