// CLI module - Command line parsing and command dispatch
pub mod args;
pub mod commands;

pub use args::{Args, Command};
pub use commands::execute_command;
