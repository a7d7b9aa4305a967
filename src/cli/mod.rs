//! CLI module for the Keelson deployment tool.
//!
//! This module provides the command-line interface: argument parsing
//! and output formatting. Command handlers live in the binary.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, StateCommands};
pub use output::OutputFormatter;
