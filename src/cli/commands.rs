//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Keelson - Declarative deployment convergence engine.
#[derive(Parser, Debug)]
#[command(name = "keelson")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "KEELSON_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new Keelson project.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the deploy spec and build its resource graph.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show the changes an apply would make.
    Plan {
        /// Plan the removal of every tracked resource instead.
        #[arg(long)]
        destroy: bool,
    },

    /// Converge resources onto the deploy spec.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Override the maximum number of concurrent provider calls.
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Delete every tracked resource.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Override the maximum number of concurrent provider calls.
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Inspect and repair recorded state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// Release a lease left behind by an interrupted run.
    Unlock {
        /// Lease ID to release.
        #[arg(long)]
        lease_id: Option<String>,

        /// Remove the lease regardless of holder (dangerous).
        #[arg(long)]
        force: bool,
    },

    /// Stop tracking a resource without deleting it.
    Forget {
        /// Logical name of the resource.
        name: String,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable log lines.
    #[default]
    Text,
    /// One JSON object per log event.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_apply_flags() {
        let cli = Cli::try_parse_from(["keelson", "apply", "--yes", "--concurrency", "8"]).unwrap();
        match cli.command {
            Commands::Apply { yes, concurrency } => {
                assert!(yes);
                assert_eq!(concurrency, Some(8));
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(cli.output, OutputFormat::Text);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "keelson",
            "state",
            "forget",
            "db",
            "--output",
            "json",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Forget { ref name }
            } if name == "db"
        ));
    }
}
