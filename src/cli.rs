// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `shield`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "shield",
    version,
    about = "Schedule backup jobs and run plugin pipelines locally or on remote agents.",
    long_about = None
)]
pub struct CliArgs {
    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `SHIELD_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the scheduler and dispatch tasks to the worker pool.
    Supervisor {
        /// Path to the config file (TOML).
        #[arg(long, value_name = "PATH", default_value = "shield.toml")]
        config: String,

        /// Parse + validate, print jobs and their first run, then exit.
        #[arg(long)]
        dry_run: bool,
    },

    /// Serve plugin pipelines to supervisors over SSH.
    Agent {
        /// Path to the config file (TOML).
        #[arg(long, value_name = "PATH", default_value = "shield.toml")]
        config: String,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
