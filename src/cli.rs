// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `marathon`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "marathon",
    version,
    about = "Run long multi-milestone agent tasks that survive crashes.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the settings file (TOML). A missing file means all defaults.
    #[arg(long, global = true, value_name = "PATH", default_value = "Marathon.toml")]
    pub config: PathBuf,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `MARATHON_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Create a marathon from a plan file and run it in the foreground.
    ///
    /// Ctrl-C pauses it; `restart` picks it up again.
    Start {
        #[arg(long, value_name = "FILE")]
        plan: PathBuf,
        /// Directory the agent works in and artifacts are checked against.
        #[arg(long, value_name = "DIR")]
        workdir: Option<PathBuf>,
        /// Print every event, heartbeats included.
        #[arg(long)]
        verbose: bool,
    },
    /// Run the watchdog until Ctrl-C, resuming crashed marathons.
    Watch {
        #[arg(long)]
        verbose: bool,
    },
    /// Show one marathon, or all of them.
    Status {
        id: Option<String>,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// List pending approval requests.
    Approvals {
        #[arg(long)]
        json: bool,
    },
    Approve {
        marathon: String,
        request: String,
        #[arg(long, value_name = "NAME")]
        by: Option<String>,
    },
    /// Reject a request; the marathon pauses.
    Reject {
        marathon: String,
        request: String,
        #[arg(long)]
        reason: String,
        #[arg(long, value_name = "NAME")]
        by: Option<String>,
    },
    Pause {
        id: String,
    },
    /// Stop a marathon for good.
    Abort {
        id: String,
    },
    /// Reset failed milestones and run the marathon again in the foreground.
    Restart {
        id: String,
        #[arg(long)]
        verbose: bool,
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
