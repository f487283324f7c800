//! Command-line interface for Harbormaster
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use crate::logbook::LOG_FILE;
use crate::manifest::CONFIG_FILE;

/// Harbormaster - web site and application pool watchdog
#[derive(Parser)]
#[command(name = "harbormaster")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = CONFIG_FILE)]
    pub config: PathBuf,

    /// Operator log file path
    #[arg(short, long, default_value = LOG_FILE)]
    pub log_file: PathBuf,

    /// Service manager executable (defaults to appcmd.exe under %windir%)
    #[arg(long)]
    pub appcmd: Option<PathBuf>,

    /// Seconds before a service manager call is abandoned
    #[arg(long, default_value = "30")]
    pub command_timeout: u64,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the monitor until Ctrl+C, printing status periodically
    Watch {
        /// Status refresh interval in seconds
        #[arg(short, long, default_value = "5")]
        refresh: u64,

        /// Output snapshots in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Run a single check cycle and print the result
    Once {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show the current configuration
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List sites known to the service manager
    Sites,

    /// List application pools known to the service manager
    Pools,

    /// Replace the site configuration from a JSON file
    ImportSites {
        /// JSON object keyed by site name
        file: PathBuf,
    },

    /// Replace the pool configuration from a JSON file
    ImportPools {
        /// JSON object keyed by pool name
        file: PathBuf,
    },

    /// Change global monitoring settings
    Set {
        /// Seconds between check cycles (10-300)
        #[arg(short, long)]
        interval: Option<u64>,

        /// Consecutive failures before a restart (1-10)
        #[arg(short, long)]
        max_failures: Option<u32>,

        /// Master switch for automatic restarts
        #[arg(short, long)]
        auto_restart: Option<bool>,
    },

    /// Show the last lines of the operator log
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "harbormaster", &mut std::io::stdout());
    }
}
