//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate a configuration file, then print a summary
    CheckConfig {
        /// Also print the effective configuration as TOML
        #[arg(long)]
        dump: bool,
    },
    /// Run the whole delivery pipeline in memory with simulated clients
    Simulate {
        /// Number of simulated users
        #[arg(short, long, default_value_t = 20)]
        users: usize,
        /// Messages pushed to every user
        #[arg(short, long, default_value_t = 5)]
        messages: usize,
        /// Seconds to wait for each phase to settle
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}
