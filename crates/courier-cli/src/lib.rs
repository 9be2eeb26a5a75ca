//! Courier CLI library
//!
//! Command definitions and the in-memory simulation behind the `courier`
//! binary.

pub mod cli;
pub mod commands;
pub mod error;
pub mod simulate;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use error::{CliError, Result};
pub use simulate::{Simulation, SimulationReport};
