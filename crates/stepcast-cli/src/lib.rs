//! Stepcast CLI library
//!
//! Argument parsing, layered configuration and the run modes of the
//! `stepcast` binary: serving through BlueZ, or a scripted session against the
//! virtual controller.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod simulate;

pub use app::run_device;
pub use cli::Cli;
pub use config::{AppConfig, SimulationConfig};
pub use error::{CliError, Result};
pub use simulate::{run_simulation, SimulationReport};
