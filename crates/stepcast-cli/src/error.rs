//! Error handling for the stepcast CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Stepcast core error: {0}")]
    Core(#[from] stepcast_core::StepcastError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] stepcast_core::ConfigError),

    #[error("Failed to open BLE device: {0}")]
    DeviceOpen(#[from] stepcast_core::DeviceOpenError),

    #[error("Simulation failed: {0}")]
    Simulation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

impl From<stepcast_core::TransportError> for CliError {
    fn from(err: stepcast_core::TransportError) -> Self {
        CliError::Simulation(err.to_string())
    }
}
