//! Stepcast CLI configuration
//!
//! Settings are layered with increasing priority: built-in defaults, then the
//! TOML file given with `--config`, then command-line flags. The result is
//! validated before anything touches the radio.
//!
//! ```toml
//! [device]
//! target_steps = 88888
//! device_name = "WeixinBLE"
//! hci_index = 0
//!
//! [simulation]
//! central = "sim-central"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use stepcast_core::DeviceConfig;
use tracing::{debug, info};

use crate::cli::Cli;
use crate::error::Result;

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the stepcast binary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Emulated pedometer settings
    pub device: DeviceConfig,

    /// Scripted session settings for `--simulate`
    pub simulation: SimulationConfig,
}

/// Settings for the scripted virtual session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Identifier of the simulated central
    pub central: String,

    /// Status byte the virtual controller answers the address query with
    pub hci_status: u8,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            central: "sim-central".to_string(),
            hci_status: 0x00,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Override file values with whatever was given on the command line
    pub fn apply_cli(mut self, cli: &Cli) -> Self {
        if let Some(steps) = cli.steps {
            self.device = self.device.with_target_steps(steps);
        }
        if let Some(name) = &cli.name {
            self.device = self.device.with_device_name(name.clone());
        }
        if let Some(index) = cli.hci {
            self.device = self.device.with_hci_index(index);
        }
        if cli.strict_writes {
            self.device = self.device.with_strict_target_writes(true);
        }
        self
    }

    /// Build the effective configuration for this invocation and validate it
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let base = match &cli.config {
            Some(path) => {
                info!("Loading configuration from: {}", path);
                Self::load_from_file(path)?
            }
            None => {
                debug!("Using default configuration");
                Self::default()
            }
        };

        let config = base.apply_cli(cli);
        config.device.validate()?;
        Ok(config)
    }
}
