//! Device configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::step_record::{StepCount, DEFAULT_MAX_STEPS, STEP_COUNT_LIMIT};

/// Step count reported when none is configured
pub const DEFAULT_TARGET_STEPS: u32 = 66_666;

/// Advertised name expected by the WeChat pedometer scan
pub const DEFAULT_DEVICE_NAME: &str = "WeixinBLE";

/// Company identifier carried in the manufacturer data field
pub const DEFAULT_COMPANY_ID: u16 = 0x2333;

/// Longest name BlueZ accepts for the local alias
pub const MAX_DEVICE_NAME_LEN: usize = 248;

/// Longest accepted wait for the address query
pub const MAX_ADDRESS_TIMEOUT_MS: u64 = 60_000;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the emulated pedometer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Step count served on the pedometer and target characteristics
    pub target_steps: u32,
    /// Upper bound for `target_steps`
    pub max_steps: u32,
    /// Advertised local name
    pub device_name: String,
    /// Manufacturer data company identifier
    pub company_id: u16,
    /// Maximum wait for the address query, in milliseconds
    pub address_timeout_ms: u64,
    /// Reject target writes that are not valid step records
    pub strict_target_writes: bool,
    /// HCI controller index (hciN)
    pub hci_index: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            target_steps: DEFAULT_TARGET_STEPS,
            max_steps: DEFAULT_MAX_STEPS,
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            company_id: DEFAULT_COMPANY_ID,
            address_timeout_ms: 5_000,
            strict_target_writes: false,
            hci_index: 0,
        }
    }
}

impl DeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reported step count
    pub fn with_target_steps(mut self, steps: u32) -> Self {
        self.target_steps = steps;
        self
    }

    /// Set the step count bound
    pub fn with_max_steps(mut self, max: u32) -> Self {
        self.max_steps = max;
        self
    }

    /// Set the advertised name
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    pub fn with_company_id(mut self, company_id: u16) -> Self {
        self.company_id = company_id;
        self
    }

    /// Set the address query timeout
    pub fn with_address_timeout(mut self, timeout: Duration) -> Self {
        self.address_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Enable or disable strict validation of target writes
    pub fn with_strict_target_writes(mut self, enabled: bool) -> Self {
        self.strict_target_writes = enabled;
        self
    }

    pub fn with_hci_index(mut self, index: u16) -> Self {
        self.hci_index = index;
        self
    }

    pub fn address_timeout(&self) -> Duration {
        Duration::from_millis(self.address_timeout_ms)
    }

    /// Check every field. Nothing touches the radio before this passes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_steps > STEP_COUNT_LIMIT {
            return Err(ConfigError::InvalidBound {
                max: self.max_steps,
                limit: STEP_COUNT_LIMIT,
            });
        }
        if self.target_steps > self.max_steps {
            return Err(ConfigError::StepsOutOfRange {
                value: self.target_steps,
                max: self.max_steps,
            });
        }
        if self.device_name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.device_name.len() > MAX_DEVICE_NAME_LEN {
            return Err(ConfigError::NameTooLong {
                len: self.device_name.len(),
                max: MAX_DEVICE_NAME_LEN,
            });
        }
        if self.address_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.address_timeout_ms > MAX_ADDRESS_TIMEOUT_MS {
            return Err(ConfigError::TimeoutTooLong {
                ms: self.address_timeout_ms,
                max: MAX_ADDRESS_TIMEOUT_MS,
            });
        }
        Ok(())
    }

    /// The validated step count
    pub fn step_count(&self) -> Result<StepCount, ConfigError> {
        self.validate()?;
        StepCount::with_max(self.target_steps, self.max_steps).map_err(|_| {
            ConfigError::StepsOutOfRange {
                value: self.target_steps,
                max: self.max_steps,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DeviceConfig::default();
        assert_eq!(config.target_steps, 66_666);
        assert_eq!(config.max_steps, 100_000);
        assert_eq!(config.device_name, "WeixinBLE");
        assert_eq!(config.company_id, 0x2333);
        assert_eq!(config.address_timeout(), Duration::from_secs(5));
        assert!(!config.strict_target_writes);
        assert!(config.validate().is_ok());
        assert_eq!(config.step_count().unwrap().value(), 66_666);
    }

    #[test]
    fn test_step_bounds() {
        assert_eq!(
            DeviceConfig::new().with_target_steps(100_001).validate(),
            Err(ConfigError::StepsOutOfRange {
                value: 100_001,
                max: 100_000
            })
        );
        assert!(DeviceConfig::new()
            .with_target_steps(100_000)
            .validate()
            .is_ok());
        assert!(DeviceConfig::new()
            .with_max_steps(1_000_000)
            .with_target_steps(500_000)
            .validate()
            .is_ok());
        assert_eq!(
            DeviceConfig::new().with_max_steps(0x0100_0000).validate(),
            Err(ConfigError::InvalidBound {
                max: 0x0100_0000,
                limit: STEP_COUNT_LIMIT
            })
        );
    }

    #[test]
    fn test_name_and_timeout_checks() {
        assert_eq!(
            DeviceConfig::new().with_device_name("").validate(),
            Err(ConfigError::EmptyName)
        );
        assert!(matches!(
            DeviceConfig::new()
                .with_device_name("x".repeat(300))
                .validate(),
            Err(ConfigError::NameTooLong { len: 300, .. })
        ));
        assert_eq!(
            DeviceConfig::new()
                .with_address_timeout(Duration::ZERO)
                .validate(),
            Err(ConfigError::ZeroTimeout)
        );
    }

    #[test]
    fn test_timeout_upper_bound() {
        assert_eq!(
            DeviceConfig::new()
                .with_address_timeout(Duration::from_millis(u64::MAX))
                .validate(),
            Err(ConfigError::TimeoutTooLong {
                ms: u64::MAX,
                max: MAX_ADDRESS_TIMEOUT_MS,
            })
        );
        assert!(DeviceConfig::new()
            .with_address_timeout(Duration::from_millis(MAX_ADDRESS_TIMEOUT_MS))
            .validate()
            .is_ok());
        assert!(matches!(
            DeviceConfig::new()
                .with_address_timeout(Duration::from_millis(MAX_ADDRESS_TIMEOUT_MS + 1))
                .validate(),
            Err(ConfigError::TimeoutTooLong { .. })
        ));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: DeviceConfig = toml::from_str(
            r#"
            target_steps = 1234
            device_name = "Pedo"
            "#,
        )
        .unwrap();
        assert_eq!(config.target_steps, 1234);
        assert_eq!(config.device_name, "Pedo");
        assert_eq!(config.max_steps, 100_000);
        assert_eq!(config.company_id, 0x2333);
        assert_eq!(config.address_timeout_ms, 5_000);
    }
}
