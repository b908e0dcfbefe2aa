//! Service configuration
//!
//! YAML file merged with `BUSSRV_`-prefixed environment overrides, e.g.
//! `BUSSRV_GATEWAY__HOST=10.0.0.7` overrides `gateway.host`.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use buslink::BusTransportConfig;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::devices::switch::button_identify;
use crate::error::{BusSrvError, Result};

/// Largest button count a wall-switch panel carries
pub const MAX_BUTTONS: u8 = 8;

/// Gateway endpoint and reconnect tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway host address
    pub host: String,
    /// Gateway port number
    pub port: u16,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Reconnect delay ceiling in seconds
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_retry_delay() -> u64 {
    60
}

impl GatewayConfig {
    /// Transport configuration for this gateway
    pub fn transport_config(&self) -> BusTransportConfig {
        BusTransportConfig {
            host: self.host.clone(),
            port: self.port,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(self.max_retry_delay_secs),
        }
    }
}

/// Supported device models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceModel {
    /// LP-F8 wall-switch panel
    WallSwitch,
    /// CMD82-5S motorized curtain
    Curtain,
}

impl DeviceModel {
    /// Hardware model code
    pub fn hardware_model(&self) -> &'static str {
        match self {
            DeviceModel::WallSwitch => "LP-F8",
            DeviceModel::Curtain => "CMD82-5S",
        }
    }
}

impl std::fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceModel::WallSwitch => write!(f, "wall_switch"),
            DeviceModel::Curtain => write!(f, "curtain"),
        }
    }
}

/// One logical device on the shared bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device id, also used as the subscription id prefix
    pub id: String,
    pub model: DeviceModel,
    /// Bus address of the device
    pub slave: u16,
    /// Button count for wall-switch panels
    #[serde(default = "default_buttons")]
    pub buttons: u8,
    /// Whether the panel carries a relay; relay-less variants answer with a
    /// shifted record layout
    #[serde(default = "default_has_relay")]
    pub has_relay: bool,
}

fn default_buttons() -> u8 {
    1
}

fn default_has_relay() -> bool {
    true
}

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub devices: Vec<DeviceConfig>,
}

impl AppConfig {
    /// Load from a YAML file with `BUSSRV_` environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: AppConfig = Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("BUSSRV_").split("__"))
            .extract()
            .map_err(|e| BusSrvError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration before any connection is attempted
    pub fn validate(&self) -> Result<()> {
        if self.gateway.host.is_empty() {
            return Err(BusSrvError::config("gateway.host cannot be empty"));
        }
        if self.gateway.port == 0 {
            return Err(BusSrvError::config("gateway.port cannot be zero"));
        }
        if self.devices.is_empty() {
            return Err(BusSrvError::config("no devices configured"));
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if device.id.is_empty() {
                return Err(BusSrvError::config("device id cannot be empty"));
            }
            if !ids.insert(device.id.as_str()) {
                return Err(BusSrvError::Config(format!(
                    "duplicate device id: {}",
                    device.id
                )));
            }
            if device.slave == 0 {
                return Err(BusSrvError::Config(format!(
                    "{}: slave address cannot be zero",
                    device.id
                )));
            }
            if device.model == DeviceModel::WallSwitch {
                if device.buttons == 0 || device.buttons > MAX_BUTTONS {
                    return Err(BusSrvError::Config(format!(
                        "{}: button count must be 1..={MAX_BUTTONS}, got {}",
                        device.id, device.buttons
                    )));
                }
                // The identify derivation can overflow its wire field for
                // large slave addresses; reject instead of truncating
                for index in 1..=device.buttons {
                    button_identify(device.slave, index).map_err(|e| {
                        BusSrvError::Config(format!("{}: {e}", device.id))
                    })?;
                }
            }
        }
        Ok(())
    }
}
