//! Device configuration
//!
//! Loaded with figment from a YAML/TOML/JSON file, then overridden by
//! `USBTIN_`-prefixed environment variables. Nested keys use a double
//! underscore: `USBTIN_SERIAL__PORT=/dev/ttyACM1`.

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::bit_timing::DEFAULT_OSCILLATOR_HZ;
use crate::error::{Result, UsbtinError};
use crate::logging::LogConfig;
use crate::transport::{SerialTransportConfig, TransportConfig};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "USBTIN_";

/// Everything a [`Device`](crate::Device) needs besides the port name
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Serial line settings; `port` is used by `Device::connect` only when
    /// no explicit port is given
    pub serial: SerialTransportConfig,
    /// Bound on one command transaction
    pub command_timeout_ms: u64,
    /// Pause after the forced close before purging buffers
    pub settle_delay_ms: u64,
    /// Longest time the dispatcher holds the transport per read
    pub poll_interval_ms: u64,
    /// MCP2515 clock
    pub oscillator_hz: u32,
    /// Give up on a frame after this many NAKs; unset retries forever
    pub nak_retry_limit: Option<u32>,
    pub logging: LogConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial: SerialTransportConfig::default(),
            command_timeout_ms: 1000,
            settle_delay_ms: 100,
            poll_interval_ms: 10,
            oscillator_hz: DEFAULT_OSCILLATOR_HZ,
            nak_retry_limit: None,
            logging: LogConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Defaults, then `path`, then environment
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| UsbtinError::config("Config file must have an extension"))?;

        let figment = Figment::from(Serialized::defaults(Self::default()));
        let figment = match extension {
            "toml" => figment.merge(Toml::file(path)),
            "yaml" | "yml" => figment.merge(Yaml::file(path)),
            "json" => figment.merge(Json::file(path)),
            _ => {
                return Err(UsbtinError::config(format!(
                    "Unsupported config file format: {extension}"
                )))
            }
        };

        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Defaults overridden by environment only
    pub fn from_env() -> Result<Self> {
        Self::extract(
            Figment::from(Serialized::defaults(Self::default()))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.serial
            .validate()
            .map_err(|e| UsbtinError::config(e.to_string()))?;

        if self.command_timeout_ms == 0 {
            return Err(UsbtinError::config("command_timeout_ms must be greater than zero"));
        }
        if self.poll_interval_ms == 0 {
            return Err(UsbtinError::config("poll_interval_ms must be greater than zero"));
        }
        if self.oscillator_hz == 0 {
            return Err(UsbtinError::config("oscillator_hz must be greater than zero"));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
