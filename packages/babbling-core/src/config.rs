//! Controller configuration.
//!
//! Supports loading from YAML with environment variable overrides.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::{DeviceSelector, SessionTimeouts};
use crate::error::{BabblingError, BabblingResult};

/// Configuration loaded from YAML with environment overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Target device names. Empty means the first device that answers.
    /// Override: `BABBLING_DEVICE` (comma-separated)
    pub devices: Vec<String>,

    /// How long discovery may take, in milliseconds.
    /// Override: `BABBLING_DISCOVERY_TIMEOUT_MS`
    pub discovery_timeout_ms: u64,

    /// Wait window for correlated responses and statuses, in milliseconds.
    /// Override: `BABBLING_RESPONSE_TIMEOUT_MS`
    pub response_timeout_ms: u64,

    /// How long to wait for a launched app to be reported, in milliseconds.
    pub launch_timeout_ms: u64,

    /// Number of adjacent items returned for a queue request.
    pub queue_size: usize,

    /// Keep device connections open after a play completes.
    pub keep_alive: bool,

    /// Per-handler options, keyed by handler name.
    pub handlers: BTreeMap<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            discovery_timeout_ms: 15_000,
            response_timeout_ms: 5_000,
            launch_timeout_ms: 15_000,
            queue_size: 5,
            keep_alive: false,
            handlers: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file, then applies environment overrides.
    ///
    /// With no path, starts from the defaults.
    pub fn load(path: Option<&Path>) -> BabblingResult<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    BabblingError::Configuration(format!(
                        "Failed to read config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Self::from_yaml(&content)?
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parses YAML without applying overrides.
    pub fn from_yaml(content: &str) -> BabblingResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| BabblingError::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("BABBLING_DEVICE") {
            self.devices = val
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(val) = lookup("BABBLING_DISCOVERY_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.discovery_timeout_ms = ms;
            }
        }

        if let Some(val) = lookup("BABBLING_RESPONSE_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.response_timeout_ms = ms;
            }
        }
    }

    /// Rejects zero timeouts and an empty queue window.
    pub fn validate(&self) -> BabblingResult<()> {
        for (name, value) in [
            ("discovery_timeout_ms", self.discovery_timeout_ms),
            ("response_timeout_ms", self.response_timeout_ms),
            ("launch_timeout_ms", self.launch_timeout_ms),
        ] {
            if value == 0 {
                return Err(BabblingError::Configuration(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        if self.queue_size == 0 {
            return Err(BabblingError::Configuration(
                "queue_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            discovery: Duration::from_millis(self.discovery_timeout_ms),
            launch: Duration::from_millis(self.launch_timeout_ms),
            response: self.response_timeout(),
        }
    }

    /// One selector per configured device, or a single `Any`.
    pub fn selectors(&self) -> Vec<DeviceSelector> {
        if self.devices.is_empty() {
            vec![DeviceSelector::Any]
        } else {
            self.devices
                .iter()
                .map(|name| DeviceSelector::Named(name.clone()))
                .collect()
        }
    }

    /// Options for `handler`, or `Null` when none are configured.
    pub fn handler_options(&self, handler: &str) -> Value {
        self.handlers.get(handler).cloned().unwrap_or(Value::Null)
    }
}
