//! Server settings file.
//!
//! Settings are read from a JSON file whose keys mirror the command-line
//! flags of the server binary. Every key is optional; anything left out falls
//! back to the server's defaults, and command-line flags override the file.
//!
//! ```json
//! {
//!   "port": 5688,
//!   "bind": "0.0.0.0",
//!   "mode": "tickCount",
//!   "notifyIntervalMs": 1000,
//!   "maxSubscriptions": 256,
//!   "observeOffset": 0,
//!   "observePath": "some/path"
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::mode::ResourceMode;

/// Errors that can occur while loading settings.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the settings file.
    ReadError(String),
    /// Settings data is invalid.
    InvalidData(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(msg) => write!(f, "Read error: {}", msg),
            ConfigError::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Server settings as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServerSettings {
    /// UDP port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Address to bind to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Resource mode at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ResourceMode>,

    /// Milliseconds between notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_interval_ms: Option<u64>,

    /// Upper bound on concurrent subscriptions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subscriptions: Option<usize>,

    /// First sequence number of every subscription.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observe_offset: Option<u32>,

    /// Uri-Path of the observable resource, without leading slash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observe_path: Option<String>,
}

impl ServerSettings {
    /// Parse settings from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: ServerSettings =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidData(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.notify_interval_ms == Some(0) {
            return Err(ConfigError::InvalidData(
                "notifyIntervalMs must be at least 1".to_string(),
            ));
        }
        if self.max_subscriptions == Some(0) {
            return Err(ConfigError::InvalidData(
                "maxSubscriptions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
