//! Persistent configuration for faultline.
//!
//! Operator settings live in `~/.faultline/config.json`. The instrumented app's
//! identity comes from its bundled manifest (`app.json`), which is parsed by
//! [`AppManifest`].
//!
//! # Example
//!
//! ```no_run
//! use faultline_core::config::FaultlineConfig;
//!
//! // Load (returns defaults if file doesn't exist)
//! let config = FaultlineConfig::load();
//! println!("control channel on {}", config.control_bind);
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_FILENAME: &str = "config.json";

/// Errors raised while reading configuration files.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read or written.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid JSON for the expected shape.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The manifest carries neither `name` nor `expo.name`.
    #[error("app manifest has no name")]
    MissingAppName,
}

/// Returns the faultline directory path (`~/.faultline/`).
///
/// Creates the directory if it doesn't exist. Falls back to the system temp
/// directory when no home directory can be determined.
pub fn faultline_dir() -> PathBuf {
    let dir = dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".faultline");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Returns the logs directory path (`~/.faultline/logs/`).
pub fn logs_dir() -> PathBuf {
    let dir = faultline_dir().join("logs");
    std::fs::create_dir_all(&dir).ok();
    dir
}

fn default_control_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_fault_server_url() -> String {
    "http://127.0.0.1:3000/api".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

/// Persistent faultline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FaultlineConfig {
    /// Address the tool-side control host binds to.
    #[serde(default = "default_control_bind")]
    pub control_bind: String,

    /// Base URL of the fault-injection server, including the `/api` prefix.
    #[serde(default = "default_fault_server_url")]
    pub fault_server_url: String,

    /// Default client-side timeout for outbound requests, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for FaultlineConfig {
    fn default() -> Self {
        Self {
            control_bind: default_control_bind(),
            fault_server_url: default_fault_server_url(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl FaultlineConfig {
    /// Load config from `~/.faultline/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        Self::load_from(&faultline_dir().join(CONFIG_FILENAME)).unwrap_or_default()
    }

    /// Load config from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Save config to `~/.faultline/config.json`.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&faultline_dir().join(CONFIG_FILENAME))
    }

    /// Save config to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Bundled app manifest.
///
/// Plain React Native style manifests carry a top-level `name`; Expo style
/// manifests nest it under `expo`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expo: Option<ExpoSection>,
}

/// The `expo` section of an app manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpoSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl AppManifest {
    /// Parse a manifest from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read and parse a manifest file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// A manifest carrying just a top-level name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            expo: None,
        }
    }

    /// Resolves the app identity: `name`, falling back to `expo.name`.
    pub fn app_name(&self) -> Result<&str, ConfigError> {
        self.name
            .as_deref()
            .filter(|name| !name.is_empty())
            .or_else(|| self.expo.as_ref().and_then(|expo| expo.name.as_deref()))
            .ok_or(ConfigError::MissingAppName)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_points_at_local_services() {
        let config = FaultlineConfig::default();
        assert_eq!(config.control_bind, "127.0.0.1:8080");
        assert_eq!(config.fault_server_url, "http://127.0.0.1:3000/api");
        assert_eq!(config.request_timeout_ms, 10_000);
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let loaded: FaultlineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(loaded, FaultlineConfig::default());
    }

    #[test]
    fn save_and_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = FaultlineConfig {
            control_bind: "0.0.0.0:9000".to_string(),
            ..FaultlineConfig::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(FaultlineConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn load_from_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FaultlineConfig::load_from(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn manifest_prefers_top_level_name() {
        let manifest =
            AppManifest::from_json(r#"{"name": "bare-app", "expo": {"name": "expo-app"}}"#).unwrap();
        assert_eq!(manifest.app_name().unwrap(), "bare-app");
    }

    #[test]
    fn manifest_falls_back_to_expo_name() {
        let manifest = AppManifest::from_json(r#"{"expo": {"name": "expo-app"}}"#).unwrap();
        assert_eq!(manifest.app_name().unwrap(), "expo-app");
    }

    #[test]
    fn manifest_without_name_is_an_error() {
        let manifest = AppManifest::from_json("{}").unwrap();
        assert!(matches!(manifest.app_name(), Err(ConfigError::MissingAppName)));
    }
}
