//! Deployment configuration.
//!
//! The signal→beat tunables are compile-time constants in
//! [`crate::tunables`]; this module covers the YAML-loaded deployment
//! surface: where to listen for sensors, where beats fan out to, and
//! whether to record inbound traffic. A missing or unparsable file falls
//! back to defaults so a bare `pulsebeat serve` always comes up.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Complete deployment configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub osc: OscConfig,
    pub capture: CaptureConfig,
}

/// OSC transport endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OscConfig {
    /// UDP bind address for /ppg and /reset ingress
    pub bind_addr: String,
    /// Unicast targets for /beat egress; may be empty for headless runs
    pub beat_targets: Vec<String>,
}

impl Default for OscConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            beat_targets: vec!["127.0.0.1:9001".to_string()],
        }
    }
}

/// Inbound capture settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Append every accepted inbound bundle to this JSONL file
    pub record_path: Option<PathBuf>,
}

impl AppConfig {
    /// Load configuration from a YAML file, falling back to defaults when
    /// the file is missing or invalid.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                    config
                }
                Err(err) => {
                    log::warn!(
                        "[Config] Failed to parse YAML from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!(
                    "[Config] Failed to read config file {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }

    /// Parse the configured beat targets; invalid entries are fatal at
    /// startup rather than silently skipped at send time.
    pub fn resolve_targets(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.osc
            .beat_targets
            .iter()
            .map(|value| {
                value.parse().map_err(|err| ConfigError::InvalidTarget {
                    value: value.clone(),
                    details: format!("{}", err),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.osc.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.osc.beat_targets.len(), 1);
        assert!(config.capture.record_path.is_none());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = AppConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.osc.bind_addr, config.osc.bind_addr);
        assert_eq!(parsed.osc.beat_targets, config.osc.beat_targets);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let parsed: AppConfig = serde_yaml::from_str("osc:\n  bind_addr: \"0.0.0.0:7770\"\n").unwrap();
        assert_eq!(parsed.osc.bind_addr, "0.0.0.0:7770");
        // Unspecified fields keep their defaults.
        assert_eq!(parsed.osc.beat_targets, vec!["127.0.0.1:9001".to_string()]);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = AppConfig::load_from_file("/nonexistent/pulsebeat.yaml");
        assert_eq!(config.osc.bind_addr, AppConfig::default().osc.bind_addr);
    }

    #[test]
    fn test_resolve_targets_rejects_garbage() {
        let mut config = AppConfig::default();
        config.osc.beat_targets.push("not-an-address".to_string());
        assert!(config.resolve_targets().is_err());
    }

    #[test]
    fn test_resolve_targets_parses_defaults() {
        let config = AppConfig::default();
        let targets = config.resolve_targets().unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].port(), 9001);
    }
}
