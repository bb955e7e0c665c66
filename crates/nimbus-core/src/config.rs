//! Configuration system for nimbus.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $NIMBUS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/nimbus/config.toml
//!   3. ~/.config/nimbus/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Hash-signature width the whole fleet must agree on. Refs carry this
/// many hash bits and worker routing derives from them, so a process
/// whose config disagrees refuses to start rather than corrupt routing.
pub const HASH_BITS: u32 = 32;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NimbusConfig {
    pub controller: ControllerConfig,
    pub fleet: FleetConfig,
    pub bdd: BddConfig,
    pub conjunct: ConjunctConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Host agents dial to reach the controller.
    pub host: String,
    /// Controller listening port.
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Routers the controller waits for before admitting workers.
    pub routers: u16,
    /// Fixed worker count, known at controller start.
    pub workers: u16,
    /// Client admission cap.
    pub max_clients: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BddConfig {
    /// Must equal [`HASH_BITS`]; pinned here so hosts built with a
    /// different signature width fail fast at startup.
    pub hash_bits: u32,
}

/// Tuning knobs for the conjunction engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConjunctConfig {
    /// Candidate pairs tried per combining step.
    pub abort_limit: usize,
    /// Passes over the candidates before the unbounded fallback.
    pub pass_limit: usize,
    /// Size-limit growth between passes.
    pub expansion_factor: f64,
    /// Support-coverage floor for attempting a soft AND.
    pub soft_and_threshold: f64,
    /// Largest similarity discount applied to big arguments.
    pub max_large_argument_penalty: f64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: crate::wire::CONTROLLER_PORT,
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            routers: 1,
            workers: 1,
            max_clients: 1024,
        }
    }
}

impl Default for BddConfig {
    fn default() -> Self {
        Self {
            hash_bits: HASH_BITS,
        }
    }
}

impl Default for ConjunctConfig {
    fn default() -> Self {
        Self {
            abort_limit: 7,
            pass_limit: 3,
            expansion_factor: 1.42,
            soft_and_threshold: 0.80,
            max_large_argument_penalty: 0.40,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("hash_bits {0} does not match this build's width {HASH_BITS}")]
    HashWidthMismatch(u32),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl NimbusConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            NimbusConfig::default()
        };
        config.apply_env_overrides();
        if config.bdd.hash_bits != HASH_BITS {
            return Err(ConfigError::HashWidthMismatch(config.bdd.hash_bits));
        }
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("NIMBUS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply NIMBUS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NIMBUS_CONTROLLER__HOST") {
            self.controller.host = v;
        }
        if let Ok(v) = std::env::var("NIMBUS_CONTROLLER__PORT") {
            if let Ok(p) = v.parse() {
                self.controller.port = p;
            }
        }
        if let Ok(v) = std::env::var("NIMBUS_FLEET__WORKERS") {
            if let Ok(n) = v.parse() {
                self.fleet.workers = n;
            }
        }
        if let Ok(v) = std::env::var("NIMBUS_FLEET__ROUTERS") {
            if let Ok(n) = v.parse() {
                self.fleet.routers = n;
            }
        }
        if let Ok(v) = std::env::var("NIMBUS_CONJUNCT__ABORT_LIMIT") {
            if let Ok(n) = v.parse() {
                self.conjunct.abort_limit = n;
            }
        }
        if let Ok(v) = std::env::var("NIMBUS_CONJUNCT__PASS_LIMIT") {
            if let Ok(n) = v.parse() {
                self.conjunct.pass_limit = n;
            }
        }
        if let Ok(v) = std::env::var("NIMBUS_CONJUNCT__EXPANSION_FACTOR") {
            if let Ok(n) = v.parse() {
                self.conjunct.expansion_factor = n;
            }
        }
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("nimbus")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_knobs() {
        let config = NimbusConfig::default();
        assert_eq!(config.conjunct.abort_limit, 7);
        assert_eq!(config.conjunct.pass_limit, 3);
        assert!((config.conjunct.expansion_factor - 1.42).abs() < 1e-9);
        assert!((config.conjunct.soft_and_threshold - 0.80).abs() < 1e-9);
        assert_eq!(config.bdd.hash_bits, HASH_BITS);
    }

    #[test]
    fn toml_round_trip() {
        let config = NimbusConfig::default();
        let text = toml::to_string(&config).unwrap();
        let back: NimbusConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.fleet.workers, config.fleet.workers);
        assert_eq!(back.controller.port, config.controller.port);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let back: NimbusConfig = toml::from_str("[fleet]\nworkers = 4\n").unwrap();
        assert_eq!(back.fleet.workers, 4);
        assert_eq!(back.fleet.routers, 1);
        assert_eq!(back.conjunct.abort_limit, 7);
    }
}
