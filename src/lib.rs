//! Sequence encoders and training progress tracking for neural machine translation
//!
//! Two cooperating pieces:
//! - `model`: encoders that transduce a sequence of vectors into another sequence
//!   (recurrent, residual, pyramidal, convolutional, modular and learned segmentation)
//! - `training`: loss bookkeeping, dev scores and the per-regimen loss tracker

pub mod expression;
pub mod model;
pub mod training;
pub mod vocab;

pub use expression::ExpressionSequence;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::model::config::EncoderConfig;

/// Identity of a training regimen
///
/// Loss trackers are keyed to exactly one regimen and ignore epoch events
/// fired for any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegimenId(pub u64);

impl fmt::Display for RegimenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Regimen({})", self.0)
    }
}

/// Application-wide errors
#[derive(Debug, Error)]
pub enum NmtError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid dimension for {component}: {message}")]
    InvalidDimension {
        component: &'static str,
        message: String,
    },

    #[error("No dev score set - call set_dev_score before reporting dev results")]
    MissingDevScore,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, NmtError>;

/// Model-wide defaults used when an encoder option is left unset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelDefaults {
    /// Fallback for every unset input/hidden dimension
    pub default_layer_dim: usize,
    /// Fallback dropout rate
    pub dropout: f64,
}

impl Default for ModelDefaults {
    fn default() -> Self {
        ModelDefaults {
            default_layer_dim: 512,
            dropout: 0.0,
        }
    }
}

/// Model configuration loaded from a TOML file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub defaults: ModelDefaults,
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Sentences between dev evaluations (0 = once per epoch)
    #[serde(default)]
    pub eval_every: usize,
    /// Optional prefix for every report line
    pub name: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            defaults: ModelDefaults::default(),
            encoder: EncoderConfig::Lstm(Default::default()),
            tracker: TrackerConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            NmtError::Config(format!("Failed to read config file {}: {}", path, e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.encoder.validate_shared_params(&config.defaults)?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| NmtError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::{LstmEncoderConfig, ModularEncoderConfig};

    #[test]
    fn test_config_from_toml() {
        let content = r#"
            [defaults]
            default_layer_dim = 64
            dropout = 0.3

            [encoder]
            type = "Modular"
            input_dim = 32

            [[encoder.modules]]
            type = "Lstm"
            input_dim = 32
            layers = 2

            [[encoder.modules]]
            type = "Identity"

            [tracker]
            eval_every = 500
            name = "mt"
        "#;

        let config = Config::from_toml(content).unwrap();
        assert_eq!(config.defaults.default_layer_dim, 64);
        assert_eq!(config.tracker.eval_every, 500);
        assert_eq!(config.tracker.name.as_deref(), Some("mt"));
        match config.encoder {
            EncoderConfig::Modular(ModularEncoderConfig { input_dim, modules }) => {
                assert_eq!(input_dim, Some(32));
                assert_eq!(modules.len(), 2);
            }
            other => panic!("expected modular config, got {:?}", other),
        }
    }

    #[test]
    fn test_config_rejects_inconsistent_shared_params() {
        let content = r#"
            [encoder]
            type = "Modular"
            input_dim = 32

            [[encoder.modules]]
            type = "Lstm"
            input_dim = 16
        "#;

        assert!(matches!(
            Config::from_toml(content),
            Err(NmtError::Config(_))
        ));
    }

    #[test]
    fn test_default_config_roundtrips_through_toml() {
        let config = Config {
            encoder: EncoderConfig::Lstm(LstmEncoderConfig {
                layers: 2,
                ..Default::default()
            }),
            ..Config::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = Config::from_toml(&text).unwrap();
        assert!(matches!(
            parsed.encoder,
            EncoderConfig::Lstm(LstmEncoderConfig { layers: 2, .. })
        ));
    }

    #[test]
    fn test_regimen_id_display() {
        assert_eq!(RegimenId(7).to_string(), "Regimen(7)");
    }
}
