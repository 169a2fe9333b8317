//! Declarative encoder configuration
//!
//! Every option left unset falls back to the `ModelDefaults` passed to the
//! constructor; per-variant defaults live in the `Default` impls below.

use serde::{Deserialize, Serialize};

use crate::model::pyramidal::DownsamplingMethod;
use crate::model::segmenting::LambdaSchedule;
use crate::{ModelDefaults, NmtError, Result};

/// Encoder configuration, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EncoderConfig {
    Identity,
    Lstm(LstmEncoderConfig),
    ResidualLstm(ResidualLstmEncoderConfig),
    PyramidalLstm(PyramidalLstmEncoderConfig),
    ConvBiRnn(ConvBiRnnEncoderConfig),
    Modular(ModularEncoderConfig),
    Segmenting(SegmentingEncoderConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LstmEncoderConfig {
    pub input_dim: Option<usize>,
    pub layers: usize,
    pub hidden_dim: Option<usize>,
    pub dropout: Option<f64>,
    pub bidirectional: bool,
}

impl Default for LstmEncoderConfig {
    fn default() -> Self {
        LstmEncoderConfig {
            input_dim: None,
            layers: 1,
            hidden_dim: None,
            dropout: None,
            bidirectional: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidualLstmEncoderConfig {
    pub input_dim: usize,
    pub layers: usize,
    pub hidden_dim: Option<usize>,
    /// Add the skip connection around the last layer as well
    pub residual_to_output: bool,
    pub dropout: Option<f64>,
    pub bidirectional: bool,
}

impl Default for ResidualLstmEncoderConfig {
    fn default() -> Self {
        ResidualLstmEncoderConfig {
            input_dim: 512,
            layers: 1,
            hidden_dim: None,
            residual_to_output: false,
            dropout: None,
            bidirectional: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidalLstmEncoderConfig {
    pub input_dim: usize,
    pub layers: usize,
    pub hidden_dim: Option<usize>,
    pub downsampling_method: DownsamplingMethod,
    pub reduce_factor: usize,
    pub dropout: Option<f64>,
}

impl Default for PyramidalLstmEncoderConfig {
    fn default() -> Self {
        PyramidalLstmEncoderConfig {
            input_dim: 512,
            layers: 1,
            hidden_dim: None,
            downsampling_method: DownsamplingMethod::Skip,
            reduce_factor: 2,
            dropout: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvBiRnnEncoderConfig {
    pub input_dim: Option<usize>,
    pub layers: usize,
    pub hidden_dim: Option<usize>,
    /// Channels per input frame; `input_dim / chn_dim` is the frequency width
    pub chn_dim: usize,
    pub num_filters: usize,
    pub filter_size_time: usize,
    pub filter_size_freq: usize,
    /// (time, frequency)
    pub stride: [usize; 2],
    pub dropout: Option<f64>,
}

impl Default for ConvBiRnnEncoderConfig {
    fn default() -> Self {
        ConvBiRnnEncoderConfig {
            input_dim: None,
            layers: 1,
            hidden_dim: None,
            chn_dim: 3,
            num_filters: 32,
            filter_size_time: 3,
            filter_size_freq: 3,
            stride: [2, 2],
            dropout: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModularEncoderConfig {
    #[serde(default)]
    pub input_dim: Option<usize>,
    pub modules: Vec<EncoderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentingEncoderConfig {
    /// Input width; needed only when the embedding chain does not declare one
    #[serde(default)]
    pub input_dim: Option<usize>,
    /// Encoders run over the input before segmentation
    #[serde(default)]
    pub embed_encoder: Vec<EncoderConfig>,
    /// Output width of the embedding chain
    #[serde(default)]
    pub embed_dim: Option<usize>,
    /// Width of each segment representation
    #[serde(default)]
    pub segment_dim: Option<usize>,
    #[serde(default)]
    pub dropout: Option<f64>,
    #[serde(default)]
    pub lambda: LambdaSchedule,
}

impl EncoderConfig {
    /// Input width this configuration declares, if it declares one
    pub fn declared_input_dim(&self, defaults: &ModelDefaults) -> Option<usize> {
        match self {
            EncoderConfig::Identity => None,
            EncoderConfig::Lstm(c) => Some(c.input_dim.unwrap_or(defaults.default_layer_dim)),
            EncoderConfig::ResidualLstm(c) => Some(c.input_dim),
            EncoderConfig::PyramidalLstm(c) => Some(c.input_dim),
            EncoderConfig::ConvBiRnn(c) => Some(c.input_dim.unwrap_or(defaults.default_layer_dim)),
            EncoderConfig::Modular(c) => c
                .input_dim
                .or_else(|| c.modules.first().and_then(|m| m.declared_input_dim(defaults))),
            EncoderConfig::Segmenting(c) => c
                .input_dim
                .or_else(|| c.embed_encoder.first().and_then(|m| m.declared_input_dim(defaults))),
        }
    }

    /// Check the shared-parameter groups declared by composite encoders
    ///
    /// A modular encoder's `input_dim` must equal its first child's.
    pub fn validate_shared_params(&self, defaults: &ModelDefaults) -> Result<()> {
        match self {
            EncoderConfig::Modular(c) => {
                if let (Some(own), Some(first)) = (
                    c.input_dim,
                    c.modules.first().and_then(|m| m.declared_input_dim(defaults)),
                ) {
                    if own != first {
                        return Err(NmtError::Config(format!(
                            "Modular encoder input_dim {} differs from modules.0.input_dim {}",
                            own, first
                        )));
                    }
                }
                c.modules
                    .iter()
                    .try_for_each(|m| m.validate_shared_params(defaults))
            }
            EncoderConfig::Segmenting(c) => {
                if let (Some(own), Some(first)) = (
                    c.input_dim,
                    c.embed_encoder.first().and_then(|m| m.declared_input_dim(defaults)),
                ) {
                    if own != first {
                        return Err(NmtError::Config(format!(
                            "Segmenting encoder input_dim {} differs from embed_encoder.0.input_dim {}",
                            own, first
                        )));
                    }
                }
                c.embed_encoder
                    .iter()
                    .try_for_each(|m| m.validate_shared_params(defaults))
            }
            _ => Ok(()),
        }
    }
}
