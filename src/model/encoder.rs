//! Encoder variants
//!
//! `Encoder` is a closed set of variants behind the `Transducer` contract.
//! Builder-backed leaves delegate the computation to a `TransductionBuilder`
//! and only own the train/eval dropout switch.
//!
//! The tree is layered so that no encoder type contains itself: a modular
//! chain holds leaves and segmenting encoders, and a segmenting encoder's
//! embedding chain holds leaves only.

use std::collections::HashSet;

use burn::module::Module;
use burn::record::{FullPrecisionSettings, Recorder};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::expression::ExpressionSequence;
use crate::model::config::{
    ConvBiRnnEncoderConfig, EncoderConfig, LstmEncoderConfig, ModularEncoderConfig,
    PyramidalLstmEncoderConfig, ResidualLstmEncoderConfig,
};
use crate::model::conv::{ConvBiRnnBuilder, ConvShape};
use crate::model::lstm::LstmBuilder;
use crate::model::pyramidal::PyramidalLstmBuilder;
use crate::model::residual::ResidualLstmBuilder;
use crate::model::segmenting::SegmentingEncoder;
use crate::model::transducer::{apply_train_mode, check_dropout, TransductionBuilder, Transducer};
use crate::{ModelDefaults, NmtError, Result};

/// Pass-through encoder
#[derive(Module, Clone, Debug, Default)]
pub struct IdentityEncoder {}

impl<B: Backend> Transducer<B> for IdentityEncoder {
    fn transduce(&mut self, input: ExpressionSequence<B>) -> ExpressionSequence<B> {
        input
    }

    fn set_train(&mut self, _train: bool) {}
}

/// Multi-layer LSTM encoder
#[derive(Module, Debug)]
pub struct LstmEncoder<B: Backend> {
    builder: LstmBuilder<B>,
    dropout: f64,
}

impl<B: Backend> LstmEncoder<B> {
    pub fn new(device: &B::Device, config: &LstmEncoderConfig, defaults: &ModelDefaults) -> Result<Self> {
        let input_dim = config.input_dim.unwrap_or(defaults.default_layer_dim);
        let hidden_dim = config.hidden_dim.unwrap_or(defaults.default_layer_dim);
        let dropout = config.dropout.unwrap_or(defaults.dropout);
        check_dropout("LstmEncoder", dropout)?;

        Ok(LstmEncoder {
            builder: LstmBuilder::new(device, config.layers, input_dim, hidden_dim, config.bidirectional)?,
            dropout,
        })
    }

    pub fn builder(&self) -> &LstmBuilder<B> {
        &self.builder
    }
}

impl<B: Backend> Transducer<B> for LstmEncoder<B> {
    fn transduce(&mut self, input: ExpressionSequence<B>) -> ExpressionSequence<B> {
        self.builder.transduce(input)
    }

    fn set_train(&mut self, train: bool) {
        apply_train_mode(&mut self.builder, self.dropout, train);
    }
}

/// LSTM encoder with residual connections between layers
#[derive(Module, Debug)]
pub struct ResidualLstmEncoder<B: Backend> {
    builder: ResidualLstmBuilder<B>,
    dropout: f64,
}

impl<B: Backend> ResidualLstmEncoder<B> {
    pub fn new(
        device: &B::Device,
        config: &ResidualLstmEncoderConfig,
        defaults: &ModelDefaults,
    ) -> Result<Self> {
        let hidden_dim = config.hidden_dim.unwrap_or(defaults.default_layer_dim);
        let dropout = config.dropout.unwrap_or(defaults.dropout);
        check_dropout("ResidualLstmEncoder", dropout)?;

        Ok(ResidualLstmEncoder {
            builder: ResidualLstmBuilder::new(
                device,
                config.layers,
                config.input_dim,
                hidden_dim,
                config.bidirectional,
                config.residual_to_output,
            )?,
            dropout,
        })
    }

    pub fn builder(&self) -> &ResidualLstmBuilder<B> {
        &self.builder
    }
}

impl<B: Backend> Transducer<B> for ResidualLstmEncoder<B> {
    fn transduce(&mut self, input: ExpressionSequence<B>) -> ExpressionSequence<B> {
        self.builder.transduce(input)
    }

    fn set_train(&mut self, train: bool) {
        apply_train_mode(&mut self.builder, self.dropout, train);
    }
}

/// Bidirectional LSTM pyramid shortening the sequence between layers
#[derive(Module, Debug)]
pub struct PyramidalLstmEncoder<B: Backend> {
    builder: PyramidalLstmBuilder<B>,
    dropout: f64,
}

impl<B: Backend> PyramidalLstmEncoder<B> {
    pub fn new(
        device: &B::Device,
        config: &PyramidalLstmEncoderConfig,
        defaults: &ModelDefaults,
    ) -> Result<Self> {
        let hidden_dim = config.hidden_dim.unwrap_or(defaults.default_layer_dim);
        let dropout = config.dropout.unwrap_or(defaults.dropout);
        check_dropout("PyramidalLstmEncoder", dropout)?;

        Ok(PyramidalLstmEncoder {
            builder: PyramidalLstmBuilder::new(
                device,
                config.layers,
                config.input_dim,
                hidden_dim,
                config.downsampling_method,
                config.reduce_factor,
            )?,
            dropout,
        })
    }

    pub fn builder(&self) -> &PyramidalLstmBuilder<B> {
        &self.builder
    }
}

impl<B: Backend> Transducer<B> for PyramidalLstmEncoder<B> {
    fn transduce(&mut self, input: ExpressionSequence<B>) -> ExpressionSequence<B> {
        self.builder.transduce(input)
    }

    fn set_train(&mut self, train: bool) {
        apply_train_mode(&mut self.builder, self.dropout, train);
    }
}

/// Convolution over (time, frequency) followed by a BiLSTM stack
#[derive(Module, Debug)]
pub struct ConvBiRnnEncoder<B: Backend> {
    builder: ConvBiRnnBuilder<B>,
    dropout: f64,
}

impl<B: Backend> ConvBiRnnEncoder<B> {
    pub fn new(
        device: &B::Device,
        config: &ConvBiRnnEncoderConfig,
        defaults: &ModelDefaults,
    ) -> Result<Self> {
        let input_dim = config.input_dim.unwrap_or(defaults.default_layer_dim);
        let hidden_dim = config.hidden_dim.unwrap_or(defaults.default_layer_dim);
        let dropout = config.dropout.unwrap_or(defaults.dropout);
        check_dropout("ConvBiRnnEncoder", dropout)?;

        let shape = ConvShape {
            chn_dim: config.chn_dim,
            num_filters: config.num_filters,
            filter_size_time: config.filter_size_time,
            filter_size_freq: config.filter_size_freq,
            stride: config.stride,
        };

        Ok(ConvBiRnnEncoder {
            builder: ConvBiRnnBuilder::new(device, config.layers, input_dim, hidden_dim, shape)?,
            dropout,
        })
    }

    pub fn builder(&self) -> &ConvBiRnnBuilder<B> {
        &self.builder
    }
}

impl<B: Backend> Transducer<B> for ConvBiRnnEncoder<B> {
    fn transduce(&mut self, input: ExpressionSequence<B>) -> ExpressionSequence<B> {
        self.builder.transduce(input)
    }

    fn set_train(&mut self, train: bool) {
        apply_train_mode(&mut self.builder, self.dropout, train);
    }
}

/// Encoder without nested encoders
#[derive(Module, Debug)]
pub enum LeafEncoder<B: Backend> {
    Identity(IdentityEncoder),
    Lstm(LstmEncoder<B>),
    ResidualLstm(ResidualLstmEncoder<B>),
    PyramidalLstm(PyramidalLstmEncoder<B>),
    ConvBiRnn(ConvBiRnnEncoder<B>),
}

impl<B: Backend> LeafEncoder<B> {
    /// Build a leaf encoder; composite configurations are rejected
    pub fn new(device: &B::Device, config: &EncoderConfig, defaults: &ModelDefaults) -> Result<Self> {
        let leaf = match config {
            EncoderConfig::Identity => LeafEncoder::Identity(IdentityEncoder::default()),
            EncoderConfig::Lstm(c) => LeafEncoder::Lstm(LstmEncoder::new(device, c, defaults)?),
            EncoderConfig::ResidualLstm(c) => {
                LeafEncoder::ResidualLstm(ResidualLstmEncoder::new(device, c, defaults)?)
            }
            EncoderConfig::PyramidalLstm(c) => {
                LeafEncoder::PyramidalLstm(PyramidalLstmEncoder::new(device, c, defaults)?)
            }
            EncoderConfig::ConvBiRnn(c) => {
                LeafEncoder::ConvBiRnn(ConvBiRnnEncoder::new(device, c, defaults)?)
            }
            EncoderConfig::Modular(_) | EncoderConfig::Segmenting(_) => {
                return Err(NmtError::Config(
                    "composite encoders cannot be built as a leaf encoder".to_string(),
                ))
            }
        };
        Ok(leaf)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LeafEncoder::Identity(_) => "Identity",
            LeafEncoder::Lstm(_) => "Lstm",
            LeafEncoder::ResidualLstm(_) => "ResidualLstm",
            LeafEncoder::PyramidalLstm(_) => "PyramidalLstm",
            LeafEncoder::ConvBiRnn(_) => "ConvBiRnn",
        }
    }

    /// Output width, or `None` when the output is as wide as the input
    pub fn output_dim(&self) -> Option<usize> {
        match self {
            LeafEncoder::Identity(_) => None,
            LeafEncoder::Lstm(e) => Some(e.builder().output_dim()),
            LeafEncoder::ResidualLstm(e) => Some(e.builder().output_dim()),
            LeafEncoder::PyramidalLstm(e) => Some(e.builder().output_dim()),
            LeafEncoder::ConvBiRnn(e) => Some(e.builder().output_dim()),
        }
    }

    pub fn dropout_rates(&self) -> Vec<f64> {
        match self {
            LeafEncoder::Identity(_) => Vec::new(),
            LeafEncoder::Lstm(e) => vec![e.builder().dropout()],
            LeafEncoder::ResidualLstm(e) => vec![e.builder().dropout()],
            LeafEncoder::PyramidalLstm(e) => vec![e.builder().dropout()],
            LeafEncoder::ConvBiRnn(e) => vec![e.builder().dropout()],
        }
    }
}

impl<B: Backend> Transducer<B> for LeafEncoder<B> {
    fn transduce(&mut self, input: ExpressionSequence<B>) -> ExpressionSequence<B> {
        match self {
            LeafEncoder::Identity(e) => Transducer::<B>::transduce(e, input),
            LeafEncoder::Lstm(e) => e.transduce(input),
            LeafEncoder::ResidualLstm(e) => e.transduce(input),
            LeafEncoder::PyramidalLstm(e) => e.transduce(input),
            LeafEncoder::ConvBiRnn(e) => e.transduce(input),
        }
    }

    fn set_train(&mut self, train: bool) {
        match self {
            LeafEncoder::Identity(e) => Transducer::<B>::set_train(e, train),
            LeafEncoder::Lstm(e) => e.set_train(train),
            LeafEncoder::ResidualLstm(e) => e.set_train(train),
            LeafEncoder::PyramidalLstm(e) => e.set_train(train),
            LeafEncoder::ConvBiRnn(e) => e.set_train(train),
        }
    }
}

/// Build leaves for `configs`, inlining nested modular chains
fn leaf_encoders<B: Backend>(
    device: &B::Device,
    configs: &[EncoderConfig],
    defaults: &ModelDefaults,
) -> Result<Vec<LeafEncoder<B>>> {
    let mut leaves = Vec::with_capacity(configs.len());
    for config in configs {
        match config {
            EncoderConfig::Modular(c) => leaves.extend(leaf_encoders(device, &c.modules, defaults)?),
            EncoderConfig::Segmenting(_) => {
                return Err(NmtError::Config(
                    "a segmenting encoder cannot be nested inside another segmenting encoder"
                        .to_string(),
                ))
            }
            leaf => leaves.push(LeafEncoder::new(device, leaf, defaults)?),
        }
    }
    Ok(leaves)
}

/// Chain of leaf encoders applied in order
///
/// Embedding stage of a segmenting encoder.
#[derive(Module, Debug)]
pub struct EncoderChain<B: Backend> {
    modules: Vec<LeafEncoder<B>>,
}

impl<B: Backend> EncoderChain<B> {
    pub fn new(device: &B::Device, configs: &[EncoderConfig], defaults: &ModelDefaults) -> Result<Self> {
        Ok(EncoderChain {
            modules: leaf_encoders(device, configs, defaults)?,
        })
    }

    pub fn from_leaves(modules: Vec<LeafEncoder<B>>) -> Self {
        EncoderChain { modules }
    }

    pub fn modules(&self) -> &[LeafEncoder<B>] {
        &self.modules
    }

    /// Width of the chain output for inputs of width `input_dim`
    pub fn output_dim(&self, input_dim: usize) -> usize {
        self.modules
            .iter()
            .fold(input_dim, |dim, m| m.output_dim().unwrap_or(dim))
    }

    pub fn dropout_rates(&self) -> Vec<f64> {
        self.modules.iter().flat_map(|m| m.dropout_rates()).collect()
    }
}

impl<B: Backend> Transducer<B> for EncoderChain<B> {
    fn transduce(&mut self, input: ExpressionSequence<B>) -> ExpressionSequence<B> {
        self.modules
            .iter_mut()
            .fold(input, |seq, module| module.transduce(seq))
    }

    fn set_train(&mut self, train: bool) {
        for module in &mut self.modules {
            module.set_train(train);
        }
    }
}

/// One stage of a modular chain
#[derive(Module, Debug)]
pub enum ChainStage<B: Backend> {
    Leaf(LeafEncoder<B>),
    Segmenting(SegmentingEncoder<B>),
}

impl<B: Backend> ChainStage<B> {
    pub fn new_epoch(&mut self) {
        if let ChainStage::Segmenting(s) = self {
            s.new_epoch();
        }
    }

    pub fn dropout_rates(&self) -> Vec<f64> {
        match self {
            ChainStage::Leaf(e) => e.dropout_rates(),
            ChainStage::Segmenting(s) => s.dropout_rates(),
        }
    }
}

impl<B: Backend> Transducer<B> for ChainStage<B> {
    fn transduce(&mut self, input: ExpressionSequence<B>) -> ExpressionSequence<B> {
        match self {
            ChainStage::Leaf(e) => e.transduce(input),
            ChainStage::Segmenting(s) => s.transduce(input),
        }
    }

    fn set_train(&mut self, train: bool) {
        match self {
            ChainStage::Leaf(e) => e.set_train(train),
            ChainStage::Segmenting(s) => s.set_train(train),
        }
    }

    fn calc_reinforce_loss(&self, reward: Tensor<B, 1>) -> Option<Tensor<B, 1>> {
        match self {
            ChainStage::Leaf(_) => None,
            ChainStage::Segmenting(s) => s.calc_reinforce_loss(reward),
        }
    }
}

/// Build chain stages for `configs`, inlining nested modular chains
fn chain_stages<B: Backend>(
    device: &B::Device,
    configs: &[EncoderConfig],
    defaults: &ModelDefaults,
) -> Result<Vec<ChainStage<B>>> {
    let mut stages = Vec::with_capacity(configs.len());
    for config in configs {
        match config {
            EncoderConfig::Modular(c) => stages.extend(chain_stages(device, &c.modules, defaults)?),
            EncoderConfig::Segmenting(c) => {
                stages.push(ChainStage::Segmenting(SegmentingEncoder::new(device, c, defaults)?))
            }
            leaf => stages.push(ChainStage::Leaf(LeafEncoder::new(device, leaf, defaults)?)),
        }
    }
    Ok(stages)
}

/// Chain of encoders applied in order
///
/// Nested modular configurations are inlined, so the chain is flat.
#[derive(Module, Debug)]
pub struct ModularEncoder<B: Backend> {
    modules: Vec<ChainStage<B>>,
}

impl<B: Backend> ModularEncoder<B> {
    pub fn new(device: &B::Device, config: &ModularEncoderConfig, defaults: &ModelDefaults) -> Result<Self> {
        Self::from_configs(device, &config.modules, defaults)
    }

    pub fn from_configs(
        device: &B::Device,
        configs: &[EncoderConfig],
        defaults: &ModelDefaults,
    ) -> Result<Self> {
        Ok(ModularEncoder {
            modules: chain_stages(device, configs, defaults)?,
        })
    }

    pub fn from_modules(modules: Vec<ChainStage<B>>) -> Self {
        ModularEncoder { modules }
    }

    /// Option groups that must agree across this encoder and its children
    pub fn shared_params() -> Vec<HashSet<&'static str>> {
        vec![HashSet::from(["input_dim", "modules.0.input_dim"])]
    }

    pub fn modules(&self) -> &[ChainStage<B>] {
        &self.modules
    }

    pub fn new_epoch(&mut self) {
        for module in &mut self.modules {
            module.new_epoch();
        }
    }

    pub fn dropout_rates(&self) -> Vec<f64> {
        self.modules.iter().flat_map(|m| m.dropout_rates()).collect()
    }
}

impl<B: Backend> Transducer<B> for ModularEncoder<B> {
    fn transduce(&mut self, input: ExpressionSequence<B>) -> ExpressionSequence<B> {
        self.modules
            .iter_mut()
            .fold(input, |seq, module| module.transduce(seq))
    }

    fn set_train(&mut self, train: bool) {
        for module in &mut self.modules {
            module.set_train(train);
        }
    }

    /// Sum of the reinforcement losses of every child that has one
    fn calc_reinforce_loss(&self, reward: Tensor<B, 1>) -> Option<Tensor<B, 1>> {
        self.modules
            .iter()
            .filter_map(|m| m.calc_reinforce_loss(reward.clone()))
            .reduce(|acc, loss| acc + loss)
    }
}

/// Any encoder the configuration can describe
#[derive(Module, Debug)]
pub enum Encoder<B: Backend> {
    Leaf(LeafEncoder<B>),
    Modular(ModularEncoder<B>),
    Segmenting(SegmentingEncoder<B>),
}

impl<B: Backend> Encoder<B> {
    /// Build an encoder and allocate its parameters on `device`
    pub fn new(device: &B::Device, config: &EncoderConfig, defaults: &ModelDefaults) -> Result<Self> {
        let encoder = match config {
            EncoderConfig::Modular(c) => Encoder::Modular(ModularEncoder::new(device, c, defaults)?),
            EncoderConfig::Segmenting(c) => {
                Encoder::Segmenting(SegmentingEncoder::new(device, c, defaults)?)
            }
            leaf => Encoder::Leaf(LeafEncoder::new(device, leaf, defaults)?),
        };
        log::debug!("Built {} encoder", encoder.kind());
        Ok(encoder)
    }

    /// Variant name, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Encoder::Leaf(e) => e.kind(),
            Encoder::Modular(_) => "Modular",
            Encoder::Segmenting(_) => "Segmenting",
        }
    }

    /// Forward the epoch boundary to every segmenting encoder in the tree
    pub fn new_epoch(&mut self) {
        match self {
            Encoder::Leaf(_) => {}
            Encoder::Modular(m) => m.new_epoch(),
            Encoder::Segmenting(s) => s.new_epoch(),
        }
    }

    /// Dropout rates currently in effect for every builder in the tree
    pub fn dropout_rates(&self) -> Vec<f64> {
        match self {
            Encoder::Leaf(e) => e.dropout_rates(),
            Encoder::Modular(m) => m.dropout_rates(),
            Encoder::Segmenting(s) => s.dropout_rates(),
        }
    }

    /// Save parameters to `path` (the recorder appends `.mpk`)
    pub fn save(&self, path: &str) -> Result<()>
    where
        B::FloatElem: serde::Serialize + serde::de::DeserializeOwned,
        B::IntElem: serde::Serialize + serde::de::DeserializeOwned,
    {
        let recorder = burn::record::NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        recorder
            .record(self.clone().into_record(), path.into())
            .map_err(|e| NmtError::Io(std::io::Error::other(e.to_string())))
    }

    /// Rebuild the encoder described by `config` and load saved parameters into it
    pub fn load(
        device: &B::Device,
        path: &str,
        config: &EncoderConfig,
        defaults: &ModelDefaults,
    ) -> Result<Self>
    where
        B::FloatElem: serde::Serialize + serde::de::DeserializeOwned,
        B::IntElem: serde::Serialize + serde::de::DeserializeOwned,
    {
        let recorder = burn::record::NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let record = recorder
            .load(path.into(), device)
            .map_err(|e| NmtError::Io(std::io::Error::other(e.to_string())))?;

        let encoder = Self::new(device, config, defaults)?;
        Ok(encoder.load_record(record))
    }
}

impl<B: Backend> Transducer<B> for Encoder<B> {
    fn transduce(&mut self, input: ExpressionSequence<B>) -> ExpressionSequence<B> {
        match self {
            Encoder::Leaf(e) => e.transduce(input),
            Encoder::Modular(e) => e.transduce(input),
            Encoder::Segmenting(e) => e.transduce(input),
        }
    }

    fn set_train(&mut self, train: bool) {
        match self {
            Encoder::Leaf(e) => e.set_train(train),
            Encoder::Modular(e) => e.set_train(train),
            Encoder::Segmenting(e) => e.set_train(train),
        }
    }

    fn calc_reinforce_loss(&self, reward: Tensor<B, 1>) -> Option<Tensor<B, 1>> {
        match self {
            Encoder::Leaf(_) => None,
            Encoder::Modular(e) => e.calc_reinforce_loss(reward),
            Encoder::Segmenting(e) => e.calc_reinforce_loss(reward),
        }
    }
}
