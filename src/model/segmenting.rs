//! Learned discrete segmentation trained with REINFORCE
//!
//! An embedding encoder chain produces one vector per input step. A linear
//! policy decides at every step whether a segment ends there; the steps of
//! each segment are summarized by a forward LSTM (the segment transducer) and
//! the final state of every segment becomes one output step.
//!
//! The boundary decisions are not differentiable, so the policy is trained
//! with a REINFORCE term scaled by an annealed coefficient `lambda`.

use burn::module::{
    AutodiffModule, ConstantRecord, Content, Devices, Ignored, Module, ModuleDisplay,
    ModuleDisplayDefault, ModuleMapper, ModuleVisitor,
};
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Distribution, Int, Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::expression::ExpressionSequence;
use crate::model::config::SegmentingEncoderConfig;
use crate::model::encoder::EncoderChain;
use crate::model::lstm::LstmBuilder;
use crate::model::transducer::{apply_train_mode, check_dropout, TransductionBuilder, Transducer};
use crate::{ModelDefaults, NmtError, Result};

/// Annealing schedule for the REINFORCE coefficient
///
/// After `n` epochs the coefficient is `clamp(1e-3 * (2^n - 10), min, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LambdaSchedule {
    /// Value before the first epoch; the schedule value for epoch 0 when unset
    #[serde(default)]
    pub start: Option<f64>,
    pub min: f64,
    pub max: f64,
}

impl Default for LambdaSchedule {
    fn default() -> Self {
        LambdaSchedule {
            start: None,
            min: 0.0,
            max: 1.0,
        }
    }
}

impl LambdaSchedule {
    pub fn validate(&self) -> Result<()> {
        if self.min > self.max {
            return Err(NmtError::Config(format!(
                "lambda schedule has min {} above max {}",
                self.min, self.max
            )));
        }
        Ok(())
    }

    /// Coefficient after `epoch` calls to `new_epoch`
    pub fn value_at(&self, epoch: usize) -> f64 {
        let raw = 1e-3 * (2f64.powf(epoch as f64) - 10.0);
        raw.min(self.max).max(self.min)
    }

    /// Coefficient before any epoch has completed
    pub fn initial(&self) -> f64 {
        match self.start {
            Some(start) => start.min(self.max).max(self.min),
            None => self.value_at(0),
        }
    }
}

/// Policy outcome recorded by the most recent `transduce`
#[derive(Debug, Clone)]
pub struct SegmentSample<B: Backend> {
    /// Sum over sampled decisions of log pi(a_t), per batch element [batch]
    pub log_prob: Tensor<B, 1>,
    /// Number of segments produced for each batch element
    pub segment_counts: Vec<usize>,
}

/// Holder for the last policy sample inside the module tree
///
/// Per-batch state, not a parameter: it is never recorded, and it is dropped
/// when the module is moved to another device or to the inner backend.
#[derive(Debug, Clone)]
pub struct SampleSlot<B: Backend>(Option<SegmentSample<B>>);

impl<B: Backend> Default for SampleSlot<B> {
    fn default() -> Self {
        SampleSlot(None)
    }
}

impl<B: Backend> SampleSlot<B> {
    pub fn get(&self) -> Option<&SegmentSample<B>> {
        self.0.as_ref()
    }

    fn set(&mut self, sample: SegmentSample<B>) {
        self.0 = Some(sample);
    }
}

impl<B: Backend> Module<B> for SampleSlot<B> {
    type Record = ConstantRecord;

    fn visit<V: ModuleVisitor<B>>(&self, _visitor: &mut V) {}

    fn map<M: ModuleMapper<B>>(self, _mapper: &mut M) -> Self {
        self
    }

    fn load_record(self, _record: Self::Record) -> Self {
        self
    }

    fn into_record(self) -> Self::Record {
        ConstantRecord::new()
    }

    fn to_device(self, _device: &B::Device) -> Self {
        Self::default()
    }

    fn fork(self, _device: &B::Device) -> Self {
        Self::default()
    }

    fn collect_devices(&self, devices: Devices<B>) -> Devices<B> {
        devices
    }
}

impl<B: Backend> ModuleDisplayDefault for SampleSlot<B> {
    fn content(&self, content: Content) -> Option<Content> {
        let state = if self.0.is_some() { "sampled" } else { "empty" };
        content.add_single(&state.to_string()).optional()
    }
}

impl<B: Backend> ModuleDisplay for SampleSlot<B> {}

impl<B: AutodiffBackend> AutodiffModule<B> for SampleSlot<B> {
    type InnerModule = SampleSlot<B::InnerBackend>;

    fn valid(&self) -> Self::InnerModule {
        SampleSlot::default()
    }
}

/// Split `len` steps into segments ending wherever `boundaries` is set
///
/// The last step always closes a segment.
pub fn segment_spans(boundaries: &[bool]) -> Vec<std::ops::Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    for (t, &boundary) in boundaries.iter().enumerate() {
        if boundary || t + 1 == boundaries.len() {
            spans.push(start..t + 1);
            start = t + 1;
        }
    }
    spans
}

/// Parameters and sampling state of the segmenting computation
#[derive(Module, Debug)]
pub struct SegmentingBuilder<B: Backend> {
    embed_encoder: EncoderChain<B>,
    policy: Linear<B>,
    segment_transducer: LstmBuilder<B>,
    dropout: f64,
    train: bool,
    last_sample: SampleSlot<B>,
}

impl<B: Backend> SegmentingBuilder<B> {
    pub fn new(
        embed_encoder: EncoderChain<B>,
        policy: Linear<B>,
        segment_transducer: LstmBuilder<B>,
        dropout: f64,
    ) -> Self {
        SegmentingBuilder {
            embed_encoder,
            policy,
            segment_transducer,
            dropout,
            train: false,
            last_sample: SampleSlot::default(),
        }
    }

    /// Sample (training) or pick greedily (evaluation) one boundary flag per step
    ///
    /// # Arguments
    /// * `log_probs` - Policy log-probabilities [batch, len, 2], class 1 = boundary
    ///
    /// # Returns
    /// Row-major flags of length batch * len with the last step of every row set
    fn decide_boundaries(&self, log_probs: &Tensor<B, 3>) -> Vec<bool> {
        let [batch, len, _] = log_probs.dims();
        let boundary_prob = log_probs.clone().slice([0..batch, 0..len, 1..2]).exp();

        let decided = if self.train {
            let draw = Tensor::<B, 3>::random(
                [batch, len, 1],
                Distribution::Uniform(0.0, 1.0),
                &boundary_prob.device(),
            );
            draw.lower(boundary_prob)
        } else {
            boundary_prob.greater_elem(0.5)
        };

        let mut flags: Vec<bool> = decided
            .float()
            .into_data()
            .iter::<f32>()
            .map(|v| v > 0.5)
            .collect();
        for b in 0..batch {
            flags[b * len + len - 1] = true;
        }
        flags
    }

    pub fn transduce(&mut self, input: ExpressionSequence<B>) -> ExpressionSequence<B> {
        let encodings = self.embed_encoder.transduce(input).into_tensor();
        let [batch, len, hidden] = encodings.dims();
        let device = encodings.device();
        let out_dim = self.segment_transducer.output_dim();

        if len == 0 {
            self.last_sample.set(SegmentSample {
                log_prob: Tensor::zeros([batch], &device),
                segment_counts: vec![0; batch],
            });
            return ExpressionSequence::empty(batch, out_dim, &device);
        }

        let log_probs = log_softmax(self.policy.forward(encodings.clone()), 2);
        let flags = self.decide_boundaries(&log_probs);

        // Log-likelihood of the sampled actions; the forced final boundary is not a choice
        let actions: Vec<i64> = flags.iter().map(|&f| f as i64).collect();
        let actions =
            Tensor::<B, 3, Int>::from_data(TensorData::new(actions, [batch, len, 1]), &device);
        let chosen = log_probs.gather(2, actions).reshape([batch, len]);
        let log_prob = if len > 1 {
            chosen.slice([0..batch, 0..len - 1]).sum_dim(1).reshape([batch])
        } else {
            Tensor::zeros([batch], &device)
        };

        let mut rows = Vec::with_capacity(batch);
        let mut segment_counts = Vec::with_capacity(batch);

        for b in 0..batch {
            let spans = segment_spans(&flags[b * len..(b + 1) * len]);
            let reps: Vec<Tensor<B, 3>> = spans
                .iter()
                .map(|span| {
                    let steps = encodings
                        .clone()
                        .slice([b..b + 1, span.start..span.end, 0..hidden]);
                    let summary = self
                        .segment_transducer
                        .transduce(ExpressionSequence::from_tensor(steps))
                        .into_tensor();
                    let seg_len = span.end - span.start;
                    summary.slice([0..1, seg_len - 1..seg_len, 0..out_dim])
                })
                .collect();
            segment_counts.push(reps.len());
            rows.push(Tensor::cat(reps, 1));
        }

        let max_segments = segment_counts.iter().copied().max().unwrap_or(0);
        let rows: Vec<Tensor<B, 3>> = rows
            .into_iter()
            .zip(segment_counts.iter())
            .map(|(row, &count)| {
                if count < max_segments {
                    let pad = Tensor::zeros([1, max_segments - count, out_dim], &device);
                    Tensor::cat(vec![row, pad], 1)
                } else {
                    row
                }
            })
            .collect();

        log::debug!("Segmented batch into {:?} segments", segment_counts);
        self.last_sample.set(SegmentSample {
            log_prob,
            segment_counts,
        });

        ExpressionSequence::from_tensor(Tensor::cat(rows, 0))
    }

    pub fn set_train(&mut self, train: bool) {
        self.train = train;
        self.embed_encoder.set_train(train);
        apply_train_mode(&mut self.segment_transducer, self.dropout, train);
    }

    /// REINFORCE loss `lambda * mean_b(-reward_b * log pi(actions_b))`
    ///
    /// Returns `None` until `transduce` has recorded a sample.
    pub fn calc_reinforce_loss(&self, reward: Tensor<B, 1>, lambda: f64) -> Option<Tensor<B, 1>> {
        let sample = self.last_sample.get()?;
        let loss = (reward.detach() * sample.log_prob.clone())
            .neg()
            .mean()
            .mul_scalar(lambda);
        Some(loss)
    }

    pub fn last_sample(&self) -> Option<&SegmentSample<B>> {
        self.last_sample.get()
    }

    pub fn embed_encoder(&self) -> &EncoderChain<B> {
        &self.embed_encoder
    }

    pub fn segment_transducer(&self) -> &LstmBuilder<B> {
        &self.segment_transducer
    }
}

/// Encoder producing one output step per learned segment
#[derive(Module, Debug)]
pub struct SegmentingEncoder<B: Backend> {
    builder: SegmentingBuilder<B>,
    ctr: usize,
    lambda_val: f64,
    schedule: Ignored<LambdaSchedule>,
}

impl<B: Backend> SegmentingEncoder<B> {
    pub fn new(
        device: &B::Device,
        config: &SegmentingEncoderConfig,
        defaults: &ModelDefaults,
    ) -> Result<Self> {
        config.lambda.validate()?;
        let dropout = config.dropout.unwrap_or(defaults.dropout);
        check_dropout("SegmentingEncoder", dropout)?;

        let embed_encoder = EncoderChain::new(device, &config.embed_encoder, defaults)?;

        // The policy and the segment LSTM read the embedding chain's output
        let input_dim = config
            .input_dim
            .or_else(|| config.embed_encoder.first().and_then(|m| m.declared_input_dim(defaults)))
            .unwrap_or(defaults.default_layer_dim);
        let chain_dim = embed_encoder.output_dim(input_dim);
        let embed_dim = config.embed_dim.unwrap_or(chain_dim);
        if embed_dim != chain_dim {
            return Err(NmtError::InvalidDimension {
                component: "SegmentingEncoder",
                message: format!(
                    "embed_dim {} differs from the embed_encoder output width {}",
                    embed_dim, chain_dim
                ),
            });
        }
        let segment_dim = config.segment_dim.unwrap_or(defaults.default_layer_dim);

        let policy = LinearConfig::new(embed_dim, 2).init(device);
        let segment_transducer = LstmBuilder::new(device, 1, embed_dim, segment_dim, false)?;

        Ok(SegmentingEncoder {
            builder: SegmentingBuilder::new(embed_encoder, policy, segment_transducer, dropout),
            ctr: 0,
            lambda_val: config.lambda.initial(),
            schedule: Ignored(config.lambda),
        })
    }

    /// Advance the epoch counter and re-anneal lambda
    ///
    /// Called once per epoch by the training loop.
    pub fn new_epoch(&mut self) {
        self.ctr += 1;
        self.lambda_val = self.schedule.0.value_at(self.ctr);
        log::info!("Now lambda: {}", self.lambda_val);
    }

    pub fn lambda(&self) -> f64 {
        self.lambda_val
    }

    pub fn epochs_seen(&self) -> usize {
        self.ctr
    }

    pub fn builder(&self) -> &SegmentingBuilder<B> {
        &self.builder
    }

    /// Dropout rates of every owned builder
    pub fn dropout_rates(&self) -> Vec<f64> {
        let mut rates = self.builder.embed_encoder().dropout_rates();
        rates.push(self.builder.segment_transducer().dropout());
        rates
    }
}

impl<B: Backend> Transducer<B> for SegmentingEncoder<B> {
    fn transduce(&mut self, input: ExpressionSequence<B>) -> ExpressionSequence<B> {
        self.builder.transduce(input)
    }

    fn set_train(&mut self, train: bool) {
        self.builder.set_train(train);
    }

    fn calc_reinforce_loss(&self, reward: Tensor<B, 1>) -> Option<Tensor<B, 1>> {
        self.builder.calc_reinforce_loss(reward, self.lambda_val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::{EncoderConfig, LstmEncoderConfig};
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn config() -> SegmentingEncoderConfig {
        SegmentingEncoderConfig {
            input_dim: None,
            embed_encoder: vec![EncoderConfig::Lstm(LstmEncoderConfig {
                input_dim: Some(6),
                hidden_dim: Some(8),
                dropout: Some(0.2),
                ..Default::default()
            })],
            embed_dim: Some(8),
            segment_dim: Some(5),
            dropout: Some(0.1),
            lambda: LambdaSchedule {
                start: None,
                min: 0.0,
                max: 0.5,
            },
        }
    }

    #[test]
    fn test_segment_spans() {
        assert_eq!(segment_spans(&[false, true, false, false]), vec![0..2, 2..4]);
        assert_eq!(segment_spans(&[true, true, true]), vec![0..1, 1..2, 2..3]);
        assert_eq!(segment_spans(&[false, false, false]), vec![0..3]);
        assert!(segment_spans(&[]).is_empty());
    }

    #[test]
    fn test_lambda_schedule_matches_formula() {
        let schedule = LambdaSchedule {
            start: None,
            min: 0.0,
            max: 0.1,
        };
        for n in 0..20 {
            let expected = (1e-3 * (2f64.powi(n as i32) - 10.0)).clamp(0.0, 0.1);
            let value = schedule.value_at(n);
            assert!((value - expected).abs() < 1e-12, "epoch {}", n);
            assert!((schedule.min..=schedule.max).contains(&value));
        }
    }

    #[test]
    fn test_lambda_after_new_epoch_calls() {
        let device = Default::default();
        let mut encoder = SegmentingEncoder::<TestBackend>::new(&device, &config(), &Default::default()).unwrap();
        let schedule = config().lambda;

        assert_eq!(encoder.lambda(), schedule.value_at(0));
        for n in 1..15 {
            encoder.new_epoch();
            assert_eq!(encoder.epochs_seen(), n);
            assert_eq!(encoder.lambda(), schedule.value_at(n));
            assert!(encoder.lambda() >= 0.0 && encoder.lambda() <= 0.5);
        }
    }

    #[test]
    fn test_explicit_start_is_clamped() {
        let schedule = LambdaSchedule {
            start: Some(2.0),
            min: 0.0,
            max: 0.5,
        };
        assert_eq!(schedule.initial(), 0.5);
        assert!(LambdaSchedule { start: None, min: 1.0, max: 0.0 }.validate().is_err());
    }

    #[test]
    fn test_segmenting_transduce_shape_and_loss() {
        let device = Default::default();
        let mut encoder = SegmentingEncoder::<TestBackend>::new(&device, &config(), &Default::default()).unwrap();
        let reward = Tensor::<TestBackend, 1>::from_floats([1.0, -1.0, 0.5], &device);

        assert!(encoder.calc_reinforce_loss(reward.clone()).is_none());

        encoder.set_train(true);
        let input = ExpressionSequence::from_tensor(Tensor::random(
            [3, 7, 6],
            Distribution::Normal(0.0, 1.0),
            &device,
        ));
        let out = encoder.transduce(input);

        let counts = encoder.builder().last_sample().unwrap().segment_counts.clone();
        assert_eq!(counts.len(), 3);
        assert!(counts.iter().all(|&c| (1..=7).contains(&c)));
        assert_eq!(
            out.as_tensor().dims(),
            [3, *counts.iter().max().unwrap(), 5]
        );

        let loss = encoder.calc_reinforce_loss(reward).unwrap();
        assert_eq!(loss.dims(), [1]);
    }

    #[test]
    fn test_set_train_reaches_nested_builders() {
        let device = Default::default();
        let mut encoder = SegmentingEncoder::<TestBackend>::new(&device, &config(), &Default::default()).unwrap();

        encoder.set_train(true);
        assert_eq!(encoder.dropout_rates(), vec![0.2, 0.1]);

        encoder.set_train(false);
        assert!(encoder.dropout_rates().iter().all(|&r| r == 0.0));
    }

    #[test]
    fn test_embed_dim_must_match_chain_output() {
        let device = Default::default();
        let defaults = ModelDefaults {
            default_layer_dim: 16,
            dropout: 0.0,
        };

        let mismatched = SegmentingEncoderConfig {
            embed_dim: Some(12),
            ..config()
        };
        assert!(matches!(
            SegmentingEncoder::<TestBackend>::new(&device, &mismatched, &defaults),
            Err(NmtError::InvalidDimension { .. })
        ));

        // An identity chain passes the declared input width through
        let identity = SegmentingEncoderConfig {
            input_dim: Some(6),
            embed_encoder: vec![EncoderConfig::Identity],
            embed_dim: Some(16),
            ..config()
        };
        assert!(SegmentingEncoder::<TestBackend>::new(&device, &identity, &defaults).is_err());

        let inferred = SegmentingEncoderConfig {
            input_dim: Some(6),
            embed_encoder: vec![EncoderConfig::Identity],
            embed_dim: None,
            ..config()
        };
        let mut encoder = SegmentingEncoder::<TestBackend>::new(&device, &inferred, &defaults).unwrap();
        let input = ExpressionSequence::from_tensor(Tensor::random(
            [2, 4, 6],
            Distribution::Normal(0.0, 1.0),
            &device,
        ));
        assert_eq!(encoder.transduce(input).dim(), 5);
    }

    #[test]
    fn test_zero_length_input_gives_empty_output() {
        let device = Default::default();
        let mut encoder = SegmentingEncoder::<TestBackend>::new(&device, &config(), &Default::default()).unwrap();
        encoder.set_train(true);

        let out = encoder.transduce(ExpressionSequence::empty(2, 6, &device));
        assert_eq!(out.as_tensor().dims(), [2, 0, 5]);
        assert_eq!(encoder.builder().last_sample().unwrap().segment_counts, vec![0, 0]);
    }

    #[test]
    fn test_sample_slot_is_not_recorded() {
        let device = Default::default();
        let mut encoder = SegmentingEncoder::<TestBackend>::new(&device, &config(), &Default::default()).unwrap();
        encoder.set_train(true);
        encoder.transduce(ExpressionSequence::from_tensor(Tensor::random(
            [1, 3, 6],
            Distribution::Normal(0.0, 1.0),
            &device,
        )));
        assert!(encoder.builder().last_sample().is_some());

        let moved = encoder.builder().clone().to_device(&device);
        assert!(moved.last_sample().is_none());
    }
}

