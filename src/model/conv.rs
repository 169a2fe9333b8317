//! Convolution over (time, frequency) followed by a bidirectional LSTM stack
//!
//! Meant for spectrogram-like input where each frame holds `chn_dim` channels
//! of `input_dim / chn_dim` frequency bins.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Dropout, DropoutConfig};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::expression::ExpressionSequence;
use crate::model::transducer::{check_nonzero, recurrent_stack, RecurrentLayer, TransductionBuilder};
use crate::{NmtError, Result};

/// Output length of a zero-padded convolution along one axis
pub fn conv_out_len(len: usize, kernel: usize, padding: usize, stride: usize) -> usize {
    let padded = len + 2 * padding;
    if padded < kernel {
        0
    } else {
        (padded - kernel) / stride + 1
    }
}

/// Hyperparameters of the convolutional front end
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvShape {
    pub chn_dim: usize,
    pub num_filters: usize,
    pub filter_size_time: usize,
    pub filter_size_freq: usize,
    pub stride: [usize; 2],
}

/// Two strided convolutions then a BiLSTM stack
///
/// Shape contract: [batch, L, input_dim] -> [batch, L'', hidden_dim] with
/// L' = conv_out_len(L) and L'' = conv_out_len(L'), padding `(k - 1) / 2` on
/// each side of each axis.
#[derive(Module, Debug)]
pub struct ConvBiRnnBuilder<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    layers: Vec<RecurrentLayer<B>>,
    dropout: Dropout,
    chn_dim: usize,
    freq_dim: usize,
    pad_time: usize,
    pad_freq: usize,
    filter_size_time: usize,
    stride_time: usize,
    hidden_dim: usize,
}

impl<B: Backend> ConvBiRnnBuilder<B> {
    pub fn new(
        device: &B::Device,
        layers: usize,
        input_dim: usize,
        hidden_dim: usize,
        shape: ConvShape,
    ) -> Result<Self> {
        check_nonzero("ConvBiRnnBuilder", "layers", layers)?;
        check_nonzero("ConvBiRnnBuilder", "chn_dim", shape.chn_dim)?;
        check_nonzero("ConvBiRnnBuilder", "num_filters", shape.num_filters)?;
        check_nonzero("ConvBiRnnBuilder", "filter_size_time", shape.filter_size_time)?;
        check_nonzero("ConvBiRnnBuilder", "filter_size_freq", shape.filter_size_freq)?;
        check_nonzero("ConvBiRnnBuilder", "stride", shape.stride[0].min(shape.stride[1]))?;

        if input_dim == 0 || input_dim % shape.chn_dim != 0 {
            return Err(NmtError::InvalidDimension {
                component: "ConvBiRnnBuilder",
                message: format!(
                    "input_dim {} is not a positive multiple of chn_dim {}",
                    input_dim, shape.chn_dim
                ),
            });
        }

        let freq_dim = input_dim / shape.chn_dim;
        let pad_time = (shape.filter_size_time - 1) / 2;
        let pad_freq = (shape.filter_size_freq - 1) / 2;

        // Frequency bins left after both convolutions
        let freq_out = (0..2).fold(freq_dim, |f, _| {
            conv_out_len(f, shape.filter_size_freq, pad_freq, shape.stride[1])
        });
        if freq_out == 0 {
            return Err(NmtError::InvalidDimension {
                component: "ConvBiRnnBuilder",
                message: format!(
                    "{} frequency bins are too few for filter width {}",
                    freq_dim, shape.filter_size_freq
                ),
            });
        }

        let kernel = [shape.filter_size_time, shape.filter_size_freq];
        let conv1 = Conv2dConfig::new([shape.chn_dim, shape.num_filters], kernel)
            .with_stride(shape.stride)
            .init(device);
        let conv2 = Conv2dConfig::new([shape.num_filters, shape.num_filters], kernel)
            .with_stride(shape.stride)
            .init(device);

        let rnn_input_dim = shape.num_filters * freq_out;

        Ok(ConvBiRnnBuilder {
            conv1,
            conv2,
            layers: recurrent_stack(device, layers, rnn_input_dim, hidden_dim, hidden_dim, true)?,
            dropout: DropoutConfig::new(0.0).init(),
            chn_dim: shape.chn_dim,
            freq_dim,
            pad_time,
            pad_freq,
            filter_size_time: shape.filter_size_time,
            stride_time: shape.stride[0],
            hidden_dim,
        })
    }

    /// Output length for an input of `len` frames
    pub fn output_len(&self, len: usize) -> usize {
        (0..2).fold(len, |l, _| {
            conv_out_len(l, self.filter_size_time, self.pad_time, self.stride_time)
        })
    }

    /// Zero-pad the time and frequency axes of [batch, chn, time, freq]
    fn pad(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let device = x.device();
        let x = if self.pad_time > 0 {
            let [batch, chn, _, freq] = x.dims();
            let zeros = Tensor::<B, 4>::zeros([batch, chn, self.pad_time, freq], &device);
            Tensor::cat(vec![zeros.clone(), x, zeros], 2)
        } else {
            x
        };

        if self.pad_freq > 0 {
            let [batch, chn, time, _] = x.dims();
            let zeros = Tensor::<B, 4>::zeros([batch, chn, time, self.pad_freq], &device);
            Tensor::cat(vec![zeros.clone(), x, zeros], 3)
        } else {
            x
        }
    }
}

impl<B: Backend> TransductionBuilder<B> for ConvBiRnnBuilder<B> {
    fn transduce(&self, input: ExpressionSequence<B>) -> ExpressionSequence<B> {
        let [batch, len, _] = input.as_tensor().dims();
        // Too short for the filters: nothing survives the convolutions
        if self.output_len(len) == 0 {
            return ExpressionSequence::empty(batch, self.hidden_dim, &input.device());
        }

        // [batch, L, chn * freq] -> [batch, chn, L, freq]
        let x = input
            .into_tensor()
            .reshape([batch, len, self.chn_dim, self.freq_dim])
            .swap_dims(1, 2);

        let x = relu(self.conv1.forward(self.pad(x)));
        let x = relu(self.conv2.forward(self.pad(x)));

        // [batch, filters, L'', freq''] -> [batch, L'', filters * freq'']
        let [batch, filters, time, freq] = x.dims();
        let mut x = x.swap_dims(1, 2).reshape([batch, time, filters * freq]);

        for layer in &self.layers {
            x = layer.forward(self.dropout.forward(x));
        }

        ExpressionSequence::from_tensor(x)
    }

    fn set_dropout(&mut self, rate: f64) {
        self.dropout.prob = rate;
    }

    fn dropout(&self) -> f64 {
        self.dropout.prob
    }

    fn output_dim(&self) -> usize {
        self.hidden_dim
    }
}
