//! Pyramidal bidirectional LSTM that shortens the time axis between layers
//!
//! Used to compress long acoustic or character sequences before attention.

use burn::module::{Ignored, Module};
use burn::nn::{Dropout, DropoutConfig};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::expression::ExpressionSequence;
use crate::model::transducer::{check_nonzero, recurrent_stack, RecurrentLayer, TransductionBuilder};
use crate::Result;

/// How adjacent frames are merged when the time axis is shortened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownsamplingMethod {
    /// Keep every `reduce_factor`-th frame
    #[default]
    Skip,
    /// Concatenate `reduce_factor` adjacent frames (zero-padded at the end)
    Concat,
}

/// Shorten [batch, L, dim] to [batch, ceil(L / factor), dim'] along time.
///
/// `dim'` is `dim` for `Skip` and `dim * factor` for `Concat`.
pub fn downsample<B: Backend>(
    x: Tensor<B, 3>,
    factor: usize,
    method: DownsamplingMethod,
) -> Tensor<B, 3> {
    let [batch, len, dim] = x.dims();
    let out_len = len.div_ceil(factor);
    let device = x.device();

    match method {
        DownsamplingMethod::Skip => {
            let positions: Vec<i64> = (0..out_len).map(|i| (i * factor) as i64).collect();
            let indices =
                Tensor::<B, 1, Int>::from_data(TensorData::new(positions, [out_len]), &device);
            x.select(1, indices)
        }
        DownsamplingMethod::Concat => {
            let padded_len = out_len * factor;
            let x = if padded_len > len {
                let pad = Tensor::zeros([batch, padded_len - len, dim], &device);
                Tensor::cat(vec![x, pad], 1)
            } else {
                x
            };
            // Row-major layout keeps adjacent frames contiguous
            x.reshape([batch, out_len, dim * factor])
        }
    }
}

/// Bidirectional LSTM pyramid
///
/// Shape contract: [batch, L, input_dim] -> [batch, L', hidden_dim] where L' is
/// L shortened by `ceil(. / reduce_factor)` once between each pair of layers.
#[derive(Module, Debug)]
pub struct PyramidalLstmBuilder<B: Backend> {
    layers: Vec<RecurrentLayer<B>>,
    dropout: Dropout,
    hidden_dim: usize,
    reduce_factor: usize,
    method: Ignored<DownsamplingMethod>,
}

impl<B: Backend> PyramidalLstmBuilder<B> {
    pub fn new(
        device: &B::Device,
        layers: usize,
        input_dim: usize,
        hidden_dim: usize,
        method: DownsamplingMethod,
        reduce_factor: usize,
    ) -> Result<Self> {
        check_nonzero("PyramidalLstmBuilder", "layers", layers)?;
        check_nonzero("PyramidalLstmBuilder", "input_dim", input_dim)?;
        check_nonzero("PyramidalLstmBuilder", "reduce_factor", reduce_factor)?;

        let layer_input_dim = match method {
            DownsamplingMethod::Skip => hidden_dim,
            DownsamplingMethod::Concat => hidden_dim * reduce_factor,
        };

        Ok(PyramidalLstmBuilder {
            layers: recurrent_stack(device, layers, input_dim, layer_input_dim, hidden_dim, true)?,
            dropout: DropoutConfig::new(0.0).init(),
            hidden_dim,
            reduce_factor,
            method: Ignored(method),
        })
    }

    /// Output length for an input of `len` steps
    pub fn output_len(&self, len: usize) -> usize {
        (1..self.layers.len()).fold(len, |l, _| l.div_ceil(self.reduce_factor))
    }
}

impl<B: Backend> TransductionBuilder<B> for PyramidalLstmBuilder<B> {
    fn transduce(&self, input: ExpressionSequence<B>) -> ExpressionSequence<B> {
        if input.is_empty() {
            return ExpressionSequence::empty(input.batch_size(), self.hidden_dim, &input.device());
        }
        let last = self.layers.len() - 1;
        let mut x = input.into_tensor();

        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(self.dropout.forward(x));
            if i < last {
                x = downsample(x, self.reduce_factor, self.method.0);
            }
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
