//! LSTM stack with residual connections between layers

use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig};
use burn::tensor::backend::Backend;

use crate::expression::ExpressionSequence;
use crate::model::transducer::{check_nonzero, recurrent_stack, RecurrentLayer, TransductionBuilder};
use crate::Result;

/// Residual LSTM stack
///
/// The first layer maps `input_dim -> hidden_dim`. Every later layer adds its
/// input to its output, except the last one when `residual_to_output` is unset.
/// Shape contract: [batch, L, input_dim] -> [batch, L, hidden_dim].
#[derive(Module, Debug)]
pub struct ResidualLstmBuilder<B: Backend> {
    layers: Vec<RecurrentLayer<B>>,
    dropout: Dropout,
    hidden_dim: usize,
    residual_to_output: bool,
}

impl<B: Backend> ResidualLstmBuilder<B> {
    pub fn new(
        device: &B::Device,
        layers: usize,
        input_dim: usize,
        hidden_dim: usize,
        bidirectional: bool,
        residual_to_output: bool,
    ) -> Result<Self> {
        check_nonzero("ResidualLstmBuilder", "layers", layers)?;
        check_nonzero("ResidualLstmBuilder", "input_dim", input_dim)?;
        check_nonzero("ResidualLstmBuilder", "hidden_dim", hidden_dim)?;

        Ok(ResidualLstmBuilder {
            layers: recurrent_stack(device, layers, input_dim, hidden_dim, hidden_dim, bidirectional)?,
            dropout: DropoutConfig::new(0.0).init(),
            hidden_dim,
            residual_to_output,
        })
    }
}

impl<B: Backend> TransductionBuilder<B> for ResidualLstmBuilder<B> {
    fn transduce(&self, input: ExpressionSequence<B>) -> ExpressionSequence<B> {
        if input.is_empty() {
            return ExpressionSequence::empty(input.batch_size(), self.hidden_dim, &input.device());
        }
        let last = self.layers.len() - 1;
        let mut x = input.into_tensor();

        for (i, layer) in self.layers.iter().enumerate() {
            let out = layer.forward(self.dropout.forward(x.clone()));
            // Layer 0 changes width, so it never gets a skip connection
            let add_residual = i > 0 && (i < last || self.residual_to_output);
            x = if add_residual { out + x } else { out };
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
