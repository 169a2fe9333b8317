//! Stacked (optionally bidirectional) LSTM builder

use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig};
use burn::tensor::backend::Backend;

use crate::expression::ExpressionSequence;
use crate::model::transducer::{check_nonzero, recurrent_stack, RecurrentLayer, TransductionBuilder};
use crate::Result;

/// Multi-layer LSTM over a sequence
///
/// Shape contract: [batch, L, input_dim] -> [batch, L, hidden_dim].
/// Dropout is applied to the input of every layer.
#[derive(Module, Debug)]
pub struct LstmBuilder<B: Backend> {
    layers: Vec<RecurrentLayer<B>>,
    dropout: Dropout,
    hidden_dim: usize,
}

impl<B: Backend> LstmBuilder<B> {
    pub fn new(
        device: &B::Device,
        layers: usize,
        input_dim: usize,
        hidden_dim: usize,
        bidirectional: bool,
    ) -> Result<Self> {
        check_nonzero("LstmBuilder", "layers", layers)?;
        check_nonzero("LstmBuilder", "input_dim", input_dim)?;
        check_nonzero("LstmBuilder", "hidden_dim", hidden_dim)?;

        Ok(LstmBuilder {
            layers: recurrent_stack(device, layers, input_dim, hidden_dim, hidden_dim, bidirectional)?,
            dropout: DropoutConfig::new(0.0).init(),
            hidden_dim,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

impl<B: Backend> TransductionBuilder<B> for LstmBuilder<B> {
    fn transduce(&self, input: ExpressionSequence<B>) -> ExpressionSequence<B> {
        if input.is_empty() {
            return ExpressionSequence::empty(input.batch_size(), self.hidden_dim, &input.device());
        }
        let mut x = input.into_tensor();
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
