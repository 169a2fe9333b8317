//! Transduction contracts shared by every encoder and builder
//!
//! Two layers of abstraction:
//! - `TransductionBuilder`: owns the parameters of one concrete recurrent or
//!   convolutional computation and exposes its dropout knob
//! - `Transducer`: the public encoder contract (transduce, train/eval switch,
//!   optional reinforcement loss)

use burn::module::Module;
use burn::nn::{BiLstm, BiLstmConfig, Lstm, LstmConfig};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::expression::ExpressionSequence;
use crate::{NmtError, Result};

/// A parameterized sequence computation wrapped by an encoder
pub trait TransductionBuilder<B: Backend> {
    /// Map an input sequence to an output sequence
    fn transduce(&self, input: ExpressionSequence<B>) -> ExpressionSequence<B>;

    /// Set the dropout rate applied inside the computation
    fn set_dropout(&mut self, rate: f64);

    /// Dropout rate currently in effect
    fn dropout(&self) -> f64;

    /// Per-step dimensionality of the output
    fn output_dim(&self) -> usize;
}

/// Encoder contract
pub trait Transducer<B: Backend> {
    /// Encode a sequence of vectors into another sequence of vectors
    fn transduce(&mut self, input: ExpressionSequence<B>) -> ExpressionSequence<B>;

    /// Switch between training and evaluation behaviour (dropout, sampling).
    ///
    /// Must be called before the first `transduce` of each phase.
    fn set_train(&mut self, train: bool);

    /// Extra loss term from a non-differentiable decision, if any
    fn calc_reinforce_loss(&self, _reward: Tensor<B, 1>) -> Option<Tensor<B, 1>> {
        None
    }
}

/// `set_train` for encoders backed by a single builder
///
/// Dropout is the configured rate while training and exactly zero otherwise.
pub fn apply_train_mode<B: Backend, T: TransductionBuilder<B>>(
    builder: &mut T,
    dropout: f64,
    train: bool,
) {
    builder.set_dropout(if train { dropout } else { 0.0 });
}

pub(crate) fn check_dropout(component: &'static str, rate: f64) -> Result<()> {
    if (0.0..=1.0).contains(&rate) {
        Ok(())
    } else {
        Err(NmtError::Config(format!(
            "{}: dropout must be within [0, 1], got {}",
            component, rate
        )))
    }
}

pub(crate) fn check_nonzero(component: &'static str, name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(NmtError::InvalidDimension {
            component,
            message: format!("{} must be positive", name),
        });
    }
    Ok(())
}

/// One LSTM layer, either forward-only or bidirectional
#[derive(Module, Debug)]
pub enum RecurrentLayer<B: Backend> {
    Forward(Lstm<B>),
    Bidirectional(BiLstm<B>),
}

impl<B: Backend> RecurrentLayer<B> {
    /// Create a layer producing `hidden_dim` features per step.
    ///
    /// A bidirectional layer gives each direction `hidden_dim / 2` units, so
    /// `hidden_dim` must be even.
    pub fn new(
        device: &B::Device,
        input_dim: usize,
        hidden_dim: usize,
        bidirectional: bool,
    ) -> Result<Self> {
        if bidirectional {
            if hidden_dim % 2 != 0 {
                return Err(NmtError::InvalidDimension {
                    component: "RecurrentLayer",
                    message: format!(
                        "bidirectional hidden_dim must be even, got {}",
                        hidden_dim
                    ),
                });
            }
            let lstm = BiLstmConfig::new(input_dim, hidden_dim / 2, true).init(device);
            Ok(RecurrentLayer::Bidirectional(lstm))
        } else {
            let lstm = LstmConfig::new(input_dim, hidden_dim, true).init(device);
            Ok(RecurrentLayer::Forward(lstm))
        }
    }

    /// Run the layer over [batch, seq_len, input_dim] -> [batch, seq_len, hidden_dim]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        match self {
            RecurrentLayer::Forward(lstm) => lstm.forward(x, None).0,
            RecurrentLayer::Bidirectional(lstm) => lstm.forward(x, None).0,
        }
    }
}

/// Build `layers` recurrent layers; the first reads `input_dim`, later ones read `layer_input_dim`
pub(crate) fn recurrent_stack<B: Backend>(
    device: &B::Device,
    layers: usize,
    input_dim: usize,
    layer_input_dim: usize,
    hidden_dim: usize,
    bidirectional: bool,
) -> Result<Vec<RecurrentLayer<B>>> {
    (0..layers)
        .map(|i| {
            let in_dim = if i == 0 { input_dim } else { layer_input_dim };
            RecurrentLayer::new(device, in_dim, hidden_dim, bidirectional)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    /// Builder that passes its input through and remembers its dropout
    struct StubBuilder {
        rate: f64,
        dim: usize,
    }

    impl<B: Backend> TransductionBuilder<B> for StubBuilder {
        fn transduce(&self, input: ExpressionSequence<B>) -> ExpressionSequence<B> {
            input
        }

        fn set_dropout(&mut self, rate: f64) {
            self.rate = rate;
        }

        fn dropout(&self) -> f64 {
            self.rate
        }

        fn output_dim(&self) -> usize {
            self.dim
        }
    }

    #[test]
    fn test_apply_train_mode_zeroes_dropout_in_eval() {
        let mut stub = StubBuilder { rate: 0.5, dim: 4 };

        apply_train_mode::<TestBackend, _>(&mut stub, 0.3, true);
        assert_eq!(TransductionBuilder::<TestBackend>::dropout(&stub), 0.3);

        apply_train_mode::<TestBackend, _>(&mut stub, 0.3, false);
        assert_eq!(TransductionBuilder::<TestBackend>::dropout(&stub), 0.0);
    }

    #[test]
    fn test_recurrent_layer_shapes() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 3>::random([2, 7, 6], Distribution::Normal(0.0, 1.0), &device);

        let forward = RecurrentLayer::<TestBackend>::new(&device, 6, 10, false).unwrap();
        assert_eq!(forward.forward(x.clone()).dims(), [2, 7, 10]);

        let bidir = RecurrentLayer::<TestBackend>::new(&device, 6, 10, true).unwrap();
        assert_eq!(bidir.forward(x).dims(), [2, 7, 10]);
    }

    #[test]
    fn test_bidirectional_layer_rejects_odd_hidden() {
        let device = Default::default();
        assert!(RecurrentLayer::<TestBackend>::new(&device, 6, 9, true).is_err());
    }

    #[test]
    fn test_check_dropout_bounds() {
        assert!(check_dropout("test", 0.0).is_ok());
        assert!(check_dropout("test", 1.0).is_ok());
        assert!(check_dropout("test", -0.1).is_err());
        assert!(check_dropout("test", 1.5).is_err());
    }
}
