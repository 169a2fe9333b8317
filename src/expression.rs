//! Ordered sequences of vector-valued expressions
//!
//! Encoders consume and produce `ExpressionSequence`s. A sequence is stored as
//! one stacked tensor so builders can hand it straight to burn's recurrent and
//! convolutional modules.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::{NmtError, Result};

/// A batch of sequences of vectors, stacked as [batch, seq_len, dim]
#[derive(Debug, Clone)]
pub struct ExpressionSequence<B: Backend> {
    tensor: Tensor<B, 3>,
}

impl<B: Backend> ExpressionSequence<B> {
    /// Wrap an already stacked tensor [batch, seq_len, dim]
    pub fn from_tensor(tensor: Tensor<B, 3>) -> Self {
        ExpressionSequence { tensor }
    }

    /// A batch of zero-length sequences of width `dim`
    pub fn empty(batch: usize, dim: usize, device: &B::Device) -> Self {
        ExpressionSequence {
            tensor: Tensor::zeros([batch, 0, dim], device),
        }
    }

    /// Stack per-step expressions, each [batch, dim], along the time axis
    pub fn from_steps(steps: Vec<Tensor<B, 2>>) -> Result<Self> {
        let first = steps.first().ok_or_else(|| NmtError::InvalidDimension {
            component: "ExpressionSequence",
            message: "cannot build a sequence from zero steps".to_string(),
        })?;
        let expected = first.dims();

        if let Some((pos, step)) = steps
            .iter()
            .enumerate()
            .find(|(_, step)| step.dims() != expected)
        {
            return Err(NmtError::InvalidDimension {
                component: "ExpressionSequence",
                message: format!(
                    "step {} has shape {:?}, expected {:?}",
                    pos,
                    step.dims(),
                    expected
                ),
            });
        }

        Ok(ExpressionSequence {
            tensor: Tensor::stack(steps, 1),
        })
    }

    /// Number of time steps
    pub fn len(&self) -> usize {
        self.tensor.dims()[1]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-step vector dimensionality
    pub fn dim(&self) -> usize {
        self.tensor.dims()[2]
    }

    pub fn batch_size(&self) -> usize {
        self.tensor.dims()[0]
    }

    /// Expression at time step `index` as [batch, dim]
    pub fn get(&self, index: usize) -> Option<Tensor<B, 2>> {
        if index >= self.len() {
            return None;
        }
        let [batch, _, dim] = self.tensor.dims();
        Some(
            self.tensor
                .clone()
                .slice([0..batch, index..index + 1, 0..dim])
                .reshape([batch, dim]),
        )
    }

    /// All steps in order, each [batch, dim]
    pub fn steps(&self) -> Vec<Tensor<B, 2>> {
        (0..self.len()).filter_map(|i| self.get(i)).collect()
    }

    pub fn as_tensor(&self) -> &Tensor<B, 3> {
        &self.tensor
    }

    pub fn into_tensor(self) -> Tensor<B, 3> {
        self.tensor
    }

    pub fn device(&self) -> B::Device {
        self.tensor.device()
    }
}

impl<B: Backend> From<Tensor<B, 3>> for ExpressionSequence<B> {
    fn from(tensor: Tensor<B, 3>) -> Self {
        ExpressionSequence::from_tensor(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_from_steps_stacks_along_time() {
        let device = Default::default();
        let steps: Vec<Tensor<TestBackend, 2>> = (0..5)
            .map(|_| Tensor::random([2, 8], Distribution::Normal(0.0, 1.0), &device))
            .collect();

        let seq = ExpressionSequence::from_steps(steps.clone()).unwrap();

        assert_eq!(seq.len(), 5);
        assert_eq!(seq.dim(), 8);
        assert_eq!(seq.batch_size(), 2);

        let third: Vec<f32> = seq.get(2).unwrap().into_data().iter::<f32>().collect();
        let expected: Vec<f32> = steps[2].clone().into_data().iter::<f32>().collect();
        assert_eq!(third.len(), expected.len());
        for (a, b) in third.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_from_steps_rejects_empty_and_ragged() {
        let device = Default::default();
        assert!(ExpressionSequence::<TestBackend>::from_steps(vec![]).is_err());

        let ragged = vec![
            Tensor::<TestBackend, 2>::zeros([2, 8], &device),
            Tensor::<TestBackend, 2>::zeros([2, 4], &device),
        ];
        assert!(ExpressionSequence::from_steps(ragged).is_err());
    }

    #[test]
    fn test_get_out_of_range() {
        let device = Default::default();
        let seq = ExpressionSequence::from_tensor(Tensor::<TestBackend, 3>::zeros([1, 3, 4], &device));
        assert!(seq.get(3).is_none());
        assert_eq!(seq.steps().len(), 3);
    }
}
