//! Named loss components
//!
//! A batch loss is often the sum of several terms (e.g. likelihood plus a
//! REINFORCE term). `LossValues` keeps them apart by name, in first-seen order.

use std::fmt;
use std::ops::AddAssign;

use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};

/// Loss values keyed by component name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossValues {
    components: Vec<(String, f64)>,
}

impl LossValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// A loss with one component
    pub fn single(name: impl Into<String>, value: f64) -> Self {
        let mut loss = Self::new();
        loss.add(name, value);
        loss
    }

    /// Read a scalar loss tensor (shape [1]) into a single component
    pub fn from_tensor<B: Backend>(name: impl Into<String>, tensor: Tensor<B, 1>) -> Self {
        let value: f64 = tensor.into_scalar().elem();
        Self::single(name, value)
    }

    /// Builder-style `add`
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.add(name, value);
        self
    }

    /// Accumulate `value` into component `name`
    pub fn add(&mut self, name: impl Into<String>, value: f64) {
        let name = name.into();
        match self.components.iter_mut().find(|(n, _)| *n == name) {
            Some((_, total)) => *total += value,
            None => self.components.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.components
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    /// Sum over all components
    pub fn sum(&self) -> f64 {
        self.components.iter().map(|(_, v)| v).sum()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.components.iter().map(|(n, v)| (n.as_str(), *v))
    }
}

impl AddAssign<&LossValues> for LossValues {
    fn add_assign(&mut self, other: &LossValues) {
        for (name, value) in other.iter() {
            self.add(name, value);
        }
    }
}

impl fmt::Display for LossValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .iter()
            .map(|(name, value)| format!("{}: {:.4}", name, value))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}
