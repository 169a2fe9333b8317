//! Dev-set scores and their "better than" ordering
//!
//! Whether lower or higher is better depends on the metric, so each score type
//! carries its own comparison rule.

use std::fmt;

/// A dev evaluation result used for model selection
pub trait EvalScore: fmt::Display + Clone {
    /// Raw metric value
    fn value(&self) -> f64;

    /// Whether larger values are better for this metric
    fn higher_is_better(&self) -> bool;

    /// Strictly better than `best`; anything beats a missing best
    fn better_than(&self, best: Option<&Self>) -> bool {
        match best {
            None => true,
            Some(best) if self.higher_is_better() => self.value() > best.value(),
            Some(best) => self.value() < best.value(),
        }
    }
}

/// Dev loss (lower is better)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossScore(pub f64);

impl EvalScore for LossScore {
    fn value(&self) -> f64 {
        self.0
    }

    fn higher_is_better(&self) -> bool {
        false
    }
}

impl fmt::Display for LossScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Loss: {:.3}", self.0)
    }
}

/// Corpus BLEU (higher is better)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BleuScore(pub f64);

impl EvalScore for BleuScore {
    fn value(&self) -> f64 {
        self.0
    }

    fn higher_is_better(&self) -> bool {
        true
    }
}

impl fmt::Display for BleuScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BLEU4: {:.2}", self.0)
    }
}

/// Word error rate in percent (lower is better)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WerScore(pub f64);

impl EvalScore for WerScore {
    fn value(&self) -> f64 {
        self.0
    }

    fn higher_is_better(&self) -> bool {
        false
    }
}

impl fmt::Display for WerScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WER: {:.2}%", self.0)
    }
}

/// Sequence accuracy in [0, 1] (higher is better)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccuracyScore(pub f64);

impl EvalScore for AccuracyScore {
    fn value(&self) -> f64 {
        self.0
    }

    fn higher_is_better(&self) -> bool {
        true
    }
}

impl fmt::Display for AccuracyScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Acc: {:.2}%", self.0 * 100.0)
    }
}
