//! Training progress
//!
//! Loss bookkeeping, dev scores, epoch notification and the per-regimen loss tracker.

pub mod events;
pub mod loss;
pub mod loss_tracker;
pub mod score;

pub use events::{EpochListener, EpochNotifier};
pub use loss::LossValues;
pub use loss_tracker::{DevReport, LossTracker, TrainReport, EVAL_TRAIN_EVERY};
pub use score::{AccuracyScore, BleuScore, EvalScore, LossScore, WerScore};
