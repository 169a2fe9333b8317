//! Sequence encoders
//!
//! Builders own the parameters of one recurrent or convolutional computation:
//! - `lstm`: stacked (bi)LSTM
//! - `residual`: LSTM stack with skip connections
//! - `pyramidal`: BiLSTM pyramid that shortens the time axis
//! - `conv`: 2-D convolution front end followed by a BiLSTM stack
//!
//! Encoders wrap builders behind the `Transducer` contract. Leaf encoders chain
//! into an `EncoderChain`, and a `ModularEncoder` chains leaves with
//! `SegmentingEncoder`s, which learn their own segmentation.

pub mod config;
pub mod conv;
pub mod encoder;
pub mod lstm;
pub mod pyramidal;
pub mod residual;
pub mod segmenting;
pub mod transducer;

pub use config::EncoderConfig;
pub use encoder::{ChainStage, Encoder, EncoderChain, LeafEncoder, ModularEncoder};
pub use segmenting::{LambdaSchedule, SegmentingEncoder};
pub use transducer::{TransductionBuilder, Transducer};
