//! Sample clock discipline and UT-synchronous resampling for continuous
//! acquisition of radio signals through a sound card.

/// Floating point type used for signal processing.
pub type Sample = f64;

pub mod configuration;
pub mod discipline;
pub mod error;
pub mod pipeline;
pub mod resample;
pub mod ring;
pub mod sink;
pub mod source;
pub mod synth;
pub mod timestamp;

pub use error::{ConfigError, Error, Result};
pub use timestamp::Timestamp;
