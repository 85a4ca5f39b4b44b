//! Error types.
//!
//! Anomalies inside a discipline (noisy rate evaluations, wild pulse
//! intervals and so on) are not errors: they are logged and absorbed by a
//! state transition. What ends up here is either a configuration problem,
//! reported once before any data is processed, or a failure of the
//! collaborators around the core (source, sink, stream format).

use std::path::PathBuf;

use thiserror::Error;

/// Problems with the configuration. These are always fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no timing method specified")]
    MissingMethod,

    #[error("unrecognised method option: {0}")]
    UnknownMethodOption(String),

    #[error("invalid value in method option {option}: {value}")]
    InvalidMethodValue { option: String, value: String },

    #[error("invalid timing channel {channel}, input has {channels} channels")]
    InvalidChannel { channel: usize, channels: usize },

    #[error("no channels left to output")]
    NoOutputChannels,

    #[error("invalid or missing sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("invalid number of channels: {0}")]
    InvalidChannels(usize),

    #[error("invalid data bits: {0}")]
    InvalidBits(u32),

    #[error("invalid capture half-width {0} s")]
    InvalidHalfWidth(f64),

    #[error("invalid block size: {0}")]
    InvalidBlockSize(usize),

    #[error("invalid timestamp [{text}]: {reason}")]
    Timestamp { text: String, reason: String },

    #[error("invalid timespec [{0}]")]
    Timespec(String),

    #[error("cannot read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed block stream: {0}")]
    BlockFormat(String),

    #[error("undefined pulse mark position: centroid {centroid} over window {start}..{end}")]
    UndefinedMark { centroid: f64, start: isize, end: isize },

    #[error("too many consecutive read errors ({0})")]
    TooManyReadErrors(u32),
}

impl Error {
    /// Whether a failed read may succeed if simply retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
