use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum Error {
    #[error("shape error: {0}")]
    Shape(String),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Stream(#[from] io::Error),

    #[error("unknown model '{requested}', available: {available:?}")]
    ModelNotFound {
        requested: String,
        available: Vec<&'static str>,
    },

    #[error("device {device} is not available: {reason}")]
    DeviceUnavailable { device: Device, reason: String },

    #[error("input batch lives on {input} but the module runs on {module}")]
    DeviceMismatch { input: Device, module: Device },

    #[error("token id {token} is outside the vocabulary of {vocab_size} entries")]
    TokenOutOfRange { token: u32, vocab_size: usize },

    #[error("cannot benchmark an empty input sequence")]
    EmptyInput,

    #[error("n_repeat must be at least 1")]
    InvalidRepeat,

    #[error("metal error: {0}")]
    Metal(String),

    #[error("timer error: {0}")]
    Timer(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
