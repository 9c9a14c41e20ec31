use thiserror::Error;
use xb_frame::AudioFormat;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("no translator path: {from} -> {to}")]
    FormatUnsupported { from: AudioFormat, to: AudioFormat },

    #[error("channel hung up")]
    Hangup,

    #[error("not supported by {0}")]
    NotSupported(&'static str),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("maximum call limit reached")]
    CallLimit,

    #[error("driver error: {0}")]
    Driver(String),
}
