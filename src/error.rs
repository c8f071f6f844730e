use thiserror::Error;

/// All errors produced by the netcore crate.
#[derive(Debug, Error)]
pub enum NetCoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("interrupted")]
    Interrupt,
}

pub type Result<T> = std::result::Result<T, NetCoreError>;
