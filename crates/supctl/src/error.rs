//! Control client error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupCtlError {
    /// Serialization error from postcard
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// Frame length exceeds the control protocol maximum
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The session I/O task has terminated
    #[error("supervisor session closed")]
    SessionClosed,

    /// The supervisor rejected the request
    #[error("supervisor request failed: {0}")]
    Request(String),

    /// The supervisor answered with a reply that does not fit the request
    #[error("unexpected reply to {request}")]
    UnexpectedReply { request: &'static str },

    /// I/O error on the session stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SupCtlError>;
