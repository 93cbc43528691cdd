//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Handshake did not start with the magic byte
    #[error("bad handshake magic: {0:#04x}")]
    BadMagic(u8),

    /// Type tag field was not NUL terminated
    #[error("handshake type tag is not NUL terminated")]
    MissingTerminator,

    /// Unknown or malformed type tag
    #[error("unknown query type tag '{0}'")]
    BadTypeTag(String),

    /// Declared value length was zero
    #[error("query value must not be empty")]
    EmptyValue,

    /// Value does not fit the 16-bit length field
    #[error("query value too long: {0} bytes")]
    ValueTooLong(usize),

    /// Peer closed the connection
    #[error("connection closed by peer")]
    Closed,

    /// I/O error on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let msg = format!("{}", ProtocolError::BadMagic(0xAB));
        assert!(msg.contains("0xab"));

        let msg = format!("{}", ProtocolError::BadTypeTag("blk".into()));
        assert!(msg.contains("'blk'"));
    }
}
