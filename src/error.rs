//! Error types for link I/O.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while connecting, framing or moving bytes on a link.
///
/// None of these cross the public boundary of [`crate::link::Link`]; they are
/// logged and turned into a connection recycle or a failed write outcome.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Socket level failure (refused, reset, broken pipe, EOF).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame length field above the protocol maximum.
    #[error("frame length {len} exceeds limit {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// The stream ended in the middle of a frame payload.
    #[error("frame truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    /// A connect attempt did not complete in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
}

impl LinkError {
    /// True when the peer closed the stream on a frame boundary.
    pub fn is_eof(&self) -> bool {
        matches!(self, LinkError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Result type alias using LinkError.
pub type Result<T> = std::result::Result<T, LinkError>;
