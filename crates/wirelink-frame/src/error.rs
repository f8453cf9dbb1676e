/// Errors that can occur during buffer, frame and message encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A read asked for more bytes than the buffer holds.
    #[error("unexpected end of buffer (needed {needed} bytes, {remaining} remaining)")]
    UnexpectedEnd { needed: usize, remaining: usize },

    /// A string field is not valid UTF-8.
    #[error("invalid UTF-8 in string field: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A boolean field holds something other than 0 or 1.
    #[error("invalid boolean byte 0x{0:02x}")]
    InvalidBool(u8),

    /// A char field is not a Unicode scalar value.
    #[error("invalid char scalar value 0x{0:08x}")]
    InvalidChar(u32),

    /// An enumeration ordinal has no matching variant.
    #[error("unknown ordinal {ordinal} for {type_name} ({variants} variants)")]
    UnknownVariant {
        type_name: &'static str,
        ordinal: u32,
        variants: usize,
    },

    /// No message type is registered for the frame's type tag.
    #[error("unknown message type tag '{0}'")]
    UnknownTypeTag(String),

    /// A decoder finished with bytes still unread.
    #[error("{remaining} unread bytes left after decoding '{context}'")]
    TrailingBytes { context: String, remaining: usize },

    /// A length field disagrees with the bytes actually present.
    #[error("declared length {declared} does not match {actual} available bytes")]
    LengthMismatch { declared: usize, actual: usize },

    /// A JSON field could not be parsed or produced.
    #[error("invalid JSON document: {0}")]
    Json(#[from] serde_json::Error),

    /// A value could not be serialized.
    #[error("failed to encode '{context}': {reason}")]
    Encode { context: String, reason: String },

    /// Two different message types claim the same type tag.
    #[error("type tag '{0}' is already registered to a different message type")]
    DuplicateTypeTag(String),

    /// The frame exceeds the configured maximum size.
    #[error("frame too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// Whether the byte stream is still in sync after this error.
    ///
    /// Decode errors are confined to one already-delimited frame; the next
    /// frame can be read normally. I/O errors, EOF and oversized frames leave
    /// the stream unusable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            FrameError::Io(_) | FrameError::ConnectionClosed | FrameError::PayloadTooLarge { .. }
        )
    }

    /// Whether this is a blocking-read timeout rather than a real failure.
    pub fn is_timeout(&self) -> bool {
        match self {
            FrameError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_errors_are_recoverable() {
        assert!(FrameError::UnknownTypeTag("x".to_string()).is_recoverable());
        assert!(FrameError::TrailingBytes {
            context: "x".to_string(),
            remaining: 3
        }
        .is_recoverable());
        assert!(FrameError::UnexpectedEnd {
            needed: 4,
            remaining: 1
        }
        .is_recoverable());
    }

    #[test]
    fn stream_errors_are_fatal() {
        assert!(!FrameError::ConnectionClosed.is_recoverable());
        assert!(!FrameError::PayloadTooLarge { size: 2, max: 1 }.is_recoverable());
        assert!(!FrameError::Io(std::io::Error::other("boom")).is_recoverable());
    }

    #[test]
    fn timeouts_are_detected() {
        let err = FrameError::Io(std::io::Error::from(std::io::ErrorKind::WouldBlock));
        assert!(err.is_timeout());
        assert!(!FrameError::ConnectionClosed.is_timeout());
    }
}
