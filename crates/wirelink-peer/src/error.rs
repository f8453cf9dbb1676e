use std::time::Duration;

/// Errors that can occur in peer operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] wirelink_transport::TransportError),

    /// Frame-level error (decode, encode or stream I/O).
    #[error("frame error: {0}")]
    Frame(#[from] wirelink_frame::FrameError),

    /// A handshake filter refused the connection.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The handshake was malformed or did not arrive in time.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A request arrived with no responder anywhere in the chain.
    #[error("no responder registered for request '{0}'")]
    UnroutableRequest(String),

    /// A query got no response before its deadline.
    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    /// A query was answered with a message of the wrong type.
    #[error("unexpected response '{actual}' (expected '{expected}')")]
    UnexpectedResponse {
        expected: &'static str,
        actual: String,
    },

    /// The remote side reported that it could not answer a query.
    #[error("query failed on remote side: {0}")]
    QueryFailed(String),

    /// Peer disconnected.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// A non-handshake message arrived before the handshake.
    #[error("connection is not authenticated")]
    NotAuthenticated,
}

impl PeerError {
    /// Whether the connection that produced this error is gone.
    pub fn is_disconnect(&self) -> bool {
        match self {
            PeerError::Disconnected(_) => true,
            PeerError::Frame(err) => !err.is_recoverable(),
            PeerError::Transport(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;
