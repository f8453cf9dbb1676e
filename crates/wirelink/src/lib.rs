//! Length-framed binary messaging with correlated request/response over TCP.
//!
//! # Crate Structure
//!
//! - [`transport`] - TCP sockets and cloneable streams
//! - [`frame`] - Wire buffer, frame codec, message registry and blocking frame I/O
//! - [`peer`] - Handshake, connections, the transmitter and server/client lifecycle
//!   (behind `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use wirelink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use wirelink_frame::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use wirelink_peer::*;
}
