//! TCP transport for wirelink.
//!
//! This is the lowest layer of the stack: it accepts and opens long-lived TCP
//! connections and hands out [`WireStream`] handles. Everything above it only
//! needs "read bytes", "write bytes" and "shut the connection down".

pub mod error;
pub mod stream;
pub mod tcp;

pub use error::{Result, TransportError};
pub use stream::WireStream;
pub use tcp::TcpTransport;
