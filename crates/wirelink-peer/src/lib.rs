//! Handshake, connection lifecycle and request/response correlation.
//!
//! This is the "just works" layer. A [`Server`] accepts clients, promotes
//! them to authenticated [`Connection`]s once their handshake passes every
//! filter, and routes their messages through a [`Transmitter`]. A [`Client`]
//! connects, handshakes, and gets the same send/query API.

pub mod client;
pub mod connection;
pub mod control;
pub mod error;
pub mod handshake;
pub mod identity;
mod inbound;
pub mod server;
mod sync;
pub mod transmitter;

pub use client::{Client, ClientBuilder, ClientState};
pub use connection::{Connection, Outbound, PeerConfig, DEFAULT_WRITE_TIMEOUT};
pub use control::{default_registry, QueryError};
pub use error::{PeerError, Result};
pub use handshake::{
    require_property, Handshake, HandshakeCandidate, HandshakeConfig, HandshakeFilter,
    RejectPolicy,
};
pub use identity::{Identity, MAX_NAME_LEN};
pub use server::{ConnectionEvent, PacketFilter, Server, ServerBuilder};
pub use transmitter::Transmitter;
