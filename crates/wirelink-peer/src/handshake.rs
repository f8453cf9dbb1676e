use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use wirelink_frame::{Message, WireBuffer, WireDecode, WireEncode, WireReader};

use crate::error::{PeerError, Result};
use crate::identity::Identity;

const MAX_PROPERTIES: usize = 64;
const MAX_PROPERTY_KEY_LEN: usize = 256;
const MAX_PROPERTY_VALUE_LEN: usize = 4096;

/// First message a client sends after connecting.
///
/// Property values are treated as opaque credential material and redacted in
/// debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct Handshake {
    pub identity: Identity,
    pub properties: HashMap<String, String>,
}

impl Handshake {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Check identity and property bounds.
    pub fn validate(&self) -> Result<()> {
        self.identity.validate()?;
        if self.properties.len() > MAX_PROPERTIES {
            return Err(PeerError::HandshakeFailed(format!(
                "too many handshake properties: {} (max {})",
                self.properties.len(),
                MAX_PROPERTIES
            )));
        }
        for (key, value) in &self.properties {
            if key.is_empty() || key.len() > MAX_PROPERTY_KEY_LEN {
                return Err(PeerError::HandshakeFailed(format!(
                    "invalid property key length: {}",
                    key.len()
                )));
            }
            if value.len() > MAX_PROPERTY_VALUE_LEN {
                return Err(PeerError::HandshakeFailed(format!(
                    "property '{key}' value too long: {} (max {})",
                    value.len(),
                    MAX_PROPERTY_VALUE_LEN
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.properties.keys().collect();
        keys.sort();
        f.debug_struct("Handshake")
            .field("identity", &self.identity)
            .field("properties", &format_args!("<redacted:{keys:?}>"))
            .finish()
    }
}

impl WireEncode for Handshake {
    fn encode(&self, buf: &mut WireBuffer) -> wirelink_frame::Result<()> {
        self.identity.encode(buf)?;
        buf.write_map(self.properties.iter())
    }
}

impl WireDecode for Handshake {
    fn decode(reader: &mut WireReader) -> wirelink_frame::Result<Self> {
        Ok(Self {
            identity: Identity::decode(reader)?,
            properties: reader.read_map()?,
        })
    }
}

impl Message for Handshake {
    const TYPE_TAG: &'static str = "wirelink.handshake";
}

/// What a handshake filter gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeCandidate<'a> {
    pub identity: &'a Identity,
    pub properties: &'a HashMap<String, String>,
    pub peer_addr: Option<SocketAddr>,
}

impl HandshakeCandidate<'_> {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Predicate deciding whether a pending connection may authenticate.
pub trait HandshakeFilter: Send + Sync {
    fn accept(&self, candidate: &HandshakeCandidate<'_>) -> bool;
}

impl<F> HandshakeFilter for F
where
    F: Fn(&HandshakeCandidate<'_>) -> bool + Send + Sync,
{
    fn accept(&self, candidate: &HandshakeCandidate<'_>) -> bool {
        self(candidate)
    }
}

/// Filter requiring `properties[key] == expected`.
pub fn require_property(
    key: impl Into<String>,
    expected: impl Into<String>,
) -> impl HandshakeFilter + 'static {
    let key = key.into();
    let expected = expected.into();
    move |candidate: &HandshakeCandidate<'_>| candidate.property(&key) == Some(expected.as_str())
}

/// Run `filters` in order, stopping at the first rejection.
pub(crate) fn evaluate_filters(
    filters: &[Arc<dyn HandshakeFilter>],
    candidate: &HandshakeCandidate<'_>,
) -> Result<()> {
    for (index, filter) in filters.iter().enumerate() {
        if !filter.accept(candidate) {
            return Err(PeerError::HandshakeRejected(format!(
                "filter #{index} refused {}",
                candidate.identity
            )));
        }
    }
    Ok(())
}

/// What happens to a connection whose handshake was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectPolicy {
    /// Leave the connection pending so the client may retry.
    #[default]
    KeepOpen,
    /// Close the transport immediately.
    Close,
}

/// Configuration for the server-side handshake phase.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// How long a connection may stay pending. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Handling of rejected handshakes.
    pub reject_policy: RejectPolicy,
    /// Maximum frame size accepted before authentication.
    pub max_handshake_frame: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            reject_policy: RejectPolicy::KeepOpen,
            max_handshake_frame: 16 * 1024,
        }
    }
}
