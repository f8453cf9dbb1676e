use wirelink_frame::{
    register_json_messages, Message, MessageKind, MessageRegistry, WireBuffer, WireDecode,
    WireEncode, WireReader,
};

use crate::handshake::Handshake;

/// Response sent in place of a real one when a request cannot be answered.
///
/// The querying side resolves its pending slot with
/// [`crate::PeerError::QueryFailed`] instead of waiting for a timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryError {
    pub reason: String,
}

impl QueryError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl WireEncode for QueryError {
    fn encode(&self, buf: &mut WireBuffer) -> wirelink_frame::Result<()> {
        buf.write_str(&self.reason)
    }
}

impl WireDecode for QueryError {
    fn decode(reader: &mut WireReader) -> wirelink_frame::Result<Self> {
        Ok(Self {
            reason: reader.read_string()?,
        })
    }
}

impl Message for QueryError {
    const TYPE_TAG: &'static str = "wirelink.query-error";
    const KIND: MessageKind = MessageKind::Response;
}

/// Registry with the protocol's own messages: handshake, query error and
/// the JSON trio.
pub fn default_registry() -> MessageRegistry {
    let mut registry = MessageRegistry::new();
    // Built-in tags are distinct, so registration cannot collide.
    let _ = registry
        .register::<Handshake>()
        .and_then(|r| r.register::<QueryError>());
    let _ = register_json_messages(&mut registry);
    registry
}
