use std::any::TypeId;
use std::collections::HashMap;

use tracing::debug;

use crate::buffer::{WireDecode, WireReader};
use crate::codec::Frame;
use crate::error::{FrameError, Result};
use crate::message::{AnyMessage, Envelope, Message, MessageKind};

type DecodeFn = fn(&mut WireReader) -> Result<Box<dyn AnyMessage>>;

#[derive(Clone, Copy)]
struct Entry {
    type_id: TypeId,
    type_name: &'static str,
    kind: MessageKind,
    decode: DecodeFn,
}

/// Static map from type tag to decoder, populated before any connection
/// starts.
///
/// The registered set is the closed set of messages a peer understands; a
/// frame whose tag is not registered fails with [`FrameError::UnknownTypeTag`].
#[derive(Clone, Default)]
pub struct MessageRegistry {
    entries: HashMap<&'static str, Entry>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `M` under its type tag.
    ///
    /// Registering the same type twice is a no-op. A different type claiming
    /// an already registered tag fails with [`FrameError::DuplicateTypeTag`].
    pub fn register<M: Message>(&mut self) -> Result<&mut Self> {
        let type_id = TypeId::of::<M>();
        if let Some(existing) = self.entries.get(M::TYPE_TAG) {
            if existing.type_id == type_id {
                return Ok(self);
            }
            return Err(FrameError::DuplicateTypeTag(M::TYPE_TAG.to_string()));
        }

        debug!(type_tag = M::TYPE_TAG, kind = %M::KIND, "registered message type");
        self.entries.insert(
            M::TYPE_TAG,
            Entry {
                type_id,
                type_name: std::any::type_name::<M>(),
                kind: M::KIND,
                decode: decode_boxed::<M>,
            },
        );
        Ok(self)
    }

    /// Builder form of [`MessageRegistry::register`].
    pub fn with<M: Message>(mut self) -> Result<Self> {
        self.register::<M>()?;
        Ok(self)
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.entries.contains_key(type_tag)
    }

    pub fn kind_of(&self, type_tag: &str) -> Option<MessageKind> {
        self.entries.get(type_tag).map(|entry| entry.kind)
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.entries.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Construct the concrete message for `frame`.
    ///
    /// The message's decoder must consume the payload exactly.
    pub fn decode(&self, frame: &Frame) -> Result<Envelope> {
        let entry = self
            .entries
            .get(frame.type_tag.as_str())
            .ok_or_else(|| FrameError::UnknownTypeTag(frame.type_tag.clone()))?;

        let mut reader = WireReader::new(frame.payload.clone());
        let body = (entry.decode)(&mut reader)?;
        reader.finish(&frame.type_tag)?;

        Ok(Envelope {
            correlation_id: frame.correlation_id,
            body,
        })
    }
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for tag in self.tags() {
            if let Some(entry) = self.entries.get(tag) {
                map.entry(&tag, &entry.type_name);
            }
        }
        map.finish()
    }
}

fn decode_boxed<M: Message>(reader: &mut WireReader) -> Result<Box<dyn AnyMessage>> {
    Ok(Box::new(M::decode(reader)?))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::buffer::{WireBuffer, WireEncode};
    use crate::correlation::CorrelationId;
    use crate::message::encode_message;
    use crate::message::tests::{Ping, Pong};

    #[derive(Debug)]
    struct Impostor;

    impl WireEncode for Impostor {
        fn encode(&self, _buf: &mut WireBuffer) -> Result<()> {
            Ok(())
        }
    }

    impl WireDecode for Impostor {
        fn decode(_reader: &mut WireReader) -> Result<Self> {
            Ok(Self)
        }
    }

    impl Message for Impostor {
        const TYPE_TAG: &'static str = "test.ping";
    }

    fn registry() -> MessageRegistry {
        MessageRegistry::new()
            .with::<Ping>()
            .and_then(|r| r.with::<Pong>())
            .expect("test registry should build")
    }

    #[test]
    fn decode_roundtrip_for_registered_types() {
        let registry = registry();
        let ping = Ping {
            seq: 42,
            note: "hello".to_string(),
        };
        let id = CorrelationId::generate();

        let frame = encode_message(&ping, Some(id)).unwrap();
        let env = registry.decode(&frame).unwrap();
        assert_eq!(env.correlation_id, Some(id));
        assert_eq!(env.kind(), MessageKind::Request);
        assert_eq!(env.into_message::<Ping>(), Some(ping));

        let frame = encode_message(&Pong { seq: -1 }, None).unwrap();
        let env = registry.decode(&frame).unwrap();
        assert_eq!(env.correlation_id, None);
        assert_eq!(env.downcast_ref::<Pong>(), Some(&Pong { seq: -1 }));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let registry = registry();
        let frame = Frame::new("test.unknown", None, Bytes::new());
        let err = registry.decode(&frame).unwrap_err();
        assert!(matches!(err, FrameError::UnknownTypeTag(ref tag) if tag == "test.unknown"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let registry = registry();
        let frame = Frame::new(Pong::TYPE_TAG, None, Bytes::from_static(&[0, 0, 0]));
        let err = registry.decode(&frame).unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedEnd { .. }));
    }

    #[test]
    fn leftover_payload_is_rejected() {
        let registry = registry();
        let mut frame = encode_message(&Pong { seq: 5 }, None).unwrap();
        let mut payload = frame.payload.to_vec();
        payload.push(0);
        frame.payload = Bytes::from(payload);

        let err = registry.decode(&frame).unwrap_err();
        assert!(matches!(err, FrameError::TrailingBytes { remaining: 1, .. }));
    }

    #[test]
    fn registration_is_idempotent_and_exclusive() {
        let mut registry = registry();
        registry.register::<Ping>().unwrap();
        assert_eq!(registry.len(), 2);

        let err = registry.register::<Impostor>().unwrap_err();
        assert!(matches!(err, FrameError::DuplicateTypeTag(ref tag) if tag == "test.ping"));
        assert_eq!(registry.kind_of("test.ping"), Some(MessageKind::Request));
        assert_eq!(registry.tags(), vec!["test.ping", "test.pong"]);
    }
}
