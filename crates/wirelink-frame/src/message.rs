use std::any::Any;
use std::fmt;

use crate::buffer::{WireBuffer, WireDecode, WireEncode};
use crate::codec::Frame;
use crate::correlation::CorrelationId;
use crate::error::Result;

/// How a message participates in correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Fire-and-forget, never correlated.
    Plain,
    /// Gets a fresh correlation id when sent as a query.
    Request,
    /// Carries the correlation id of the request it answers.
    Response,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed unit of exchange with a stable wire type tag.
///
/// ```
/// use wirelink_frame::{Message, WireBuffer, WireDecode, WireEncode, WireReader};
///
/// #[derive(Debug, PartialEq)]
/// struct Ping {
///     seq: i64,
/// }
///
/// impl WireEncode for Ping {
///     fn encode(&self, buf: &mut WireBuffer) -> wirelink_frame::Result<()> {
///         buf.write_i64(self.seq);
///         Ok(())
///     }
/// }
///
/// impl WireDecode for Ping {
///     fn decode(reader: &mut WireReader) -> wirelink_frame::Result<Self> {
///         Ok(Self { seq: reader.read_i64()? })
///     }
/// }
///
/// impl Message for Ping {
///     const TYPE_TAG: &'static str = "example.ping";
/// }
/// ```
pub trait Message: WireEncode + WireDecode + fmt::Debug + Send + Sync + 'static {
    const TYPE_TAG: &'static str;
    const KIND: MessageKind = MessageKind::Plain;
}

/// A message that is answered by exactly one `Response` per responder.
///
/// Implementors should also set `KIND` to [`MessageKind::Request`], and the
/// response type's `KIND` to [`MessageKind::Response`].
pub trait Request: Message {
    type Response: Message;
}

/// Object-safe view of any [`Message`], used where the concrete type is only
/// known through the type tag.
pub trait AnyMessage: fmt::Debug + Send + Sync + 'static {
    fn type_tag(&self) -> &'static str;
    fn kind(&self) -> MessageKind;
    fn encode_payload(&self, buf: &mut WireBuffer) -> Result<()>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<M: Message> AnyMessage for M {
    fn type_tag(&self) -> &'static str {
        M::TYPE_TAG
    }

    fn kind(&self) -> MessageKind {
        M::KIND
    }

    fn encode_payload(&self, buf: &mut WireBuffer) -> Result<()> {
        self.encode(buf)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

/// A decoded inbound message together with its correlation id.
#[derive(Debug)]
pub struct Envelope {
    pub correlation_id: Option<CorrelationId>,
    pub body: Box<dyn AnyMessage>,
}

impl Envelope {
    pub fn new(body: impl AnyMessage, correlation_id: Option<CorrelationId>) -> Self {
        Self {
            correlation_id,
            body: Box::new(body),
        }
    }

    pub fn type_tag(&self) -> &'static str {
        self.body.type_tag()
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Borrow the body as `M`, if that is its concrete type.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.body.as_any().downcast_ref::<M>()
    }

    /// Take the body as `M`, if that is its concrete type.
    pub fn into_message<M: Message>(self) -> Option<M> {
        self.body.into_any().downcast::<M>().ok().map(|message| *message)
    }
}

/// Encode a message into a frame ready for the wire.
pub fn encode_message(
    message: &dyn AnyMessage,
    correlation_id: Option<CorrelationId>,
) -> Result<Frame> {
    let mut payload = WireBuffer::new();
    message.encode_payload(&mut payload)?;
    Ok(Frame::new(
        message.type_tag(),
        correlation_id,
        payload.freeze(),
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::buffer::WireReader;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct Ping {
        pub seq: i64,
        pub note: String,
    }

    impl WireEncode for Ping {
        fn encode(&self, buf: &mut WireBuffer) -> Result<()> {
            buf.write_i64(self.seq);
            buf.write_str(&self.note)
        }
    }

    impl WireDecode for Ping {
        fn decode(reader: &mut WireReader) -> Result<Self> {
            Ok(Self {
                seq: reader.read_i64()?,
                note: reader.read_string()?,
            })
        }
    }

    impl Message for Ping {
        const TYPE_TAG: &'static str = "test.ping";
        const KIND: MessageKind = MessageKind::Request;
    }

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct Pong {
        pub seq: i64,
    }

    impl WireEncode for Pong {
        fn encode(&self, buf: &mut WireBuffer) -> Result<()> {
            buf.write_i64(self.seq);
            Ok(())
        }
    }

    impl WireDecode for Pong {
        fn decode(reader: &mut WireReader) -> Result<Self> {
            Ok(Self {
                seq: reader.read_i64()?,
            })
        }
    }

    impl Message for Pong {
        const TYPE_TAG: &'static str = "test.pong";
        const KIND: MessageKind = MessageKind::Response;
    }

    impl Request for Ping {
        type Response = Pong;
    }

    #[test]
    fn any_message_reports_static_metadata() {
        let ping = Ping {
            seq: 1,
            note: "n".to_string(),
        };
        let any: &dyn AnyMessage = &ping;
        assert_eq!(any.type_tag(), "test.ping");
        assert_eq!(any.kind(), MessageKind::Request);
    }

    #[test]
    fn encode_message_builds_frame() {
        let id = CorrelationId::generate();
        let frame = encode_message(&Pong { seq: 9 }, Some(id)).unwrap();
        assert_eq!(frame.type_tag, "test.pong");
        assert_eq!(frame.correlation_id, Some(id));
        assert_eq!(frame.payload.as_ref(), &9i64.to_be_bytes());
    }

    #[test]
    fn envelope_downcasts() {
        let env = Envelope::new(Pong { seq: 3 }, None);
        assert_eq!(env.type_tag(), "test.pong");
        assert!(env.downcast_ref::<Ping>().is_none());
        assert_eq!(env.downcast_ref::<Pong>(), Some(&Pong { seq: 3 }));

        assert_eq!(env.into_message::<Pong>(), Some(Pong { seq: 3 }));
        assert!(Envelope::new(Pong { seq: 4 }, None)
            .into_message::<Ping>()
            .is_none());
    }
}
