use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use wirelink_frame::{Envelope, FrameConfig, FrameError, FrameReader, MessageRegistry};
use wirelink_transport::WireStream;

use crate::error::Result;

/// One step of a connection worker's read loop.
pub(crate) enum Inbound {
    Message(Envelope),
    /// The read timeout elapsed with no complete frame.
    Idle,
    /// The stream ended. `None` is a clean EOF.
    Closed(Option<FrameError>),
}

/// Reads frames off a connection and turns them into messages.
///
/// Malformed frames and unknown type tags are logged and skipped; only a
/// lost or desynchronized stream ends the loop.
pub(crate) struct InboundReader {
    reader: FrameReader<WireStream>,
    registry: Arc<MessageRegistry>,
}

impl InboundReader {
    /// `tick` becomes the read timeout, bounding how long `next` blocks.
    pub(crate) fn new(
        stream: WireStream,
        config: &FrameConfig,
        tick: Duration,
        registry: Arc<MessageRegistry>,
    ) -> Result<Self> {
        let config = FrameConfig {
            read_timeout: Some(tick),
            ..config.clone()
        };
        Ok(Self {
            reader: FrameReader::with_config_stream(stream, config)?,
            registry,
        })
    }

    pub(crate) fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.reader.set_max_frame_size(max_frame_size);
    }

    pub(crate) fn next(&mut self, peer: &dyn fmt::Display) -> Inbound {
        loop {
            let frame = match self.reader.read_frame() {
                Ok(frame) => frame,
                Err(err) if err.is_timeout() => return Inbound::Idle,
                Err(FrameError::ConnectionClosed) => return Inbound::Closed(None),
                Err(err) if err.is_recoverable() => {
                    warn!(peer = %peer, error = %err, "dropping malformed frame");
                    continue;
                }
                Err(err) => return Inbound::Closed(Some(err)),
            };

            match self.registry.decode(&frame) {
                Ok(envelope) => return Inbound::Message(envelope),
                Err(FrameError::UnknownTypeTag(tag)) => {
                    warn!(type_tag = %tag, peer = %peer, "dropping message with unknown type tag");
                }
                Err(err) => {
                    warn!(
                        type_tag = %frame.type_tag,
                        peer = %peer,
                        error = %err,
                        "dropping undecodable message"
                    );
                }
            }
            debug!(peer = %peer, "continuing after dropped frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use wirelink_frame::{encode_message, Frame, FrameWriter, JsonMessage, Message};
    use wirelink_transport::TcpTransport;

    use super::*;
    use crate::control::default_registry;

    fn pair() -> (WireStream, WireStream) {
        let transport = TcpTransport::bind("127.0.0.1:0").expect("transport should bind");
        let addr = transport.local_addr();
        let client =
            thread::spawn(move || TcpTransport::connect(addr).expect("client should connect"));
        let server = transport.accept().expect("transport should accept");
        (server, client.join().expect("client thread should finish"))
    }

    #[test]
    fn skips_unknown_and_malformed_frames() {
        let (server, client) = pair();
        let mut inbound = InboundReader::new(
            server,
            &FrameConfig::default(),
            Duration::from_millis(50),
            Arc::new(default_registry()),
        )
        .expect("inbound reader should build");

        let mut writer = FrameWriter::new(client);
        writer
            .write_frame(&Frame::new("nobody.knows", None, b"??".to_vec()))
            .expect("unknown frame should write");
        writer
            .write_frame(&Frame::new(JsonMessage::TYPE_TAG, None, vec![7u8]))
            .expect("malformed frame should write");
        let good = encode_message(&JsonMessage::new(serde_json::json!(1)), None)
            .expect("message should encode");
        writer.write_frame(&good).expect("good frame should write");

        match inbound.next(&"test") {
            Inbound::Message(envelope) => {
                assert_eq!(
                    envelope.into_message::<JsonMessage>(),
                    Some(JsonMessage::new(serde_json::json!(1)))
                );
            }
            _ => panic!("expected a message"),
        }

        assert!(matches!(inbound.next(&"test"), Inbound::Idle));

        drop(writer);
        assert!(matches!(inbound.next(&"test"), Inbound::Closed(None)));
    }

    #[test]
    fn oversized_frame_closes() {
        let (server, client) = pair();
        let mut inbound = InboundReader::new(
            server,
            &FrameConfig::default(),
            Duration::from_millis(50),
            Arc::new(default_registry()),
        )
        .expect("inbound reader should build");
        inbound.set_max_frame_size(64);

        let mut writer = FrameWriter::new(client);
        let big = encode_message(&JsonMessage::new(serde_json::json!("x".repeat(256))), None)
            .expect("message should encode");
        writer.write_frame(&big).expect("frame should write");

        assert!(matches!(
            inbound.next(&"test"),
            Inbound::Closed(Some(FrameError::PayloadTooLarge { .. }))
        ));
    }
}
