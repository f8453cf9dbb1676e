//! `tokio_util::codec` adapter for the outer frame layer.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_body, encode_frame, split_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

/// Splits a byte stream into frame bodies and encodes outbound frames.
///
/// The decoder yields raw bodies rather than decoded frames: a decoder error
/// ends a `FramedRead` stream, and a malformed body must not. Pass each body
/// to [`FrameCodec::decode_body`] and handle its error per frame.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    config: FrameConfig,
}

impl FrameCodec {
    pub fn new(config: FrameConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// Decode a body produced by this codec's decoder.
    pub fn decode_body(&self, body: Bytes) -> Result<Frame> {
        decode_body(body, self.config.no_correlation)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        split_frame(src, self.config.max_frame_size)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        encode_frame(&item, &self.config, dst)
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &Frame, dst: &mut BytesMut) -> Result<()> {
        encode_frame(item, &self.config, dst)
    }
}
