use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::correlation::CorrelationId;
use crate::error::{FrameError, Result};

/// Outer length prefix: u32 big-endian total length of the frame body.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Fixed body overhead: tag length (4) + correlation id (16) + payload length (4).
pub const BODY_OVERHEAD: usize = 4 + 16 + 4;

/// Default maximum frame body size: 16 MiB.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// One decoded frame: type tag, optional correlation id and raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Registered message-type identifier.
    pub type_tag: String,
    /// Correlation id, `None` for plain messages.
    pub correlation_id: Option<CorrelationId>,
    /// Message-specific payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(
        type_tag: impl Into<String>,
        correlation_id: Option<CorrelationId>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            type_tag: type_tag.into(),
            correlation_id,
            payload: payload.into(),
        }
    }

    /// Size of the frame body (everything after the outer length prefix).
    pub fn body_size(&self) -> usize {
        BODY_OVERHEAD + self.type_tag.len() + self.payload.len()
    }

    /// The total wire size of this frame (length prefix + body).
    pub fn wire_size(&self) -> usize {
        LENGTH_PREFIX_SIZE + self.body_size()
    }
}

/// Write a frame body (no outer length prefix).
///
/// ```text
/// ┌──────────────┬───────────┬────────────────┬─────────────┬─────────────┐
/// │ Tag len (4B) │ Tag UTF-8 │ Correlation id │ Payload len │ Payload     │
/// │ u32 BE       │           │ (16B)          │ (4B BE)     │             │
/// └──────────────┴───────────┴────────────────┴─────────────┴─────────────┘
/// ```
pub fn encode_body(frame: &Frame, no_correlation: Uuid, dst: &mut BytesMut) -> Result<()> {
    let tag_len = prefix_len(frame.type_tag.len(), "type tag")?;
    let payload_len = prefix_len(frame.payload.len(), &frame.type_tag)?;
    let correlation = frame
        .correlation_id
        .map(|id| id.as_uuid())
        .unwrap_or(no_correlation);
    let (high, low) = correlation.as_u64_pair();

    dst.reserve(frame.body_size());
    dst.put_u32(tag_len);
    dst.put_slice(frame.type_tag.as_bytes());
    dst.put_u64(high);
    dst.put_u64(low);
    dst.put_u32(payload_len);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Encode a frame with its outer length prefix.
pub fn encode_frame(frame: &Frame, config: &FrameConfig, dst: &mut BytesMut) -> Result<()> {
    let body_size = frame.body_size();
    if body_size > config.max_frame_size {
        return Err(FrameError::PayloadTooLarge {
            size: body_size,
            max: config.max_frame_size,
        });
    }
    dst.reserve(LENGTH_PREFIX_SIZE + body_size);
    dst.put_u32(prefix_len(body_size, &frame.type_tag)?);
    encode_body(frame, config.no_correlation, dst)
}

/// Split one length-delimited frame body off the front of `src`.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// A declared length above `max_frame` is fatal: the stream cannot be resynced.
pub fn split_frame(src: &mut BytesMut, max_frame: usize) -> Result<Option<Bytes>> {
    if src.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    prefix.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
    let body_len = u32::from_be_bytes(prefix) as usize;

    if body_len > max_frame {
        return Err(FrameError::PayloadTooLarge {
            size: body_len,
            max: max_frame,
        });
    }

    if src.len() < LENGTH_PREFIX_SIZE + body_len {
        src.reserve(LENGTH_PREFIX_SIZE + body_len - src.len());
        return Ok(None);
    }

    src.advance(LENGTH_PREFIX_SIZE);
    Ok(Some(src.split_to(body_len).freeze()))
}

/// Decode a complete frame body.
///
/// The body must be consumed exactly: a payload length that disagrees with
/// the bytes present, or bytes left after the payload, reject the frame.
pub fn decode_body(mut body: Bytes, no_correlation: Uuid) -> Result<Frame> {
    let tag_len = read_u32(&mut body)? as usize;
    ensure(&body, tag_len)?;
    let type_tag = String::from_utf8(body.split_to(tag_len).to_vec())?;

    ensure(&body, 16)?;
    let high = body.get_u64();
    let low = body.get_u64();
    let correlation = Uuid::from_u64_pair(high, low);
    let correlation_id = (correlation != no_correlation).then(|| CorrelationId::from(correlation));

    let payload_len = read_u32(&mut body)? as usize;
    if payload_len > body.len() {
        return Err(FrameError::LengthMismatch {
            declared: payload_len,
            actual: body.len(),
        });
    }
    let payload = body.split_to(payload_len);

    if !body.is_empty() {
        return Err(FrameError::TrailingBytes {
            context: type_tag,
            remaining: body.len(),
        });
    }

    Ok(Frame {
        type_tag,
        correlation_id,
        payload,
    })
}

/// Split and decode the next frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet. On
/// success or on a body decode error the frame bytes have been consumed.
pub fn decode_frame(src: &mut BytesMut, config: &FrameConfig) -> Result<Option<Frame>> {
    match split_frame(src, config.max_frame_size)? {
        Some(body) => decode_body(body, config.no_correlation).map(Some),
        None => Ok(None),
    }
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum frame body size in bytes. Default: 16 MiB.
    pub max_frame_size: usize,
    /// Wire value meaning "no correlation". Default: the nil UUID.
    pub no_correlation: Uuid,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME,
            no_correlation: Uuid::nil(),
            read_timeout: None,
            write_timeout: None,
        }
    }
}

fn prefix_len(len: usize, context: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| FrameError::Encode {
        context: context.to_string(),
        reason: format!("length {len} exceeds u32 prefix"),
    })
}

fn read_u32(body: &mut Bytes) -> Result<u32> {
    ensure(body, 4)?;
    Ok(body.get_u32())
}

fn ensure(body: &Bytes, needed: usize) -> Result<()> {
    if body.len() < needed {
        return Err(FrameError::UnexpectedEnd {
            needed,
            remaining: body.len(),
        });
    }
    Ok(())
}
