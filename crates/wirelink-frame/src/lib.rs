//! Wire buffer, frame codec and type-tagged messages for wirelink.
//!
//! This is the layer that turns bytes into typed messages. Every frame on the
//! wire looks like:
//! - A 4-byte big-endian total length (outer framing)
//! - The message type tag (4-byte length + UTF-8)
//! - A 16-byte correlation id (sentinel when the message is not correlated)
//! - A 4-byte payload length followed by the payload bytes
//!
//! Payloads are written and read with [`WireBuffer`] / [`WireReader`], and
//! decoded into concrete message types through a [`MessageRegistry`].

#[cfg(feature = "async")]
pub mod async_codec;
pub mod buffer;
pub mod codec;
pub mod correlation;
pub mod error;
pub mod json;
pub mod message;
pub mod reader;
pub mod registry;
pub mod writer;

#[cfg(feature = "async")]
pub use async_codec::FrameCodec;
pub use buffer::{WireBuffer, WireDecode, WireEncode, WireEnum, WireReader};
pub use codec::{
    decode_body, decode_frame, encode_body, encode_frame, split_frame, Frame, FrameConfig,
    DEFAULT_MAX_FRAME, LENGTH_PREFIX_SIZE,
};
pub use correlation::CorrelationId;
pub use error::{FrameError, Result};
pub use json::{register_json_messages, JsonMessage, JsonRequest, JsonResponse};
pub use message::{encode_message, AnyMessage, Envelope, Message, MessageKind, Request};
pub use reader::FrameReader;
pub use registry::MessageRegistry;
pub use writer::FrameWriter;
