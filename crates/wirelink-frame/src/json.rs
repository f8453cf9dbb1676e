//! Built-in messages carrying an optional JSON document.

use serde_json::Value;

use crate::buffer::{WireBuffer, WireDecode, WireEncode, WireReader};
use crate::error::Result;
use crate::message::{Message, MessageKind, Request};
use crate::registry::MessageRegistry;

fn write_document(buf: &mut WireBuffer, document: Option<&Value>) -> Result<()> {
    buf.write_bool(document.is_some());
    match document {
        Some(document) => buf.write_json(document),
        None => Ok(()),
    }
}

fn read_document(reader: &mut WireReader) -> Result<Option<Value>> {
    if reader.read_bool()? {
        Ok(Some(reader.read_json()?))
    } else {
        Ok(None)
    }
}

macro_rules! json_message {
    ($(#[$meta:meta])* $name:ident, $tag:literal, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Default)]
        pub struct $name {
            pub document: Option<Value>,
        }

        impl $name {
            pub fn new(document: Value) -> Self {
                Self {
                    document: Some(document),
                }
            }

            pub fn empty() -> Self {
                Self { document: None }
            }
        }

        impl WireEncode for $name {
            fn encode(&self, buf: &mut WireBuffer) -> Result<()> {
                write_document(buf, self.document.as_ref())
            }
        }

        impl WireDecode for $name {
            fn decode(reader: &mut WireReader) -> Result<Self> {
                Ok(Self {
                    document: read_document(reader)?,
                })
            }
        }

        impl Message for $name {
            const TYPE_TAG: &'static str = $tag;
            const KIND: MessageKind = $kind;
        }
    };
}

json_message!(
    /// Fire-and-forget JSON document.
    JsonMessage,
    "wirelink.json",
    MessageKind::Plain
);

json_message!(
    /// JSON request, answered by a [`JsonResponse`].
    JsonRequest,
    "wirelink.json-request",
    MessageKind::Request
);

json_message!(
    /// JSON response to a [`JsonRequest`].
    JsonResponse,
    "wirelink.json-response",
    MessageKind::Response
);

impl Request for JsonRequest {
    type Response = JsonResponse;
}

/// Register the three JSON message types.
pub fn register_json_messages(registry: &mut MessageRegistry) -> Result<()> {
    registry
        .register::<JsonMessage>()?
        .register::<JsonRequest>()?
        .register::<JsonResponse>()?;
    Ok(())
}
