use std::fmt;

use uuid::Uuid;
use wirelink_frame::{WireBuffer, WireDecode, WireEncode, WireReader};

use crate::error::{PeerError, Result};

/// Maximum identity name length in bytes.
pub const MAX_NAME_LEN: usize = 128;

/// A peer's declared name plus its unique id.
///
/// Names are for humans and need not be unique; `id` is the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    name: String,
    id: Uuid,
}

impl Identity {
    /// Create an identity with a fresh random id.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(name, Uuid::new_v4())
    }

    pub fn with_id(name: impl Into<String>, id: Uuid) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Check the name is non-empty and within [`MAX_NAME_LEN`].
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(PeerError::HandshakeFailed(format!(
                "invalid identity name length: {}",
                self.name.len()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

impl WireEncode for Identity {
    fn encode(&self, buf: &mut WireBuffer) -> wirelink_frame::Result<()> {
        buf.write_str(&self.name)?;
        buf.write_uuid(&self.id);
        Ok(())
    }
}

impl WireDecode for Identity {
    fn decode(reader: &mut WireReader) -> wirelink_frame::Result<Self> {
        Ok(Self {
            name: reader.read_string()?,
            id: reader.read_uuid()?,
        })
    }
}
