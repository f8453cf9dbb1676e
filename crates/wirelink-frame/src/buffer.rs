use std::collections::HashMap;
use std::hash::Hash;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::{FrameError, Result};

const INITIAL_CAPACITY: usize = 64;

/// Values that know how to write themselves into a [`WireBuffer`].
pub trait WireEncode {
    fn encode(&self, buf: &mut WireBuffer) -> Result<()>;
}

/// Values that know how to read themselves back from a [`WireReader`].
pub trait WireDecode: Sized {
    fn decode(reader: &mut WireReader) -> Result<Self>;
}

/// Enumerations carried on the wire as their ordinal index.
///
/// `VARIANTS` is the ordinal table: the variant at index `n` is encoded as `n`.
pub trait WireEnum: Copy + PartialEq + 'static {
    const VARIANTS: &'static [Self];
}

/// Write-mode buffer producing a message payload.
///
/// All multi-byte scalars are big-endian. Variable-length values carry a u32
/// length or count prefix. Scalar writes cannot fail; writes with a length
/// prefix return an error when the value does not fit the prefix.
#[derive(Debug, Clone, Default)]
pub struct WireBuffer {
    buf: BytesMut,
}

impl WireBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.buf.put_i8(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buf.put_i16(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.put_f32(value);
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64(value);
    }

    /// Write a char as its u32 scalar value.
    pub fn write_char(&mut self, value: char) {
        self.buf.put_u32(u32::from(value));
    }

    /// Write a UUID as two big-endian u64 halves (most significant first).
    pub fn write_uuid(&mut self, value: &Uuid) {
        let (high, low) = value.as_u64_pair();
        self.buf.put_u64(high);
        self.buf.put_u64(low);
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_str(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Write a length-prefixed opaque byte range.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_len(value.len(), "byte range")?;
        self.buf.put_slice(value);
        Ok(())
    }

    /// Write an enumeration as its ordinal.
    pub fn write_enum<E: WireEnum>(&mut self, value: E) -> Result<()> {
        let ordinal = E::VARIANTS
            .iter()
            .position(|variant| *variant == value)
            .ok_or_else(|| FrameError::Encode {
                context: std::any::type_name::<E>().to_string(),
                reason: "variant missing from ordinal table".to_string(),
            })?;
        self.write_len(ordinal, std::any::type_name::<E>())
    }

    /// Write a count-prefixed homogeneous list.
    pub fn write_list<T: WireEncode>(&mut self, items: &[T]) -> Result<()> {
        self.write_len(items.len(), "list")?;
        for item in items {
            item.encode(self)?;
        }
        Ok(())
    }

    /// Write a count-prefixed map, pairs in iteration order.
    pub fn write_map<'a, K, V, I>(&mut self, entries: I) -> Result<()>
    where
        K: WireEncode + 'a,
        V: WireEncode + 'a,
        I: IntoIterator<Item = (&'a K, &'a V)>,
        I::IntoIter: ExactSizeIterator,
    {
        let entries = entries.into_iter();
        self.write_len(entries.len(), "map")?;
        for (key, value) in entries {
            key.encode(self)?;
            value.encode(self)?;
        }
        Ok(())
    }

    /// Write a presence flag, then the value if present.
    pub fn write_option<T: WireEncode>(&mut self, value: Option<&T>) -> Result<()> {
        match value {
            Some(value) => {
                self.write_bool(true);
                value.encode(self)
            }
            None => {
                self.write_bool(false);
                Ok(())
            }
        }
    }

    /// Write another buffer's contents as a length-prefixed sub-buffer.
    pub fn write_buffer(&mut self, nested: &WireBuffer) -> Result<()> {
        self.write_bytes(nested.as_slice())
    }

    /// Build a sub-buffer in place and write it length-prefixed.
    pub fn write_nested<F>(&mut self, build: F) -> Result<()>
    where
        F: FnOnce(&mut WireBuffer) -> Result<()>,
    {
        let mut nested = WireBuffer::new();
        build(&mut nested)?;
        self.write_buffer(&nested)
    }

    /// Serialize `value` to JSON text and write it as a string.
    pub fn write_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.write_str(&text)
    }

    /// Write any [`WireEncode`] value.
    pub fn write<T: WireEncode + ?Sized>(&mut self, value: &T) -> Result<()> {
        value.encode(self)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Finish writing and hand out the bytes.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    /// Switch to read mode over what has been written so far.
    pub fn into_reader(self) -> WireReader {
        WireReader::new(self.freeze())
    }

    fn write_len(&mut self, len: usize, context: &str) -> Result<()> {
        let len = u32::try_from(len).map_err(|_| FrameError::Encode {
            context: context.to_string(),
            reason: format!("length {len} exceeds u32 prefix"),
        })?;
        self.buf.put_u32(len);
        Ok(())
    }
}

/// Read-mode cursor over a decoded payload.
///
/// Every read checks the remaining length first; reading past the end is a
/// [`FrameError::UnexpectedEnd`]. Call [`WireReader::finish`] once the value
/// has been decoded to make sure nothing was left behind.
#[derive(Debug, Clone)]
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self { buf: buf.into() }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(FrameError::InvalidBool(other)),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.ensure(1)?;
        Ok(self.buf.get_i8())
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.ensure(2)?;
        Ok(self.buf.get_i16())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.ensure(4)?;
        Ok(self.buf.get_f32())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.ensure(8)?;
        Ok(self.buf.get_f64())
    }

    pub fn read_char(&mut self) -> Result<char> {
        self.ensure(4)?;
        let scalar = self.buf.get_u32();
        char::from_u32(scalar).ok_or(FrameError::InvalidChar(scalar))
    }

    pub fn read_uuid(&mut self) -> Result<Uuid> {
        self.ensure(16)?;
        let high = self.buf.get_u64();
        let low = self.buf.get_u64();
        Ok(Uuid::from_u64_pair(high, low))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let raw = self.read_bytes()?;
        Ok(String::from_utf8(raw.to_vec())?)
    }

    /// Read a length-prefixed byte range without copying.
    pub fn read_bytes(&mut self) -> Result<Bytes> {
        let len = self.read_len()?;
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn read_enum<E: WireEnum>(&mut self) -> Result<E> {
        let ordinal = self.read_u32()?;
        E::VARIANTS
            .get(ordinal as usize)
            .copied()
            .ok_or(FrameError::UnknownVariant {
                type_name: std::any::type_name::<E>(),
                ordinal,
                variants: E::VARIANTS.len(),
            })
    }

    pub fn read_list<T: WireDecode>(&mut self) -> Result<Vec<T>> {
        let count = self.read_len()?;
        // Preallocation is bounded by the payload, not the declared count.
        let mut items = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            items.push(T::decode(self)?);
        }
        Ok(items)
    }

    pub fn read_map<K, V>(&mut self) -> Result<HashMap<K, V>>
    where
        K: WireDecode + Eq + Hash,
        V: WireDecode,
    {
        let count = self.read_len()?;
        let mut entries = HashMap::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            let key = K::decode(self)?;
            let value = V::decode(self)?;
            entries.insert(key, value);
        }
        Ok(entries)
    }

    pub fn read_option<T: WireDecode>(&mut self) -> Result<Option<T>> {
        if self.read_bool()? {
            Ok(Some(T::decode(self)?))
        } else {
            Ok(None)
        }
    }

    /// Read a length-prefixed sub-buffer as an independent reader.
    pub fn read_buffer(&mut self) -> Result<WireReader> {
        Ok(WireReader::new(self.read_bytes()?))
    }

    pub fn read_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let raw = self.read_bytes()?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn read<T: WireDecode>(&mut self) -> Result<T> {
        T::decode(self)
    }

    /// Declare decoding of `context` complete.
    ///
    /// Leftover bytes are logged and reported as [`FrameError::TrailingBytes`];
    /// the reader is consumed either way.
    pub fn finish(self, context: &str) -> Result<()> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(());
        }
        warn!(context, remaining, "discarding unread bytes after decode");
        Err(FrameError::TrailingBytes {
            context: context.to_string(),
            remaining,
        })
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    fn read_len(&mut self) -> Result<usize> {
        Ok(self.read_u32()? as usize)
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        let remaining = self.remaining();
        if remaining < needed {
            return Err(FrameError::UnexpectedEnd { needed, remaining });
        }
        Ok(())
    }
}

macro_rules! wire_scalar {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        $(
            impl WireEncode for $ty {
                fn encode(&self, buf: &mut WireBuffer) -> Result<()> {
                    buf.$write(*self);
                    Ok(())
                }
            }

            impl WireDecode for $ty {
                fn decode(reader: &mut WireReader) -> Result<Self> {
                    reader.$read()
                }
            }
        )*
    };
}

wire_scalar! {
    bool => write_bool, read_bool;
    u8 => write_u8, read_u8;
    i8 => write_i8, read_i8;
    i16 => write_i16, read_i16;
    i32 => write_i32, read_i32;
    i64 => write_i64, read_i64;
    f32 => write_f32, read_f32;
    f64 => write_f64, read_f64;
    char => write_char, read_char;
}

impl WireEncode for str {
    fn encode(&self, buf: &mut WireBuffer) -> Result<()> {
        buf.write_str(self)
    }
}

impl WireEncode for String {
    fn encode(&self, buf: &mut WireBuffer) -> Result<()> {
        buf.write_str(self)
    }
}

impl WireDecode for String {
    fn decode(reader: &mut WireReader) -> Result<Self> {
        reader.read_string()
    }
}

impl WireEncode for Uuid {
    fn encode(&self, buf: &mut WireBuffer) -> Result<()> {
        buf.write_uuid(self);
        Ok(())
    }
}

impl WireDecode for Uuid {
    fn decode(reader: &mut WireReader) -> Result<Self> {
        reader.read_uuid()
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode(&self, buf: &mut WireBuffer) -> Result<()> {
        buf.write_list(self)
    }
}

impl<T: WireDecode> WireDecode for Vec<T> {
    fn decode(reader: &mut WireReader) -> Result<Self> {
        reader.read_list()
    }
}

impl<T: WireEncode> WireEncode for Option<T> {
    fn encode(&self, buf: &mut WireBuffer) -> Result<()> {
        buf.write_option(self.as_ref())
    }
}

impl<T: WireDecode> WireDecode for Option<T> {
    fn decode(reader: &mut WireReader) -> Result<Self> {
        reader.read_option()
    }
}

impl<K: WireEncode, V: WireEncode, S> WireEncode for HashMap<K, V, S> {
    fn encode(&self, buf: &mut WireBuffer) -> Result<()> {
        buf.write_map(self.iter())
    }
}

impl<K: WireDecode + Eq + Hash, V: WireDecode> WireDecode for HashMap<K, V> {
    fn decode(reader: &mut WireReader) -> Result<Self> {
        reader.read_map()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Color {
        Red,
        Green,
        Blue,
    }

    impl WireEnum for Color {
        const VARIANTS: &'static [Self] = &[Color::Red, Color::Green, Color::Blue];
    }

    #[test]
    fn scalars_are_big_endian() {
        let mut buf = WireBuffer::new();
        buf.write_i32(1);
        buf.write_i16(-2);
        buf.write_bool(true);
        assert_eq!(buf.as_slice(), &[0, 0, 0, 1, 0xFF, 0xFE, 1]);
    }

    #[test]
    fn mixed_values_read_back_in_order() {
        let id = Uuid::new_v4();
        let mut buf = WireBuffer::new();
        buf.write_bool(false);
        buf.write_i8(-7);
        buf.write_i64(i64::MIN);
        buf.write_f32(1.5);
        buf.write_f64(-0.25);
        buf.write_char('λ');
        buf.write_uuid(&id);
        buf.write_str("héllo").unwrap();
        buf.write_enum(Color::Blue).unwrap();

        let mut reader = buf.into_reader();
        assert!(!reader.read_bool().unwrap());
        assert_eq!(reader.read_i8().unwrap(), -7);
        assert_eq!(reader.read_i64().unwrap(), i64::MIN);
        assert_eq!(reader.read_f32().unwrap(), 1.5);
        assert_eq!(reader.read_f64().unwrap(), -0.25);
        assert_eq!(reader.read_char().unwrap(), 'λ');
        assert_eq!(reader.read_uuid().unwrap(), id);
        assert_eq!(reader.read_string().unwrap(), "héllo");
        assert_eq!(reader.read_enum::<Color>().unwrap(), Color::Blue);
        reader.finish("mixed").unwrap();
    }

    #[test]
    fn string_layout_is_length_prefixed_utf8() {
        let mut buf = WireBuffer::new();
        buf.write_str("ab").unwrap();
        assert_eq!(buf.as_slice(), &[0, 0, 0, 2, b'a', b'b']);
    }

    #[test]
    fn uuid_layout_is_two_halves() {
        let id = Uuid::from_u64_pair(1, 2);
        let mut buf = WireBuffer::new();
        buf.write_uuid(&id);
        let mut expected = vec![0u8; 16];
        expected[7] = 1;
        expected[15] = 2;
        assert_eq!(buf.as_slice(), expected.as_slice());
    }

    #[test]
    fn collections_and_options() {
        let mut props = HashMap::new();
        props.insert("token".to_string(), "x".to_string());
        props.insert("role".to_string(), "worker".to_string());

        let mut buf = WireBuffer::new();
        buf.write_list(&[3i32, 1, 2]).unwrap();
        buf.write_map(props.iter()).unwrap();
        buf.write_option(Some(&"present".to_string())).unwrap();
        buf.write_option::<String>(None).unwrap();

        let mut reader = buf.into_reader();
        assert_eq!(reader.read_list::<i32>().unwrap(), vec![3, 1, 2]);
        assert_eq!(reader.read_map::<String, String>().unwrap(), props);
        assert_eq!(
            reader.read_option::<String>().unwrap().as_deref(),
            Some("present")
        );
        assert_eq!(reader.read_option::<String>().unwrap(), None);
        assert!(reader.is_empty());
    }

    #[test]
    fn nested_buffer_is_independent() {
        let mut buf = WireBuffer::new();
        buf.write_nested(|inner| {
            inner.write_i32(42);
            inner.write_str("inner")
        })
        .unwrap();
        buf.write_i16(9);

        let mut reader = buf.into_reader();
        let mut inner = reader.read_buffer().unwrap();
        assert_eq!(inner.read_i32().unwrap(), 42);
        assert_eq!(inner.read_string().unwrap(), "inner");
        inner.finish("inner").unwrap();
        assert_eq!(reader.read_i16().unwrap(), 9);
    }

    #[test]
    fn json_is_carried_as_text() {
        let doc = serde_json::json!({"op": "ping", "n": 3});
        let mut buf = WireBuffer::new();
        buf.write_json(&doc).unwrap();

        let mut reader = buf.clone().into_reader();
        let text = reader.read_string().unwrap();
        assert!(text.contains("\"op\":\"ping\""));

        let mut reader = buf.into_reader();
        let back: serde_json::Value = reader.read_json().unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn reading_past_end_fails() {
        let mut reader = WireReader::new(vec![0u8, 1]);
        let err = reader.read_i32().unwrap_err();
        assert!(matches!(
            err,
            FrameError::UnexpectedEnd {
                needed: 4,
                remaining: 2
            }
        ));
    }

    #[test]
    fn declared_length_beyond_payload_fails() {
        let mut buf = WireBuffer::new();
        buf.write_i32(100);
        buf.write_u8(b'a');
        let err = buf.into_reader().read_string().unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedEnd { needed: 100, .. }));
    }

    #[test]
    fn invalid_bool_and_char_and_utf8() {
        assert!(matches!(
            WireReader::new(vec![2u8]).read_bool(),
            Err(FrameError::InvalidBool(2))
        ));
        assert!(matches!(
            WireReader::new(vec![0u8, 0x00, 0xD8, 0x00]).read_char(),
            Err(FrameError::InvalidChar(0xD800))
        ));
        assert!(matches!(
            WireReader::new(vec![0u8, 0, 0, 1, 0xFF]).read_string(),
            Err(FrameError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn unknown_enum_ordinal_fails() {
        let mut buf = WireBuffer::new();
        buf.write_i32(7);
        let err = buf.into_reader().read_enum::<Color>().unwrap_err();
        assert!(matches!(
            err,
            FrameError::UnknownVariant {
                ordinal: 7,
                variants: 3,
                ..
            }
        ));
    }

    #[test]
    fn hostile_list_count_does_not_preallocate() {
        let mut buf = WireBuffer::new();
        buf.write_i32(i32::MAX);
        let err = buf.into_reader().read_list::<i64>().unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedEnd { .. }));
    }

    #[test]
    fn finish_reports_leftover_bytes() {
        let mut buf = WireBuffer::new();
        buf.write_i32(1);
        buf.write_i32(2);
        let mut reader = buf.into_reader();
        reader.read_i32().unwrap();

        let err = reader.finish("pair").unwrap_err();
        assert!(matches!(
            err,
            FrameError::TrailingBytes { remaining: 4, ref context } if context == "pair"
        ));
    }
}
