//! AMF0 encoding and decoding for RTMP command and data messages.
//!
//! Only the subset RTMP peers actually exchange is supported:
//!
//! ```text
//! 0x00 Number        0x05 Null          0x0A Strict Array
//! 0x01 Boolean       0x06 Undefined     0x0B Date
//! 0x02 String        0x08 ECMA Array    0x0C Long String
//! 0x03 Object        0x09 Object End
//! ```
//!
//! Objects keep their properties in wire order so re-encoding a decoded
//! command yields the same bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const MARKER_NUMBER: u8 = 0x00;
pub const MARKER_BOOLEAN: u8 = 0x01;
pub const MARKER_STRING: u8 = 0x02;
pub const MARKER_OBJECT: u8 = 0x03;
pub const MARKER_NULL: u8 = 0x05;
pub const MARKER_UNDEFINED: u8 = 0x06;
pub const MARKER_ECMA_ARRAY: u8 = 0x08;
pub const MARKER_OBJECT_END: u8 = 0x09;
pub const MARKER_STRICT_ARRAY: u8 = 0x0A;
pub const MARKER_DATE: u8 = 0x0B;
pub const MARKER_LONG_STRING: u8 = 0x0C;

const MAX_NESTING_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum Amf0Error {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unsupported marker {0:#04x}")]
    UnsupportedMarker(u8),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("nesting deeper than {MAX_NESTING_DEPTH} levels")]
    NestingTooDeep,
    #[error("object key of {0} bytes does not fit a 16-bit length")]
    KeyTooLong(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Amf0Object),
    Null,
    Undefined,
    EcmaArray(Amf0Object),
    StrictArray(Vec<Amf0Value>),
    /// Milliseconds since the epoch; the time-zone field is always 0 on
    /// the wire and ignored when decoding.
    Date(f64),
}

impl Amf0Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Objects and ECMA arrays both expose their properties here.
    pub fn as_object(&self) -> Option<&Amf0Object> {
        match self {
            Self::Object(o) | Self::EcmaArray(o) => Some(o),
            _ => None,
        }
    }
}

impl From<f64> for Amf0Value {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<bool> for Amf0Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for Amf0Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Amf0Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Amf0Object> for Amf0Value {
    fn from(v: Amf0Object) -> Self {
        Self::Object(v)
    }
}

/// Ordered property list of an AMF0 object or ECMA array.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Amf0Object(Vec<(String, Amf0Value)>);

impl Amf0Object {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<Amf0Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Replace an existing property or append a new one.
    pub fn insert(&mut self, key: &str, value: impl Into<Amf0Value>) {
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.0.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Amf0Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Amf0Value::as_str)
    }

    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Amf0Value::as_number)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Amf0Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Encode `values` back to back.
pub fn encode(values: &[Amf0Value]) -> Result<Bytes, Amf0Error> {
    let mut buf = BytesMut::new();
    for v in values {
        encode_value(&mut buf, v)?;
    }
    Ok(buf.freeze())
}

pub fn encode_value(buf: &mut BytesMut, value: &Amf0Value) -> Result<(), Amf0Error> {
    match value {
        Amf0Value::Number(n) => {
            buf.put_u8(MARKER_NUMBER);
            buf.put_f64(*n);
        }
        Amf0Value::Boolean(b) => {
            buf.put_u8(MARKER_BOOLEAN);
            buf.put_u8(u8::from(*b));
        }
        Amf0Value::String(s) => {
            if s.len() > u16::MAX as usize {
                buf.put_u8(MARKER_LONG_STRING);
                buf.put_u32(s.len() as u32);
            } else {
                buf.put_u8(MARKER_STRING);
                buf.put_u16(s.len() as u16);
            }
            buf.put_slice(s.as_bytes());
        }
        Amf0Value::Object(o) => {
            buf.put_u8(MARKER_OBJECT);
            encode_properties(buf, o)?;
        }
        Amf0Value::Null => buf.put_u8(MARKER_NULL),
        Amf0Value::Undefined => buf.put_u8(MARKER_UNDEFINED),
        Amf0Value::EcmaArray(o) => {
            buf.put_u8(MARKER_ECMA_ARRAY);
            buf.put_u32(o.len() as u32);
            encode_properties(buf, o)?;
        }
        Amf0Value::StrictArray(items) => {
            buf.put_u8(MARKER_STRICT_ARRAY);
            buf.put_u32(items.len() as u32);
            for item in items {
                encode_value(buf, item)?;
            }
        }
        Amf0Value::Date(ms) => {
            buf.put_u8(MARKER_DATE);
            buf.put_f64(*ms);
            buf.put_i16(0);
        }
    }
    Ok(())
}

fn encode_properties(buf: &mut BytesMut, obj: &Amf0Object) -> Result<(), Amf0Error> {
    for (key, value) in obj.iter() {
        if key.len() > u16::MAX as usize {
            return Err(Amf0Error::KeyTooLong(key.len()));
        }
        buf.put_u16(key.len() as u16);
        buf.put_slice(key.as_bytes());
        encode_value(buf, value)?;
    }
    buf.put_u16(0);
    buf.put_u8(MARKER_OBJECT_END);
    Ok(())
}

/// Decode every value in `data`.
pub fn decode(mut data: &[u8]) -> Result<Vec<Amf0Value>, Amf0Error> {
    let mut values = Vec::new();
    while data.has_remaining() {
        values.push(decode_value(&mut data)?);
    }
    Ok(values)
}

/// Decode one value and advance `buf` past it.
pub fn decode_value(buf: &mut &[u8]) -> Result<Amf0Value, Amf0Error> {
    decode_nested(buf, 0)
}

fn need(buf: &[u8], n: usize) -> Result<(), Amf0Error> {
    if buf.len() < n {
        return Err(Amf0Error::UnexpectedEof);
    }
    Ok(())
}

fn decode_nested(buf: &mut &[u8], depth: usize) -> Result<Amf0Value, Amf0Error> {
    if depth > MAX_NESTING_DEPTH {
        return Err(Amf0Error::NestingTooDeep);
    }
    need(buf, 1)?;
    let marker = buf.get_u8();
    let value = match marker {
        MARKER_NUMBER => {
            need(buf, 8)?;
            Amf0Value::Number(buf.get_f64())
        }
        MARKER_BOOLEAN => {
            need(buf, 1)?;
            Amf0Value::Boolean(buf.get_u8() != 0)
        }
        MARKER_STRING => {
            need(buf, 2)?;
            let len = buf.get_u16() as usize;
            Amf0Value::String(read_utf8(buf, len)?)
        }
        MARKER_LONG_STRING => {
            need(buf, 4)?;
            let len = buf.get_u32() as usize;
            Amf0Value::String(read_utf8(buf, len)?)
        }
        MARKER_OBJECT => Amf0Value::Object(decode_properties(buf, depth)?),
        MARKER_NULL => Amf0Value::Null,
        MARKER_UNDEFINED => Amf0Value::Undefined,
        MARKER_ECMA_ARRAY => {
            // The count is advisory; the end marker terminates the list.
            need(buf, 4)?;
            buf.advance(4);
            Amf0Value::EcmaArray(decode_properties(buf, depth)?)
        }
        MARKER_STRICT_ARRAY => {
            need(buf, 4)?;
            let count = buf.get_u32() as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(decode_nested(buf, depth + 1)?);
            }
            Amf0Value::StrictArray(items)
        }
        MARKER_DATE => {
            need(buf, 10)?;
            let ms = buf.get_f64();
            buf.advance(2);
            Amf0Value::Date(ms)
        }
        other => return Err(Amf0Error::UnsupportedMarker(other)),
    };
    Ok(value)
}

fn read_utf8(buf: &mut &[u8], len: usize) -> Result<String, Amf0Error> {
    need(buf, len)?;
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| Amf0Error::InvalidUtf8)?
        .to_string();
    buf.advance(len);
    Ok(s)
}

fn decode_properties(buf: &mut &[u8], depth: usize) -> Result<Amf0Object, Amf0Error> {
    let mut obj = Amf0Object::new();
    loop {
        need(buf, 2)?;
        let key_len = buf.get_u16() as usize;
        if key_len == 0 {
            need(buf, 1)?;
            if buf[0] == MARKER_OBJECT_END {
                buf.advance(1);
                return Ok(obj);
            }
        }
        let key = read_utf8(buf, key_len)?;
        let value = decode_nested(buf, depth + 1)?;
        obj.0.push((key, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_object() -> Amf0Object {
        Amf0Object::new()
            .with("app", "live")
            .with("type", "nonprivate")
            .with("tcUrl", "rtmp://127.0.0.1/live")
            .with("fpad", false)
            .with("capabilities", 15.0)
    }

    #[test]
    fn connect_command_survives_reencoding() {
        let values = vec![
            Amf0Value::from("connect"),
            Amf0Value::Number(1.0),
            Amf0Value::Object(connect_object()),
        ];
        let wire = encode(&values).unwrap();
        let decoded = decode(&wire).unwrap();
        assert_eq!(decoded, values);
        assert_eq!(encode(&decoded).unwrap(), wire);
    }

    #[test]
    fn string_wire_layout() {
        let wire = encode(&[Amf0Value::from("ab")]).unwrap();
        assert_eq!(&wire[..], &[MARKER_STRING, 0x00, 0x02, b'a', b'b']);
    }

    #[test]
    fn object_ends_with_end_marker() {
        let wire = encode(&[Amf0Value::Object(Amf0Object::new())]).unwrap();
        assert_eq!(&wire[..], &[MARKER_OBJECT, 0x00, 0x00, MARKER_OBJECT_END]);
    }

    #[test]
    fn ecma_array_and_nested_values() {
        let meta = Amf0Object::new()
            .with("width", 1280.0)
            .with("encoder", "x")
            .with("nested", Amf0Object::new().with("k", true));
        let values = vec![
            Amf0Value::EcmaArray(meta),
            Amf0Value::StrictArray(vec![Amf0Value::Null, Amf0Value::Undefined]),
            Amf0Value::Date(1000.0),
        ];
        let decoded = decode(&encode(&values).unwrap()).unwrap();
        assert_eq!(decoded, values);
        assert_eq!(
            decoded[0].as_object().unwrap().get_number("width"),
            Some(1280.0)
        );
    }

    #[test]
    fn long_strings_use_long_marker() {
        let s = "x".repeat(70_000);
        let wire = encode(&[Amf0Value::from(s.as_str())]).unwrap();
        assert_eq!(wire[0], MARKER_LONG_STRING);
        assert_eq!(decode(&wire).unwrap()[0].as_str(), Some(s.as_str()));
    }

    #[test]
    fn truncated_input_is_an_error() {
        let wire = encode(&[Amf0Value::Number(3.0)]).unwrap();
        assert!(matches!(
            decode(&wire[..5]),
            Err(Amf0Error::UnexpectedEof)
        ));
        assert!(matches!(
            decode(&[MARKER_OBJECT, 0x00, 0x01, b'a']),
            Err(Amf0Error::UnexpectedEof)
        ));
    }

    #[test]
    fn unknown_marker_is_an_error() {
        assert!(matches!(
            decode(&[0x11]),
            Err(Amf0Error::UnsupportedMarker(0x11))
        ));
    }

    #[test]
    fn insert_replaces_existing_key() {
        let mut obj = Amf0Object::new().with("a", 1.0);
        obj.insert("a", 2.0);
        assert_eq!(obj.len(), 1);
        assert_eq!(obj.get_number("a"), Some(2.0));
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let mut wire = Vec::new();
        for _ in 0..(MAX_NESTING_DEPTH + 2) {
            wire.extend_from_slice(&[MARKER_STRICT_ARRAY, 0, 0, 0, 1]);
        }
        wire.push(MARKER_NULL);
        assert!(matches!(decode(&wire), Err(Amf0Error::NestingTooDeep)));
    }
}
