//! Messages, their typed property bag and the binary layout stored in
//! segment data files.
//!
//! # Wire layout
//!
//! ```text
//! +-----------------+--------------------------------------+-----------+------+
//! | flags: u16      | per present type, in PropertyType    | body len  | body |
//! | (1 bit / type)  | order: [count: u32][key/value ...]   | u32       |      |
//! +-----------------+--------------------------------------+-----------+------+
//! ```
//!
//! Keys are `u16`-length-prefixed UTF-8. String and byte values are
//! `u32`-length-prefixed; numeric values are fixed width. All integers are
//! big-endian.

use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Type namespace of a property. A key may hold one value per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PropertyType {
    String = 0,
    Boolean = 1,
    Byte = 2,
    Short = 3,
    Integer = 4,
    Long = 5,
    Float = 6,
    Double = 7,
    Bytes = 8,
}

impl PropertyType {
    /// Encoding order of the per-type property lists
    pub const ALL: [PropertyType; 9] = [
        PropertyType::String,
        PropertyType::Boolean,
        PropertyType::Byte,
        PropertyType::Short,
        PropertyType::Integer,
        PropertyType::Long,
        PropertyType::Float,
        PropertyType::Double,
        PropertyType::Bytes,
    ];

    fn flag(self) -> u16 {
        1 << (self as u8)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bytes(Bytes),
}

impl PropertyValue {
    pub fn property_type(&self) -> PropertyType {
        match self {
            Self::String(_) => PropertyType::String,
            Self::Boolean(_) => PropertyType::Boolean,
            Self::Byte(_) => PropertyType::Byte,
            Self::Short(_) => PropertyType::Short,
            Self::Integer(_) => PropertyType::Integer,
            Self::Long(_) => PropertyType::Long,
            Self::Float(_) => PropertyType::Float,
            Self::Double(_) => PropertyType::Double,
            Self::Bytes(_) => PropertyType::Bytes,
        }
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Self::String(s) => put_len_prefixed(buf, s.as_bytes())?,
            Self::Boolean(b) => buf.put_u8(u8::from(*b)),
            Self::Byte(v) => buf.put_i8(*v),
            Self::Short(v) => buf.put_i16(*v),
            Self::Integer(v) => buf.put_i32(*v),
            Self::Long(v) => buf.put_i64(*v),
            Self::Float(v) => buf.put_f32(*v),
            Self::Double(v) => buf.put_f64(*v),
            Self::Bytes(b) => put_len_prefixed(buf, b)?,
        }
        Ok(())
    }

    fn decode(property_type: PropertyType, buf: &mut impl Buf) -> Result<Self> {
        let value = match property_type {
            PropertyType::String => Self::String(get_string(buf)?),
            PropertyType::Boolean => {
                ensure_remaining(buf, 1, "boolean property")?;
                Self::Boolean(buf.get_u8() != 0)
            }
            PropertyType::Byte => {
                ensure_remaining(buf, 1, "byte property")?;
                Self::Byte(buf.get_i8())
            }
            PropertyType::Short => {
                ensure_remaining(buf, 2, "short property")?;
                Self::Short(buf.get_i16())
            }
            PropertyType::Integer => {
                ensure_remaining(buf, 4, "integer property")?;
                Self::Integer(buf.get_i32())
            }
            PropertyType::Long => {
                ensure_remaining(buf, 8, "long property")?;
                Self::Long(buf.get_i64())
            }
            PropertyType::Float => {
                ensure_remaining(buf, 4, "float property")?;
                Self::Float(buf.get_f32())
            }
            PropertyType::Double => {
                ensure_remaining(buf, 8, "double property")?;
                Self::Double(buf.get_f64())
            }
            PropertyType::Bytes => Self::Bytes(get_len_prefixed(buf, "bytes property")?),
        };
        Ok(value)
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i8> for PropertyValue {
    fn from(v: i8) -> Self {
        Self::Byte(v)
    }
}

impl From<i16> for PropertyValue {
    fn from(v: i16) -> Self {
        Self::Short(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        Self::Integer(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f32> for PropertyValue {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<Bytes> for PropertyValue {
    fn from(v: Bytes) -> Self {
        Self::Bytes(v)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(v))
    }
}

/// Open-ended bag of typed properties attached to a message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    entries: BTreeMap<(PropertyType, String), PropertyValue>,
}

impl MessageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, replacing any previous value of the same type under `key`
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        let value = value.into();
        self.entries
            .insert((value.property_type(), key.into()), value);
    }

    pub fn get(&self, property_type: PropertyType, key: &str) -> Option<&PropertyValue> {
        self.entries.get(&(property_type, key.to_string()))
    }

    pub fn contains(&self, property_type: PropertyType, key: &str) -> bool {
        self.get(property_type, key).is_some()
    }

    pub fn remove(&mut self, property_type: PropertyType, key: &str) -> Option<PropertyValue> {
        self.entries.remove(&(property_type, key.to_string()))
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.get(PropertyType::String, key) {
            Some(PropertyValue::String(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(PropertyType::Boolean, key) {
            Some(PropertyValue::Boolean(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_byte(&self, key: &str) -> Option<i8> {
        match self.get(PropertyType::Byte, key) {
            Some(PropertyValue::Byte(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_short(&self, key: &str) -> Option<i16> {
        match self.get(PropertyType::Short, key) {
            Some(PropertyValue::Short(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i32> {
        match self.get(PropertyType::Integer, key) {
            Some(PropertyValue::Integer(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.get(PropertyType::Long, key) {
            Some(PropertyValue::Long(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_float(&self, key: &str) -> Option<f32> {
        match self.get(PropertyType::Float, key) {
            Some(PropertyValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        match self.get(PropertyType::Double, key) {
            Some(PropertyValue::Double(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&Bytes> {
        match self.get(PropertyType::Bytes, key) {
            Some(PropertyValue::Bytes(v)) => Some(v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(type, key, value)` in encoding order
    pub fn iter(&self) -> impl Iterator<Item = (PropertyType, &str, &PropertyValue)> {
        self.entries
            .iter()
            .map(|((ty, key), value)| (*ty, key.as_str(), value))
    }

    fn count_of(&self, property_type: PropertyType) -> usize {
        self.entries
            .keys()
            .filter(|(ty, _)| *ty == property_type)
            .count()
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let flags = PropertyType::ALL
            .iter()
            .filter(|ty| self.count_of(**ty) > 0)
            .fold(0u16, |acc, ty| acc | ty.flag());
        buf.put_u16(flags);

        for ty in PropertyType::ALL {
            let count = self.count_of(ty);
            if count == 0 {
                continue;
            }
            buf.put_u32(u32::try_from(count).map_err(|_| {
                Error::Other(format!("too many {:?} properties: {}", ty, count))
            })?);
            for ((_, key), value) in self.entries.range((ty, String::new())..) {
                if value.property_type() != ty {
                    break;
                }
                let key_len = u16::try_from(key.len())
                    .map_err(|_| Error::Other(format!("property key too long: {} bytes", key.len())))?;
                buf.put_u16(key_len);
                buf.put_slice(key.as_bytes());
                value.encode(buf)?;
            }
        }
        Ok(())
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        ensure_remaining(buf, 2, "property flags")?;
        let flags = buf.get_u16();
        let known = PropertyType::ALL.iter().fold(0u16, |acc, ty| acc | ty.flag());
        if flags & !known != 0 {
            return Err(Error::CorruptState(format!(
                "unknown property type flags {:#06x}",
                flags
            )));
        }

        let mut properties = Self::new();
        for ty in PropertyType::ALL {
            if flags & ty.flag() == 0 {
                continue;
            }
            ensure_remaining(buf, 4, "property count")?;
            let count = buf.get_u32();
            for _ in 0..count {
                ensure_remaining(buf, 2, "property key length")?;
                let key_len = usize::from(buf.get_u16());
                ensure_remaining(buf, key_len, "property key")?;
                let key = String::from_utf8(buf.copy_to_bytes(key_len).to_vec())
                    .map_err(|e| Error::CorruptState(format!("property key is not UTF-8: {}", e)))?;
                let value = PropertyValue::decode(ty, buf)?;
                properties.entries.insert((ty, key), value);
            }
        }
        Ok(properties)
    }
}

/// An immutable payload plus its properties. A message has no identity beyond
/// the offset it is stored at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    properties: MessageProperties,
    body: Bytes,
}

impl Message {
    /// Create a message without properties
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            properties: MessageProperties::new(),
            body: body.into(),
        }
    }

    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    /// Serialize into `buf` (properties block followed by the length-prefixed body)
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        self.properties.encode(buf)?;
        put_len_prefixed(buf, &self.body)
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.body.len() + 16);
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let properties = MessageProperties::decode(buf)?;
        let body = get_len_prefixed(buf, "message body")?;
        Ok(Self { properties, body })
    }

    /// Deserialize a single message occupying all of `data`
    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        let message = Self::decode(&mut data)?;
        if data.has_remaining() {
            return Err(Error::CorruptState(format!(
                "{} trailing bytes after message",
                data.remaining()
            )));
        }
        Ok(message)
    }
}

#[derive(Debug, Default)]
pub struct MessageBuilder {
    properties: MessageProperties,
    body: Bytes,
}

impl MessageBuilder {
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.set(key, value);
        self
    }

    pub fn build(self) -> Message {
        Message {
            properties: self.properties,
            body: self.body,
        }
    }
}

/// An ordered run of messages starting at `start_offset`.
///
/// Used both as a write batch and as a read result. A read result may be
/// shorter than requested when a gap between segments is reached; the caller
/// continues from [`next_offset`](Self::next_offset).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageSet {
    start_offset: u64,
    messages: Vec<Message>,
}

impl MessageSet {
    pub fn new(start_offset: u64) -> Self {
        Self {
            start_offset,
            messages: Vec::new(),
        }
    }

    pub fn with_messages(start_offset: u64, messages: Vec<Message>) -> Self {
        Self {
            start_offset,
            messages,
        }
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Offset immediately after the last message in the set
    pub fn next_offset(&self) -> u64 {
        self.start_offset + self.messages.len() as u64
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    /// Messages paired with their absolute offsets
    pub fn iter_with_offsets(&self) -> impl Iterator<Item = (u64, &Message)> {
        (self.start_offset..).zip(self.messages.iter())
    }

    /// Move the start of an empty set, used when a read jumps over a gap
    pub(crate) fn restart_at(&mut self, start_offset: u64) {
        debug_assert!(self.messages.is_empty());
        self.start_offset = start_offset;
    }
}

impl IntoIterator for MessageSet {
    type Item = Message;
    type IntoIter = std::vec::IntoIter<Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

impl<'a> IntoIterator for &'a MessageSet {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

fn ensure_remaining(buf: &impl Buf, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::CorruptState(format!(
            "truncated {}: need {} bytes, {} remaining",
            what,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

fn put_len_prefixed(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| Error::Other(format!("field too large: {} bytes", data.len())))?;
    buf.put_u32(len);
    buf.put_slice(data);
    Ok(())
}

fn get_len_prefixed(buf: &mut impl Buf, what: &str) -> Result<Bytes> {
    ensure_remaining(buf, 4, what)?;
    let len = buf.get_u32() as usize;
    ensure_remaining(buf, len, what)?;
    Ok(buf.copy_to_bytes(len))
}

fn get_string(buf: &mut impl Buf) -> Result<String> {
    let raw = get_len_prefixed(buf, "string property")?;
    String::from_utf8(raw.to_vec())
        .map_err(|e| Error::CorruptState(format!("string property is not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip_with_every_property_type() {
        let message = Message::builder()
            .body(Bytes::from_static(b"payload"))
            .property("name", "orders")
            .property("flag", true)
            .property("b", 7i8)
            .property("s", -300i16)
            .property("i", 123_456i32)
            .property("l", i64::MAX)
            .property("f", 1.5f32)
            .property("d", -2.25f64)
            .property("raw", vec![0u8, 1, 2])
            .build();

        let bytes = message.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();

        assert_eq!(decoded, message);
        let props = decoded.properties();
        assert_eq!(props.get_string("name"), Some("orders"));
        assert_eq!(props.get_bool("flag"), Some(true));
        assert_eq!(props.get_byte("b"), Some(7));
        assert_eq!(props.get_short("s"), Some(-300));
        assert_eq!(props.get_int("i"), Some(123_456));
        assert_eq!(props.get_long("l"), Some(i64::MAX));
        assert_eq!(props.get_float("f"), Some(1.5));
        assert_eq!(props.get_double("d"), Some(-2.25));
        assert_eq!(props.get_bytes("raw").map(|b| b.as_ref()), Some(&[0u8, 1, 2][..]));
    }

    #[test]
    fn test_same_key_under_different_types() {
        let mut props = MessageProperties::new();
        props.set("k", "text");
        props.set("k", 42i32);
        props.set("k", 43i32);

        assert_eq!(props.len(), 2);
        assert_eq!(props.get_string("k"), Some("text"));
        assert_eq!(props.get_int("k"), Some(43));
        assert_eq!(props.get_long("k"), None);

        assert!(props.remove(PropertyType::String, "k").is_some());
        assert!(!props.contains(PropertyType::String, "k"));
        assert!(props.contains(PropertyType::Integer, "k"));
    }

    #[test]
    fn test_empty_message_layout() {
        let bytes = Message::new(Bytes::new()).to_bytes().unwrap();
        // flags (2) + body length (4)
        assert_eq!(bytes.as_ref(), &[0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_flags_mark_present_types() {
        let message = Message::builder().property("a", 1i64).body("x").build();
        let bytes = message.to_bytes().unwrap();
        assert_eq!(u16::from_be_bytes([bytes[0], bytes[1]]), 1 << 5);
    }

    #[test]
    fn test_truncated_input_is_corrupt() {
        let bytes = Message::builder()
            .property("key", "value")
            .body("body")
            .build()
            .to_bytes()
            .unwrap();

        for cut in 0..bytes.len() {
            let err = Message::from_bytes(&bytes[..cut]).unwrap_err();
            assert!(err.is_corruption(), "cut at {} gave {:?}", cut, err);
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = Message::new("x").to_bytes().unwrap().to_vec();
        bytes.push(0xff);
        assert!(Message::from_bytes(&bytes).unwrap_err().is_corruption());
    }

    #[test]
    fn test_unknown_flag_rejected() {
        let bytes = [0x80, 0x00, 0, 0, 0, 0];
        assert!(Message::from_bytes(&bytes).unwrap_err().is_corruption());
    }

    #[test]
    fn test_message_set_offsets() {
        let mut set = MessageSet::new(40);
        assert!(set.is_empty());
        assert_eq!(set.next_offset(), 40);

        set.push(Message::new("a"));
        set.push(Message::new("b"));

        assert_eq!(set.len(), 2);
        assert_eq!(set.start_offset(), 40);
        assert_eq!(set.next_offset(), 42);

        let offsets: Vec<u64> = set.iter_with_offsets().map(|(o, _)| o).collect();
        assert_eq!(offsets, vec![40, 41]);
        assert_eq!(set.get(1).unwrap().body(), &Bytes::from("b"));
    }
}
