//! Object records and their binary encoding.
//!
//! A record is an optional class name plus named field values. The stream
//! encoding is a 20-byte header (object signature, id, body length) followed
//! by the bincode-encoded body.

use crate::storage::error::{StorageError, StorageResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const OBJECT_SIGNATURE: u64 = 0x7463_656a_624f_6244;
pub const RECORD_HEADER_SIZE: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Id of another object.
    Ref(i64),
    List(Vec<Value>),
}

impl Value {
    /// Parse a command-line literal: `null`, `true`/`false`, integers,
    /// floats, `@<id>` references, anything else as text.
    pub fn parse(s: &str) -> Value {
        if s.eq_ignore_ascii_case("null") {
            return Value::Null;
        }
        if let Ok(b) = s.parse::<bool>() {
            return Value::Bool(b);
        }
        if let Ok(i) = s.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = s.parse::<f64>() {
            return Value::Float(f);
        }
        if let Some(id) = s.strip_prefix('@').and_then(|id| id.parse::<i64>().ok()) {
            return Value::Ref(id);
        }
        Value::Text(s.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Ref(id) => write!(f, "@{}", id),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

/// A stored object. `id` is assigned by the object context on add.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub id: Option<i64>,
    pub class: Option<String>,
    pub fields: BTreeMap<String, Value>,
}

#[derive(Serialize)]
struct RecordBodyRef<'a> {
    class: &'a Option<String>,
    fields: &'a BTreeMap<String, Value>,
}

#[derive(Deserialize)]
struct RecordBody {
    class: Option<String>,
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(class: impl Into<String>) -> Self {
        Self {
            class: Some(class.into()),
            ..Self::default()
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Encode the record for storage under `id`.
    pub fn encode(&self, id: i64) -> StorageResult<Bytes> {
        let body = bincode::serialize(&RecordBodyRef {
            class: &self.class,
            fields: &self.fields,
        })?;
        let len = u32::try_from(body.len()).map_err(|_| {
            StorageError::InvalidArgument(format!("record body of {} bytes is too large", body.len()))
        })?;

        let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + body.len());
        buf.put_u64_le(OBJECT_SIGNATURE);
        buf.put_i64_le(id);
        buf.put_u32_le(len);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Decode the stream header, returning the stored id and body length.
    pub fn decode_header(mut header: &[u8]) -> StorageResult<(i64, usize)> {
        if header.len() < RECORD_HEADER_SIZE {
            return Err(StorageError::Corruption(format!(
                "record header needs {} bytes, got {}",
                RECORD_HEADER_SIZE,
                header.len()
            )));
        }

        let signature = header.get_u64_le();
        if signature != OBJECT_SIGNATURE {
            return Err(StorageError::InvalidSignature {
                what: "object",
                expected: OBJECT_SIGNATURE,
                found: signature,
            });
        }
        let id = header.get_i64_le();
        let len = header.get_u32_le() as usize;
        Ok((id, len))
    }

    pub fn decode_body(id: i64, body: &[u8]) -> StorageResult<Record> {
        let body: RecordBody = bincode::deserialize(body)?;
        Ok(Record {
            id: Some(id),
            class: body.class,
            fields: body.fields,
        })
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "#{}", id)?,
            None => write!(f, "#-")?,
        }
        if let Some(class) = &self.class {
            write!(f, " {}", class)?;
        }
        write!(f, " {{")?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {}: {}", name, value)?;
        }
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record::with_class("Person")
            .with("name", "Ada")
            .with("age", 36i64)
            .with("score", 9.5)
            .with("active", true)
            .with("friend", Value::Ref(1001))
            .with(
                "tags",
                Value::List(vec![Value::from("math"), Value::Null, Value::Int(3)]),
            )
    }

    #[test]
    fn test_encode_and_decode() {
        let record = sample();
        let bytes = record.encode(1000).unwrap();

        let (id, len) = Record::decode_header(&bytes[..RECORD_HEADER_SIZE]).unwrap();
        assert_eq!(id, 1000);
        assert_eq!(len, bytes.len() - RECORD_HEADER_SIZE);

        let decoded = Record::decode_body(id, &bytes[RECORD_HEADER_SIZE..]).unwrap();
        assert_eq!(decoded.id, Some(1000));
        assert_eq!(decoded.class, record.class);
        assert_eq!(decoded.fields, record.fields);
    }

    #[test]
    fn test_bad_signature() {
        let mut bytes = BytesMut::from(&sample().encode(1).unwrap()[..]);
        bytes[0] ^= 0xff;

        let err = Record::decode_header(&bytes).unwrap_err();
        assert!(matches!(err, StorageError::InvalidSignature { what: "object", .. }));
    }

    #[test]
    fn test_short_header() {
        assert!(Record::decode_header(&[0u8; 8]).unwrap_err().is_corruption());
    }

    #[test]
    fn test_value_parse() {
        assert_eq!(Value::parse("null"), Value::Null);
        assert_eq!(Value::parse("true"), Value::Bool(true));
        assert_eq!(Value::parse("-12"), Value::Int(-12));
        assert_eq!(Value::parse("2.5"), Value::Float(2.5));
        assert_eq!(Value::parse("@1000"), Value::Ref(1000));
        assert_eq!(Value::parse("hello"), Value::Text("hello".to_string()));
    }

    #[test]
    fn test_field_access() {
        let mut record = Record::new();
        assert_eq!(record.set("a", 1i64), None);
        assert_eq!(record.set("a", 2i64), Some(Value::Int(1)));
        assert_eq!(record.get("a"), Some(&Value::Int(2)));
        assert_eq!(record.remove("a"), Some(Value::Int(2)));
        assert!(record.fields.is_empty());
    }

    #[test]
    fn test_display() {
        let record = Record::with_class("Point").with("x", 1i64).with("y", 2i64);
        assert_eq!(record.to_string(), "#- Point { x: 1, y: 2 }");
    }
}
