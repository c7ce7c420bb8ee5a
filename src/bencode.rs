//! Generic bencoded values on top of `bendy`.
//!
//! Typed KRPC messages cover most of the wire traffic, but BEP-44 carries
//! arbitrary bencoded values whose signing form depends on byte-ordered
//! dictionary keys, so a self-describing variant is needed alongside.

use bendy::decoding::{self, FromBencode, Object};
use bendy::encoding::{self, SingleItemEncoder, ToBencode};
use bytes::Bytes;
use std::collections::BTreeMap;

/// One of the four DHT wire types. Dictionary keys are kept in a
/// `BTreeMap` over raw bytes, which is exactly the canonical key order
/// bencoding requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Bytes),
    Int(i64),
    List(Vec<Value>),
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    pub fn from_str(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn from_slice(s: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s))
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Encoding a well-formed value cannot fail short of depth overflow,
        // which `MAX_DEPTH` below rules out for DHT-sized values.
        self.to_bencode().expect("bencode encoding failed")
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        Value::from_bencode(buf).ok()
    }
}

impl ToBencode for Value {
    const MAX_DEPTH: usize = 32;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), encoding::Error> {
        match self {
            Value::Bytes(b) => encoder.emit_bytes(b),
            Value::Int(i) => encoder.emit_int(*i),
            Value::List(l) => encoder.emit_list(|e| {
                for item in l {
                    e.emit(item)?;
                }
                Ok(())
            }),
            Value::Dict(d) => encoder.emit_dict(|mut e| {
                for (k, v) in d {
                    e.emit_pair(k, v)?;
                }
                Ok(())
            }),
        }
    }
}

impl FromBencode for Value {
    const EXPECTED_RECURSION_DEPTH: usize = 32;

    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error> {
        match object {
            Object::Bytes(b) => Ok(Value::Bytes(Bytes::copy_from_slice(b))),
            Object::Integer(raw) => raw
                .parse::<i64>()
                .map(Value::Int)
                .map_err(decoding::Error::malformed_content),
            Object::List(mut list) => {
                let mut out = Vec::new();
                while let Some(item) = list.next_object()? {
                    out.push(Value::decode_bencode_object(item)?);
                }
                Ok(Value::List(out))
            }
            Object::Dict(mut dict) => {
                let mut out = BTreeMap::new();
                while let Some((key, value)) = dict.next_pair()? {
                    out.insert(
                        Bytes::copy_from_slice(key),
                        Value::decode_bencode_object(value)?,
                    );
                }
                Ok(Value::Dict(out))
            }
        }
    }
}

/// Builder-ish helper for the common dictionary case.
#[derive(Default)]
pub struct DictBuilder(BTreeMap<Bytes, Value>);

impl DictBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: Value) -> Self {
        self.0.insert(Bytes::copy_from_slice(key.as_bytes()), value);
        self
    }

    pub fn set_opt(self, key: &str, value: Option<Value>) -> Self {
        match value {
            Some(v) => self.set(key, v),
            None => self,
        }
    }

    pub fn build(self) -> Value {
        Value::Dict(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_primitives() {
        assert_eq!(Value::from_str("spam").encode(), b"4:spam");
        assert_eq!(Value::Int(42).encode(), b"i42e");
        assert_eq!(Value::Int(-7).encode(), b"i-7e");
        assert_eq!(Value::Int(0).encode(), b"i0e");
    }

    #[test]
    fn encode_dict_orders_keys() {
        let v = DictBuilder::new()
            .set("zz", Value::Int(1))
            .set("aa", Value::from_str("x"))
            .set("mm", Value::List(vec![Value::Int(2)]))
            .build();

        assert_eq!(v.encode(), b"d2:aa1:x2:mmli2ee2:zzi1ee");
    }

    #[test]
    fn round_trip() {
        let cases: Vec<Value> = vec![
            Value::from_str(""),
            Value::from_slice(&[0, 1, 2, 0xff]),
            Value::Int(i64::MIN),
            Value::Int(i64::MAX),
            Value::List(vec![Value::Int(1), Value::from_str("two")]),
            DictBuilder::new()
                .set("k", Value::from_str("v"))
                .set("l", Value::List(vec![]))
                .build(),
        ];

        for v in cases {
            assert_eq!(Value::decode(&v.encode()), Some(v));
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(Value::decode(b"x"), None);
        assert_eq!(Value::decode(b"i42"), None);
        assert_eq!(Value::decode(b"4:spa"), None);
    }
}
