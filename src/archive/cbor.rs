// DAG-CBOR decoding into a small value tree.
//
// DAG-CBOR is the strict CBOR subset repositories are written in: definite
// lengths only, string map keys, and tag 42 for links to other blocks.
// Anything outside that subset is rejected rather than guessed at.

use std::collections::BTreeMap;

use base64::Engine;

use super::cid::Cid;
use crate::error::{TrackerError, TrackerResult};

const MAX_DEPTH: usize = 64;
const TAG_CID: u64 = 42;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Text(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Link(Cid),
}

impl Value {
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(m) => m.get(key),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&Cid> {
        match self {
            Value::Link(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// The record's `$type`, if this is a map that declares one.
    pub fn record_type(&self) -> Option<&str> {
        self.get("$type").and_then(Value::as_text)
    }

    /// Convert to the JSON data model used by the AT Protocol: links become
    /// `{"$link": cid}` and byte strings `{"$bytes": base64}`.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Null => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Integer(i) => J::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f).map_or(J::Null, J::Number),
            Value::Bytes(b) => serde_json::json!({
                "$bytes": base64::engine::general_purpose::STANDARD_NO_PAD.encode(b)
            }),
            Value::Text(s) => J::String(s.clone()),
            Value::Array(items) => J::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(m) => J::Object(m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
            Value::Link(cid) => serde_json::json!({ "$link": cid.to_string() }),
        }
    }
}

/// Decode one complete DAG-CBOR block.
pub fn decode(data: &[u8]) -> TrackerResult<Value> {
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.value(0)?;
    if decoder.pos != data.len() {
        return Err(TrackerError::decode(format!(
            "{} trailing bytes after CBOR value",
            data.len() - decoder.pos
        )));
    }
    Ok(value)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn take(&mut self, n: usize) -> TrackerResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| TrackerError::decode("CBOR value runs past end of block"))?;
        let data: &'a [u8] = self.data;
        let slice = &data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> TrackerResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read the argument that follows an initial byte's additional info.
    fn argument(&mut self, info: u8) -> TrackerResult<u64> {
        Ok(match info {
            0..=23 => u64::from(info),
            24 => u64::from(self.byte()?),
            25 => u64::from(u16::from_be_bytes([self.byte()?, self.byte()?])),
            26 => {
                let b = self.take(4)?;
                u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }
            27 => {
                let b = self.take(8)?;
                u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
            }
            31 => return Err(TrackerError::decode("indefinite-length items are not DAG-CBOR")),
            _ => return Err(TrackerError::decode(format!("reserved additional info {info}"))),
        })
    }

    fn length(&mut self, info: u8) -> TrackerResult<usize> {
        let len = self.argument(info)?;
        // Each element needs at least one byte, so a length beyond the
        // remaining input is malformed and must not drive an allocation.
        let remaining = (self.data.len() - self.pos) as u64;
        if len > remaining {
            return Err(TrackerError::decode(format!(
                "declared length {len} exceeds remaining {remaining} bytes"
            )));
        }
        Ok(len as usize)
    }

    fn value(&mut self, depth: usize) -> TrackerResult<Value> {
        if depth > MAX_DEPTH {
            return Err(TrackerError::decode("CBOR nesting too deep"));
        }

        let initial = self.byte()?;
        let major = initial >> 5;
        let info = initial & 0x1f;

        match major {
            0 => {
                let n = self.argument(info)?;
                i64::try_from(n)
                    .map(Value::Integer)
                    .map_err(|_| TrackerError::decode("unsigned integer out of range"))
            }
            1 => {
                let n = self.argument(info)?;
                i64::try_from(n)
                    .map(|n| Value::Integer(-1 - n))
                    .map_err(|_| TrackerError::decode("negative integer out of range"))
            }
            2 => {
                let len = self.length(info)?;
                Ok(Value::Bytes(self.take(len)?.to_vec()))
            }
            3 => {
                let len = self.length(info)?;
                let bytes = self.take(len)?;
                std::str::from_utf8(bytes)
                    .map(|s| Value::Text(s.to_string()))
                    .map_err(|_| TrackerError::decode("text string is not UTF-8"))
            }
            4 => {
                let len = self.length(info)?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.value(depth + 1)?);
                }
                Ok(Value::Array(items))
            }
            5 => {
                let len = self.length(info)?;
                let mut map = BTreeMap::new();
                for _ in 0..len {
                    let key = match self.value(depth + 1)? {
                        Value::Text(k) => k,
                        _ => return Err(TrackerError::decode("map keys must be strings")),
                    };
                    let value = self.value(depth + 1)?;
                    if map.insert(key, value).is_some() {
                        return Err(TrackerError::decode("duplicate map key"));
                    }
                }
                Ok(Value::Map(map))
            }
            6 => {
                let tag = self.argument(info)?;
                if tag != TAG_CID {
                    return Err(TrackerError::decode(format!("unsupported CBOR tag {tag}")));
                }
                match self.value(depth + 1)? {
                    // Link bytes carry a leading 0x00 multibase prefix
                    Value::Bytes(b) if b.first() == Some(&0) => Ok(Value::Link(Cid::from_bytes(&b[1..])?)),
                    _ => Err(TrackerError::decode("tag 42 must wrap prefixed CID bytes")),
                }
            }
            7 => match info {
                20 => Ok(Value::Bool(false)),
                21 => Ok(Value::Bool(true)),
                22 => Ok(Value::Null),
                26 => {
                    let b = self.take(4)?;
                    Ok(Value::Float(f64::from(f32::from_be_bytes([b[0], b[1], b[2], b[3]]))))
                }
                27 => {
                    let b = self.take(8)?;
                    Ok(Value::Float(f64::from_be_bytes([
                        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                    ])))
                }
                _ => Err(TrackerError::decode(format!("unsupported simple value {info}"))),
            },
            _ => unreachable!("major type is three bits"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::cid::CODEC_DAG_CBOR;

    #[test]
    fn test_scalars() {
        assert_eq!(decode(&[0x00]).unwrap(), Value::Integer(0));
        assert_eq!(decode(&[0x18, 0x64]).unwrap(), Value::Integer(100));
        assert_eq!(decode(&[0x20]).unwrap(), Value::Integer(-1));
        assert_eq!(decode(&[0xf5]).unwrap(), Value::Bool(true));
        assert_eq!(decode(&[0xf6]).unwrap(), Value::Null);
        assert_eq!(
            decode(&[0x63, b'a', b'b', b'c']).unwrap(),
            Value::Text("abc".to_string())
        );
    }

    #[test]
    fn test_map_with_link() {
        let cid = Cid::for_block(CODEC_DAG_CBOR, b"target");
        let cid_bytes = cid.to_bytes();

        // {"v": 42(h'00' || cid)}
        let mut data = vec![0xa1, 0x61, b'v', 0xd8, 0x2a, 0x58, (cid_bytes.len() + 1) as u8, 0x00];
        data.extend_from_slice(&cid_bytes);

        let value = decode(&data).unwrap();
        assert_eq!(value.get("v").and_then(Value::as_link), Some(&cid));
        assert_eq!(value.to_json()["v"]["$link"], cid.to_string());
    }

    #[test]
    fn test_rejects_non_dag_forms() {
        // indefinite-length array
        assert!(decode(&[0x9f, 0xff]).is_err());
        // integer map key
        assert!(decode(&[0xa1, 0x01, 0x02]).is_err());
        // unknown tag
        assert!(decode(&[0xc1, 0x00]).is_err());
        // trailing garbage
        assert!(decode(&[0x00, 0x00]).is_err());
    }

    #[test]
    fn test_rejects_lengths_past_end() {
        // byte string claiming 4 GiB
        assert!(decode(&[0x5a, 0xff, 0xff, 0xff, 0xff]).is_err());
        // array claiming more items than bytes
        assert!(decode(&[0x85, 0x01]).is_err());
    }

    #[test]
    fn test_depth_limit() {
        let mut data = vec![0x81; MAX_DEPTH + 2];
        data.push(0x00);
        assert!(decode(&data).is_err());
    }
}
