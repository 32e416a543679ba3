use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use xxhash_rust::xxh64::xxh64;

use crate::errors::CodeError;

/// Carrier of a function argument or result: either nothing, or one JSON
/// value held as its canonical byte form. Typed values are serialized once
/// at construction so that fingerprints are stable across equivalent
/// inputs; decoding into a target shape happens on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Argument {
    #[default]
    Empty,
    Json(Arc<[u8]>),
}

impl Argument {
    pub fn empty() -> Self {
        Self::Empty
    }

    /// Canonicalise a typed value into JSON bytes.
    pub fn new<T: Serialize>(value: &T) -> Result<Self, CodeError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| CodeError::bad_request(format!("argument does not encode: {e}")))?;
        Ok(Self::from_bytes(bytes))
    }

    /// Wrap raw JSON received from the wire. The bytes are validated but
    /// kept as-is.
    pub fn from_raw(bytes: Vec<u8>) -> Result<Self, CodeError> {
        if bytes.is_empty() {
            return Ok(Self::Empty);
        }
        serde_json::from_slice::<&RawValue>(&bytes)
            .map_err(|e| CodeError::bad_request(format!("argument is not valid json: {e}")))?;
        Ok(Self::from_bytes(bytes))
    }

    fn from_bytes(bytes: Vec<u8>) -> Self {
        if bytes == b"null" {
            return Self::Empty;
        }
        Self::Json(Arc::from(bytes.into_boxed_slice()))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// The canonical JSON bytes; `Empty` reads as `null`.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Empty => b"null",
            Self::Json(bytes) => bytes,
        }
    }

    /// Decode into any JSON-compatible target shape.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodeError> {
        serde_json::from_slice(self.bytes())
            .map_err(|e| CodeError::bad_request(format!("argument does not decode: {e}")))
    }

    /// Content digest used by fingerprints and the barrier key.
    pub fn digest(&self) -> u64 {
        xxh64(self.bytes(), 0)
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.bytes()))
    }
}

impl Serialize for Argument {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw = RawValue::from_string(self.to_string()).map_err(serde::ser::Error::custom)?;
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Argument {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Box::<RawValue>::deserialize(deserializer)?;
        Argument::from_raw(raw.get().as_bytes().to_vec()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_roundtrip() {
        #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
        struct Add {
            a: i64,
            b: i64,
        }

        let arg = Argument::new(&Add { a: 2, b: 3 }).unwrap();
        let back: Add = arg.decode().unwrap();
        assert_eq!(back, Add { a: 2, b: 3 });

        let map = BTreeMap::from([("k".to_string(), 1u32)]);
        let arg = Argument::new(&map).unwrap();
        let back: BTreeMap<String, u32> = arg.decode().unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_empty_reads_as_null() {
        let empty = Argument::empty();
        assert_eq!(empty.bytes(), b"null");
        let back: Option<u32> = empty.decode().unwrap();
        assert_eq!(back, None);

        // A JSON `null` normalises to `Empty`, so equal inputs share a
        // digest.
        let null = Argument::from_raw(b"null".to_vec()).unwrap();
        assert_eq!(null, empty);
        assert_eq!(null.digest(), empty.digest());
    }

    #[test]
    fn test_raw_rejects_invalid_json() {
        assert!(Argument::from_raw(b"{broken".to_vec()).is_err());
        assert!(Argument::from_raw(Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn test_digest_is_content_addressed() {
        let a = Argument::new(&serde_json::json!({"a": 2, "b": 3})).unwrap();
        let b = Argument::from_raw(br#"{"a":2,"b":3}"#.to_vec()).unwrap();
        let c = Argument::from_raw(br#"{"a":2,"b":4}"#.to_vec()).unwrap();

        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_embeds_raw_in_envelopes() {
        #[derive(Serialize, serde::Deserialize)]
        struct Envelope {
            body: Argument,
        }

        let envelope = Envelope {
            body: Argument::from_raw(br#"{"x":1}"#.to_vec()).unwrap(),
        };
        let encoded = serde_json::to_string(&envelope).unwrap();
        assert_eq!(encoded, r#"{"body":{"x":1}}"#);

        let decoded: Envelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.body.bytes(), br#"{"x":1}"#);
    }
}
