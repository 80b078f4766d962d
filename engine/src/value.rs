//! Values stored in replicated maps, and object kinds.

use crate::wire::ObjectData;
use crate::{Error, ObjectId, Result, Timestamp, ROOT_OBJECT_ID};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// The kind of a replicated object, encoded as the prefix of its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObjectKind {
    Map,
    Counter,
}

impl ObjectKind {
    /// Infer the kind from an object id (`map:...` / `counter:...`).
    ///
    /// The root id is always a map.
    pub fn from_object_id(object_id: &str) -> Result<Self> {
        if object_id == ROOT_OBJECT_ID {
            return Ok(ObjectKind::Map);
        }
        match object_id.split_once(':') {
            Some(("map", rest)) if !rest.is_empty() => Ok(ObjectKind::Map),
            Some(("counter", rest)) if !rest.is_empty() => Ok(ObjectKind::Counter),
            _ => Err(Error::InvalidObjectId(object_id.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Map => "map",
            ObjectKind::Counter => "counter",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the id of a newly created object.
///
/// Format: `<kind>:<base64url(sha256(initialValue:nonce))>@<serverTimeMs>`.
pub fn generate_object_id(
    kind: ObjectKind,
    initial_value: &str,
    nonce: &str,
    server_time: Timestamp,
) -> ObjectId {
    let digest = Sha256::digest(format!("{initial_value}:{nonce}").as_bytes());
    let hash = URL_SAFE_NO_PAD.encode(digest);
    format!("{kind}:{hash}@{server_time}")
}

/// A value held by a map entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "value")]
pub enum ObjectValue {
    String(String),
    Number(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    /// A link to another object in the same pool
    Reference(ObjectId),
}

impl ObjectValue {
    /// Decode wire data. The first populated field wins, primitives before
    /// references.
    pub fn from_wire(data: &ObjectData) -> Result<Self> {
        if let Some(b) = data.boolean {
            return Ok(ObjectValue::Bool(b));
        }
        if let Some(bytes) = &data.bytes {
            let decoded = STANDARD
                .decode(bytes)
                .map_err(|e| Error::Serialization(format!("invalid base64 bytes: {e}")))?;
            return Ok(ObjectValue::Bytes(decoded));
        }
        if let Some(n) = data.number {
            return Ok(ObjectValue::Number(n));
        }
        if let Some(s) = &data.string {
            return Ok(ObjectValue::String(s.clone()));
        }
        if let Some(text) = &data.json {
            let json = serde_json::from_str(text)
                .map_err(|e| Error::Serialization(format!("invalid json value: {e}")))?;
            return Ok(ObjectValue::Json(json));
        }
        match &data.object_id {
            Some(id) if !id.is_empty() => Ok(ObjectValue::Reference(id.clone())),
            _ => Err(Error::Serialization("object data has no value".into())),
        }
    }

    pub fn to_wire(&self) -> ObjectData {
        let mut data = ObjectData::default();
        match self {
            ObjectValue::String(s) => data.string = Some(s.clone()),
            ObjectValue::Number(n) => data.number = Some(*n),
            ObjectValue::Bool(b) => data.boolean = Some(*b),
            ObjectValue::Bytes(bytes) => data.bytes = Some(STANDARD.encode(bytes)),
            ObjectValue::Json(json) => data.json = Some(json.to_string()),
            ObjectValue::Reference(id) => data.object_id = Some(id.clone()),
        }
        data
    }

    pub fn as_reference(&self) -> Option<&str> {
        match self {
            ObjectValue::Reference(id) => Some(id),
            _ => None,
        }
    }

    /// Reject values that cannot be published.
    pub fn validate(&self) -> Result<()> {
        match self {
            ObjectValue::Number(n) if !n.is_finite() => Err(Error::Serialization(format!(
                "number values must be finite, got {n}"
            ))),
            ObjectValue::Reference(id) => ObjectKind::from_object_id(id).map(|_| ()),
            _ => Ok(()),
        }
    }
}

impl From<&str> for ObjectValue {
    fn from(s: &str) -> Self {
        ObjectValue::String(s.to_string())
    }
}

impl From<String> for ObjectValue {
    fn from(s: String) -> Self {
        ObjectValue::String(s)
    }
}

impl From<f64> for ObjectValue {
    fn from(n: f64) -> Self {
        ObjectValue::Number(n)
    }
}

impl From<bool> for ObjectValue {
    fn from(b: bool) -> Self {
        ObjectValue::Bool(b)
    }
}

impl From<Vec<u8>> for ObjectValue {
    fn from(bytes: Vec<u8>) -> Self {
        ObjectValue::Bytes(bytes)
    }
}

impl From<serde_json::Value> for ObjectValue {
    fn from(json: serde_json::Value) -> Self {
        ObjectValue::Json(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_from_object_id() {
        assert_eq!(ObjectKind::from_object_id("root").unwrap(), ObjectKind::Map);
        assert_eq!(
            ObjectKind::from_object_id("map:abc@1").unwrap(),
            ObjectKind::Map
        );
        assert_eq!(
            ObjectKind::from_object_id("counter:abc@1").unwrap(),
            ObjectKind::Counter
        );
        assert!(matches!(
            ObjectKind::from_object_id("list:abc@1"),
            Err(Error::InvalidObjectId(_))
        ));
        assert!(ObjectKind::from_object_id("map:").is_err());
        assert!(ObjectKind::from_object_id("garbage").is_err());
    }

    #[test]
    fn object_id_format() {
        let id = generate_object_id(ObjectKind::Counter, r#"{"counter":{"count":1}}"#, "n1", 42);
        assert!(id.starts_with("counter:"));
        assert!(id.ends_with("@42"));
        let hash = &id["counter:".len()..id.len() - "@42".len()];
        assert_eq!(hash.len(), 43);
        assert!(!hash.contains('+') && !hash.contains('/') && !hash.contains('='));
        assert_eq!(ObjectKind::from_object_id(&id).unwrap(), ObjectKind::Counter);
    }

    #[test]
    fn object_id_depends_on_nonce() {
        let a = generate_object_id(ObjectKind::Map, "{}", "a", 1);
        let b = generate_object_id(ObjectKind::Map, "{}", "b", 1);
        assert_ne!(a, b);
        assert_eq!(a, generate_object_id(ObjectKind::Map, "{}", "a", 1));
    }

    #[test]
    fn wire_value_priority() {
        let data = ObjectData {
            number: Some(3.0),
            string: Some("three".into()),
            ..Default::default()
        };
        assert_eq!(ObjectValue::from_wire(&data).unwrap(), ObjectValue::Number(3.0));

        let data = ObjectData {
            object_id: Some("map:x@1".into()),
            ..Default::default()
        };
        assert_eq!(
            ObjectValue::from_wire(&data).unwrap(),
            ObjectValue::Reference("map:x@1".into())
        );
    }

    #[test]
    fn wire_bytes_and_json() {
        let value = ObjectValue::Bytes(vec![1, 2, 3]);
        let data = value.to_wire();
        assert_eq!(data.bytes.as_deref(), Some("AQID"));
        assert_eq!(ObjectValue::from_wire(&data).unwrap(), value);

        let value = ObjectValue::Json(json!({"a": [1, 2]}));
        let data = value.to_wire();
        assert_eq!(data.json.as_deref(), Some(r#"{"a":[1,2]}"#));
        assert_eq!(ObjectValue::from_wire(&data).unwrap(), value);
    }

    #[test]
    fn empty_wire_data_is_rejected() {
        assert!(matches!(
            ObjectValue::from_wire(&ObjectData::default()),
            Err(Error::Serialization(_))
        ));
        let data = ObjectData {
            object_id: Some(String::new()),
            ..Default::default()
        };
        assert!(ObjectValue::from_wire(&data).is_err());
        let data = ObjectData {
            bytes: Some("!!".into()),
            ..Default::default()
        };
        assert!(matches!(
            ObjectValue::from_wire(&data),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn validate_values() {
        assert!(ObjectValue::Number(1.5).validate().is_ok());
        assert!(ObjectValue::Number(f64::NAN).validate().is_err());
        assert!(ObjectValue::Reference("counter:a@1".into()).validate().is_ok());
        assert!(ObjectValue::Reference("nope".into()).validate().is_err());
    }
}
