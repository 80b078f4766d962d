//! Wire shapes for object messages.
//!
//! These types mirror the JSON carried inside the transport envelope. They are
//! deliberately loose (mostly optional fields) so that decoding never fails on
//! shape alone; semantic validation happens when a message is converted into an
//! [`InboundOperation`](crate::InboundOperation) or applied from a sync.
//!
//! Enum-valued fields use [`WireEnum`], which keeps unrecognized numeric values
//! instead of rejecting the message.

use crate::value::{generate_object_id, ObjectKind, ObjectValue};
use crate::{Error, MessageId, ObjectId, Result, SiteCode, Timestamp};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// A numeric wire enum that has a known set of values.
pub trait WireCode: Sized + Copy {
    fn from_code(code: u64) -> Option<Self>;
    fn code(self) -> u64;
}

/// A wire enum value that may be unknown to this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireEnum<T> {
    Known(T),
    Unknown(u64),
}

impl<T: WireCode> WireEnum<T> {
    pub fn known(&self) -> Option<T> {
        match self {
            WireEnum::Known(value) => Some(*value),
            WireEnum::Unknown(_) => None,
        }
    }

    /// The numeric value as carried on the wire.
    pub fn raw(&self) -> u64 {
        match self {
            WireEnum::Known(value) => value.code(),
            WireEnum::Unknown(raw) => *raw,
        }
    }
}

impl<T: WireCode> From<T> for WireEnum<T> {
    fn from(value: T) -> Self {
        WireEnum::Known(value)
    }
}

impl<T: WireCode> Serialize for WireEnum<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.raw())
    }
}

impl<'de, T: WireCode> Deserialize<'de> for WireEnum<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code = u64::deserialize(deserializer)?;
        Ok(match T::from_code(code) {
            Some(value) => WireEnum::Known(value),
            None => WireEnum::Unknown(code),
        })
    }
}

/// `ObjectOperation.action`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationAction {
    MapCreate,
    MapSet,
    MapRemove,
    CounterCreate,
    CounterInc,
    ObjectDelete,
}

impl WireCode for OperationAction {
    fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => OperationAction::MapCreate,
            1 => OperationAction::MapSet,
            2 => OperationAction::MapRemove,
            3 => OperationAction::CounterCreate,
            4 => OperationAction::CounterInc,
            5 => OperationAction::ObjectDelete,
            _ => return None,
        })
    }

    fn code(self) -> u64 {
        match self {
            OperationAction::MapCreate => 0,
            OperationAction::MapSet => 1,
            OperationAction::MapRemove => 2,
            OperationAction::CounterCreate => 3,
            OperationAction::CounterInc => 4,
            OperationAction::ObjectDelete => 5,
        }
    }
}

/// `ObjectsMap.semantics`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapSemantics {
    Lww,
}

impl WireCode for MapSemantics {
    fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(MapSemantics::Lww),
            _ => None,
        }
    }

    fn code(self) -> u64 {
        0
    }
}

/// A value as encoded on the wire. Exactly one field is expected to be set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boolean: Option<bool>,
    /// Base64 encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string: Option<String>,
    /// JSON encoded as text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapOp {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ObjectData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterOp {
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMapEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstone: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeserial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ObjectData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_timestamp: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMap {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantics: Option<WireEnum<MapSemantics>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<BTreeMap<String, WireMapEntry>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCounter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectOperation {
    pub action: WireEnum<OperationAction>,
    pub object_id: ObjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_op: Option<MapOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter_op: Option<CounterOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<WireMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter: Option<WireCounter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_value: Option<String>,
}

/// The create payload hashed into a new object's id.
#[derive(Serialize)]
struct InitialValue<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    map: Option<&'a WireMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    counter: Option<&'a WireCounter>,
}

impl ObjectOperation {
    fn bare(action: OperationAction, object_id: impl Into<ObjectId>) -> Self {
        Self {
            action: action.into(),
            object_id: object_id.into(),
            map_op: None,
            counter_op: None,
            map: None,
            counter: None,
            nonce: None,
            initial_value: None,
        }
    }

    pub fn map_set(object_id: impl Into<ObjectId>, key: impl Into<String>, value: &ObjectValue) -> Self {
        let mut op = Self::bare(OperationAction::MapSet, object_id);
        op.map_op = Some(MapOp {
            key: key.into(),
            data: Some(value.to_wire()),
        });
        op
    }

    pub fn map_remove(object_id: impl Into<ObjectId>, key: impl Into<String>) -> Self {
        let mut op = Self::bare(OperationAction::MapRemove, object_id);
        op.map_op = Some(MapOp {
            key: key.into(),
            data: None,
        });
        op
    }

    pub fn counter_inc(object_id: impl Into<ObjectId>, amount: f64) -> Self {
        let mut op = Self::bare(OperationAction::CounterInc, object_id);
        op.counter_op = Some(CounterOp { amount });
        op
    }

    pub fn object_delete(object_id: impl Into<ObjectId>) -> Self {
        Self::bare(OperationAction::ObjectDelete, object_id)
    }

    /// A MAP_CREATE whose object id is derived from its initial entries.
    pub fn map_create(
        entries: &BTreeMap<String, ObjectValue>,
        nonce: &str,
        server_time: Timestamp,
    ) -> Result<Self> {
        let map = WireMap {
            semantics: Some(MapSemantics::Lww.into()),
            entries: Some(
                entries
                    .iter()
                    .map(|(key, value)| {
                        let entry = WireMapEntry {
                            tombstone: Some(false),
                            data: Some(value.to_wire()),
                            ..Default::default()
                        };
                        (key.clone(), entry)
                    })
                    .collect(),
            ),
        };
        let initial_value = encode_initial_value(InitialValue {
            map: Some(&map),
            counter: None,
        })?;
        let object_id = generate_object_id(ObjectKind::Map, &initial_value, nonce, server_time);

        let mut op = Self::bare(OperationAction::MapCreate, object_id);
        op.map = Some(map);
        op.nonce = Some(nonce.to_string());
        op.initial_value = Some(initial_value);
        Ok(op)
    }

    /// A COUNTER_CREATE whose object id is derived from its initial count.
    pub fn counter_create(count: f64, nonce: &str, server_time: Timestamp) -> Result<Self> {
        let counter = WireCounter { count: Some(count) };
        let initial_value = encode_initial_value(InitialValue {
            map: None,
            counter: Some(&counter),
        })?;
        let object_id =
            generate_object_id(ObjectKind::Counter, &initial_value, nonce, server_time);

        let mut op = Self::bare(OperationAction::CounterCreate, object_id);
        op.counter = Some(counter);
        op.nonce = Some(nonce.to_string());
        op.initial_value = Some(initial_value);
        Ok(op)
    }
}

fn encode_initial_value(value: InitialValue<'_>) -> Result<String> {
    serde_json::to_string(&value).map_err(|e| Error::Serialization(e.to_string()))
}

/// Full state of one object, as carried by a sync message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectState {
    pub object_id: ObjectId,
    /// Latest serial per site already folded into this state
    #[serde(default)]
    pub site_timeserials: BTreeMap<SiteCode, String>,
    #[serde(default)]
    pub tombstone: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_op: Option<ObjectOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<WireMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter: Option<WireCounter>,
}

impl ObjectState {
    pub fn empty_map(object_id: impl Into<ObjectId>) -> Self {
        Self {
            object_id: object_id.into(),
            site_timeserials: BTreeMap::new(),
            tombstone: false,
            create_op: None,
            map: Some(WireMap::default()),
            counter: None,
        }
    }

    pub fn counter(object_id: impl Into<ObjectId>, count: f64) -> Self {
        Self {
            object_id: object_id.into(),
            site_timeserials: BTreeMap::new(),
            tombstone: false,
            create_op: None,
            map: None,
            counter: Some(WireCounter { count: Some(count) }),
        }
    }
}

/// An inbound object message: either an operation or a piece of sync state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<ObjectOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_code: Option<SiteCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_timestamp: Option<Timestamp>,
}

impl ObjectMessage {
    pub fn operation(
        operation: ObjectOperation,
        serial: impl Into<String>,
        site_code: impl Into<SiteCode>,
    ) -> Self {
        Self {
            operation: Some(operation),
            serial: Some(serial.into()),
            site_code: Some(site_code.into()),
            ..Default::default()
        }
    }

    pub fn sync_state(object: ObjectState) -> Self {
        Self {
            object: Some(object),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_serial_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.serial_timestamp = Some(timestamp);
        self
    }
}

/// A locally originated operation ready to publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundObjectMessage {
    pub id: MessageId,
    pub operation: ObjectOperation,
}

/// Position within a multi-message sync sequence.
///
/// Parsed from the channel serial of a sync message: `<sequenceId>:<cursor>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCursor {
    pub sequence_id: String,
    pub cursor: String,
}

impl SyncCursor {
    pub fn parse(channel_serial: &str) -> Result<Self> {
        let (sequence_id, cursor) = channel_serial
            .split_once(':')
            .ok_or_else(|| Error::InvalidSyncCursor(channel_serial.to_string()))?;
        Ok(Self {
            sequence_id: sequence_id.to_string(),
            cursor: cursor.to_string(),
        })
    }

    /// An empty cursor marks the final message of the sequence.
    pub fn is_last(&self) -> bool {
        self.cursor.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_action_is_preserved() {
        let op: ObjectOperation =
            serde_json::from_value(json!({"action": 99, "objectId": "root"})).unwrap();
        assert_eq!(op.action, WireEnum::Unknown(99));
        assert_eq!(op.action.known(), None);

        let encoded = serde_json::to_value(&op).unwrap();
        assert_eq!(encoded["action"], json!(99));
    }

    #[test]
    fn known_actions_decode() {
        for (code, action) in [
            (0, OperationAction::MapCreate),
            (1, OperationAction::MapSet),
            (2, OperationAction::MapRemove),
            (3, OperationAction::CounterCreate),
            (4, OperationAction::CounterInc),
            (5, OperationAction::ObjectDelete),
        ] {
            let decoded: WireEnum<OperationAction> = serde_json::from_value(json!(code)).unwrap();
            assert_eq!(decoded, WireEnum::Known(action));
            assert_eq!(decoded.raw(), code);
        }
    }

    #[test]
    fn object_message_field_names() {
        let msg = ObjectMessage::operation(
            ObjectOperation::map_set("root", "x", &ObjectValue::Number(1.0)),
            "01",
            "site1",
        )
        .with_id("m1")
        .with_serial_timestamp(5);

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "m1",
                "operation": {
                    "action": 1,
                    "objectId": "root",
                    "mapOp": {"key": "x", "data": {"number": 1.0}}
                },
                "serial": "01",
                "siteCode": "site1",
                "serialTimestamp": 5
            })
        );
    }

    #[test]
    fn decode_sync_state() {
        let msg: ObjectMessage = serde_json::from_value(json!({
            "object": {
                "objectId": "root",
                "siteTimeserials": {"site1": "05"},
                "map": {
                    "semantics": 0,
                    "entries": {
                        "a": {"timeserial": "03", "data": {"string": "x"}},
                        "b": {"tombstone": true, "timeserial": "04"}
                    }
                }
            }
        }))
        .unwrap();

        let state = msg.object.unwrap();
        assert!(!state.tombstone);
        assert_eq!(state.site_timeserials["site1"], "05");
        let map = state.map.unwrap();
        assert_eq!(map.semantics, Some(WireEnum::Known(MapSemantics::Lww)));
        let entries = map.entries.unwrap();
        assert_eq!(entries["b"].tombstone, Some(true));
        assert_eq!(entries["a"].data.as_ref().unwrap().string.as_deref(), Some("x"));
    }

    #[test]
    fn create_ops_carry_initial_value() {
        let op = ObjectOperation::counter_create(5.0, "nonce", 1_000).unwrap();
        assert_eq!(op.action, WireEnum::Known(OperationAction::CounterCreate));
        assert_eq!(op.initial_value.as_deref(), Some(r#"{"counter":{"count":5.0}}"#));
        assert!(op.object_id.starts_with("counter:"));
        assert!(op.object_id.ends_with("@1000"));

        let mut entries = BTreeMap::new();
        entries.insert("k".to_string(), ObjectValue::Bool(true));
        let op = ObjectOperation::map_create(&entries, "nonce", 1_000).unwrap();
        assert!(op.object_id.starts_with("map:"));
        let initial: serde_json::Value =
            serde_json::from_str(op.initial_value.as_deref().unwrap()).unwrap();
        assert_eq!(
            initial,
            json!({"map": {"semantics": 0, "entries": {"k": {"tombstone": false, "data": {"boolean": true}}}}})
        );
    }

    #[test]
    fn sync_cursor_parsing() {
        let cursor = SyncCursor::parse("seq1:abc").unwrap();
        assert_eq!(cursor.sequence_id, "seq1");
        assert_eq!(cursor.cursor, "abc");
        assert!(!cursor.is_last());

        let cursor = SyncCursor::parse("seq1:").unwrap();
        assert!(cursor.is_last());

        let cursor = SyncCursor::parse(":").unwrap();
        assert_eq!(cursor.sequence_id, "");
        assert!(cursor.is_last());

        assert!(matches!(
            SyncCursor::parse("seq1"),
            Err(Error::InvalidSyncCursor(_))
        ));
    }
}
