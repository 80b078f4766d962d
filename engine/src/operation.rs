//! Decoded operations.
//!
//! Wire operations are loose; an [`Operation`] is the closed, validated form
//! the objects apply. Anything this client does not understand decodes to
//! [`Operation::Unknown`] and is skipped by the pool.

use crate::value::{ObjectKind, ObjectValue};
use crate::wire::{ObjectMessage, ObjectOperation, OperationAction, WireEnum, WireMapEntry};
use crate::{Error, MessageId, ObjectId, Result, SiteCode, Timeserial, Timestamp};
use std::collections::BTreeMap;

/// A validated operation on a single object.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    MapCreate {
        entries: BTreeMap<String, WireMapEntry>,
    },
    MapSet {
        key: String,
        value: ObjectValue,
    },
    MapRemove {
        key: String,
    },
    CounterCreate {
        count: f64,
    },
    CounterInc {
        amount: f64,
    },
    ObjectDelete,
    /// An action introduced after this client was built
    Unknown(u64),
}

impl Operation {
    /// Decode and validate a wire operation.
    pub fn decode(op: &ObjectOperation) -> Result<Self> {
        let action = match op.action {
            WireEnum::Known(action) => action,
            WireEnum::Unknown(raw) => return Ok(Operation::Unknown(raw)),
        };

        let decoded = match action {
            OperationAction::MapCreate => Operation::MapCreate {
                entries: op
                    .map
                    .as_ref()
                    .and_then(|m| m.entries.clone())
                    .unwrap_or_default(),
            },
            OperationAction::MapSet => {
                let map_op = op
                    .map_op
                    .as_ref()
                    .ok_or_else(|| Error::Serialization("MAP_SET without mapOp".into()))?;
                let data = map_op
                    .data
                    .as_ref()
                    .ok_or_else(|| Error::Serialization("MAP_SET without data".into()))?;
                Operation::MapSet {
                    key: map_op.key.clone(),
                    value: ObjectValue::from_wire(data)?,
                }
            }
            OperationAction::MapRemove => {
                let map_op = op
                    .map_op
                    .as_ref()
                    .ok_or_else(|| Error::Serialization("MAP_REMOVE without mapOp".into()))?;
                Operation::MapRemove {
                    key: map_op.key.clone(),
                }
            }
            OperationAction::CounterCreate => Operation::CounterCreate {
                count: op.counter.as_ref().and_then(|c| c.count).unwrap_or(0.0),
            },
            OperationAction::CounterInc => {
                let counter_op = op
                    .counter_op
                    .as_ref()
                    .ok_or_else(|| Error::Serialization("COUNTER_INC without counterOp".into()))?;
                if !counter_op.amount.is_finite() {
                    return Err(Error::InvalidCounterAmount(counter_op.amount));
                }
                Operation::CounterInc {
                    amount: counter_op.amount,
                }
            }
            OperationAction::ObjectDelete => Operation::ObjectDelete,
        };

        if let Some(expected) = decoded.target_kind() {
            if ObjectKind::from_object_id(&op.object_id)? != expected {
                return Err(Error::WrongObjectKind {
                    object_id: op.object_id.clone(),
                    expected,
                });
            }
        }
        Ok(decoded)
    }

    /// The kind of object this operation can be applied to, if restricted.
    pub fn target_kind(&self) -> Option<ObjectKind> {
        match self {
            Operation::MapCreate { .. } | Operation::MapSet { .. } | Operation::MapRemove { .. } => {
                Some(ObjectKind::Map)
            }
            Operation::CounterCreate { .. } | Operation::CounterInc { .. } => {
                Some(ObjectKind::Counter)
            }
            Operation::ObjectDelete | Operation::Unknown(_) => None,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(
            self,
            Operation::MapCreate { .. } | Operation::CounterCreate { .. }
        )
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::MapCreate { .. } => "MAP_CREATE",
            Operation::MapSet { .. } => "MAP_SET",
            Operation::MapRemove { .. } => "MAP_REMOVE",
            Operation::CounterCreate { .. } => "COUNTER_CREATE",
            Operation::CounterInc { .. } => "COUNTER_INC",
            Operation::ObjectDelete => "OBJECT_DELETE",
            Operation::Unknown(_) => "UNKNOWN",
        }
    }
}

/// An operation received from the channel, with its ordering metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundOperation {
    /// Id of the carrying message; matches the id of a local publish on echo
    pub message_id: Option<MessageId>,
    pub object_id: ObjectId,
    pub operation: Operation,
    pub serial: Timeserial,
    pub site_code: SiteCode,
    pub serial_timestamp: Option<Timestamp>,
}

impl InboundOperation {
    /// Time at which a tombstone created by this operation started aging.
    pub fn tombstoned_at(&self, now: Timestamp) -> Timestamp {
        self.serial_timestamp.unwrap_or(now)
    }
}

impl TryFrom<ObjectMessage> for InboundOperation {
    type Error = Error;

    fn try_from(message: ObjectMessage) -> Result<Self> {
        let op = message
            .operation
            .ok_or_else(|| Error::Serialization("object message carries no operation".into()))?;
        let serial = Timeserial::from_wire(message.serial.as_deref())
            .ok_or_else(|| Error::Serialization("operation without serial".into()))?;
        let site_code = match message.site_code {
            Some(site) if !site.is_empty() => site,
            _ => return Err(Error::Serialization("operation without siteCode".into())),
        };
        let operation = Operation::decode(&op)?;

        Ok(Self {
            message_id: message.id,
            object_id: op.object_id,
            operation,
            serial,
            site_code,
            serial_timestamp: message.serial_timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{CounterOp, MapOp};

    fn message(op: ObjectOperation) -> ObjectMessage {
        ObjectMessage::operation(op, "01", "site1")
    }

    #[test]
    fn decode_map_set() {
        let op = ObjectOperation::map_set("root", "k", &ObjectValue::from("v"));
        let inbound = InboundOperation::try_from(message(op).with_id("m1")).unwrap();
        assert_eq!(inbound.object_id, "root");
        assert_eq!(inbound.serial, Timeserial::new("01"));
        assert_eq!(inbound.site_code, "site1");
        assert_eq!(inbound.message_id.as_deref(), Some("m1"));
        assert_eq!(
            inbound.operation,
            Operation::MapSet {
                key: "k".into(),
                value: ObjectValue::from("v")
            }
        );
    }

    #[test]
    fn missing_serial_or_site_is_rejected() {
        let op = ObjectOperation::counter_inc("counter:a@1", 1.0);
        let mut msg = message(op.clone());
        msg.serial = None;
        assert!(matches!(
            InboundOperation::try_from(msg),
            Err(Error::Serialization(_))
        ));

        let mut msg = message(op.clone());
        msg.serial = Some(String::new());
        assert!(InboundOperation::try_from(msg).is_err());

        let mut msg = message(op);
        msg.site_code = None;
        assert!(matches!(
            InboundOperation::try_from(msg),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn payload_must_match_action() {
        let mut op = ObjectOperation::map_set("root", "k", &ObjectValue::Bool(true));
        op.map_op = Some(MapOp {
            key: "k".into(),
            data: None,
        });
        assert!(matches!(Operation::decode(&op), Err(Error::Serialization(_))));

        let mut op = ObjectOperation::counter_inc("counter:a@1", 1.0);
        op.counter_op = None;
        assert!(matches!(Operation::decode(&op), Err(Error::Serialization(_))));
    }

    #[test]
    fn action_must_match_object_kind() {
        let op = ObjectOperation::counter_inc("root", 1.0);
        assert!(matches!(
            Operation::decode(&op),
            Err(Error::WrongObjectKind {
                expected: ObjectKind::Counter,
                ..
            })
        ));

        let op = ObjectOperation::map_remove("bogus", "k");
        assert!(matches!(
            Operation::decode(&op),
            Err(Error::InvalidObjectId(_))
        ));
    }

    #[test]
    fn non_finite_increment_is_rejected() {
        let mut op = ObjectOperation::counter_inc("counter:a@1", 1.0);
        op.counter_op = Some(CounterOp {
            amount: f64::INFINITY,
        });
        assert_eq!(
            Operation::decode(&op),
            Err(Error::InvalidCounterAmount(f64::INFINITY))
        );
    }

    #[test]
    fn unknown_action_decodes_to_passthrough() {
        let mut op = ObjectOperation::object_delete("anything");
        op.action = WireEnum::Unknown(42);
        assert_eq!(Operation::decode(&op).unwrap(), Operation::Unknown(42));
    }

    #[test]
    fn delete_applies_to_any_kind() {
        let op = ObjectOperation::object_delete("counter:a@1");
        assert_eq!(Operation::decode(&op).unwrap(), Operation::ObjectDelete);
        assert!(Operation::decode(&op).unwrap().target_kind().is_none());
    }
}
