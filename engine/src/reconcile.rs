//! Optimistic local operations awaiting server confirmation.
//!
//! A local write is recorded here as soon as it is issued. Until the server
//! echoes the same message id back, reads overlay the pending operations on
//! the confirmed state. The echo itself is applied like any remote operation,
//! so the confirmed state never contains unconfirmed writes.
//!
//! # Lifecycle
//!
//! 1. `Queued` - issued while not synced, not yet handed to the channel
//! 2. `Published` - handed to the channel, waiting for the echo
//! 3. `Failed` - the publish was rejected or the channel detached; the overlay
//!    stays until the next completed sync replaces local state

use crate::operation::Operation;
use crate::wire::{ObjectOperation, OutboundObjectMessage};
use crate::{MessageId, ObjectId, ObjectValue, Timestamp};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Queued,
    Published,
    Failed,
}

/// A local operation not yet confirmed by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOp {
    pub message_id: MessageId,
    pub object_id: ObjectId,
    pub operation: Operation,
    /// The operation as it goes out on the wire
    pub wire: ObjectOperation,
    /// When the operation was issued locally
    pub applied_at: Timestamp,
    pub state: PendingState,
}

impl PendingOp {
    pub fn outbound(&self) -> OutboundObjectMessage {
        OutboundObjectMessage {
            id: self.message_id.clone(),
            operation: self.wire.clone(),
        }
    }
}

/// Pending operations in issue order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingLedger {
    ops: Vec<PendingOp>,
}

impl PendingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn record(&mut self, op: PendingOp) {
        self.ops.push(op);
    }

    pub fn get(&self, message_id: &str) -> Option<&PendingOp> {
        self.ops.iter().find(|op| op.message_id == message_id)
    }

    /// Remove the operation echoed back by the server.
    pub fn confirm(&mut self, message_id: &str) -> Option<PendingOp> {
        let index = self.ops.iter().position(|op| op.message_id == message_id)?;
        Some(self.ops.remove(index))
    }

    pub fn mark_failed(&mut self, message_ids: &[MessageId]) {
        for op in self.ops.iter_mut() {
            if message_ids.contains(&op.message_id) {
                op.state = PendingState::Failed;
            }
        }
    }

    /// Move queued operations to `Published` and return them for sending.
    pub fn take_queued(&mut self) -> Vec<OutboundObjectMessage> {
        self.ops
            .iter_mut()
            .filter(|op| op.state == PendingState::Queued)
            .map(|op| {
                op.state = PendingState::Published;
                op.outbound()
            })
            .collect()
    }

    /// Fail every operation still in flight. Returns their message ids.
    pub fn fail_outstanding(&mut self) -> Vec<MessageId> {
        self.ops
            .iter_mut()
            .filter(|op| op.state != PendingState::Failed)
            .map(|op| {
                op.state = PendingState::Failed;
                op.message_id.clone()
            })
            .collect()
    }

    /// Forget failed operations. Returns their message ids.
    pub fn drop_failed(&mut self) -> Vec<MessageId> {
        let mut dropped = Vec::new();
        self.ops.retain(|op| {
            if op.state == PendingState::Failed {
                dropped.push(op.message_id.clone());
                false
            } else {
                true
            }
        });
        dropped
    }

    pub fn for_object<'a>(&'a self, object_id: &'a str) -> impl Iterator<Item = &'a PendingOp> + 'a {
        self.ops.iter().filter(move |op| op.object_id == object_id)
    }

    /// Whether an object was created locally and its creation is not yet
    /// confirmed or abandoned.
    pub fn has_pending_create(&self, object_id: &str) -> bool {
        self.for_object(object_id)
            .any(|op| op.operation.is_create() && op.state != PendingState::Failed)
    }

    /// Apply pending writes for `key` on top of its confirmed value.
    pub fn overlay_map_key(
        &self,
        object_id: &str,
        key: &str,
        confirmed: Option<ObjectValue>,
    ) -> Option<ObjectValue> {
        self.for_object(object_id)
            .fold(confirmed, |current, op| match &op.operation {
                Operation::MapSet { key: k, value } if k == key => Some(value.clone()),
                Operation::MapRemove { key: k } if k == key => None,
                _ => current,
            })
    }

    /// Apply pending writes on top of a confirmed key/value snapshot.
    pub fn overlay_map(&self, object_id: &str, entries: &mut BTreeMap<String, ObjectValue>) {
        for op in self.for_object(object_id) {
            match &op.operation {
                Operation::MapSet { key, value } => {
                    entries.insert(key.clone(), value.clone());
                }
                Operation::MapRemove { key } => {
                    entries.remove(key);
                }
                _ => {}
            }
        }
    }

    /// Confirmed value plus pending increments.
    pub fn overlay_counter(&self, object_id: &str, confirmed: f64) -> f64 {
        self.for_object(object_id)
            .fold(confirmed, |value, op| match op.operation {
                Operation::CounterInc { amount } => value + amount,
                _ => value,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: &str, object_id: &str, operation: Operation, state: PendingState) -> PendingOp {
        let wire = match &operation {
            Operation::MapSet { key, value } => ObjectOperation::map_set(object_id, key.clone(), value),
            Operation::MapRemove { key } => ObjectOperation::map_remove(object_id, key.clone()),
            Operation::CounterInc { amount } => ObjectOperation::counter_inc(object_id, *amount),
            _ => ObjectOperation::object_delete(object_id),
        };
        PendingOp {
            message_id: id.into(),
            object_id: object_id.into(),
            operation,
            wire,
            applied_at: 0,
            state,
        }
    }

    fn set(key: &str, value: &str) -> Operation {
        Operation::MapSet {
            key: key.into(),
            value: ObjectValue::from(value),
        }
    }

    #[test]
    fn overlay_applies_in_issue_order() {
        let mut ledger = PendingLedger::new();
        ledger.record(pending("m1", "root", set("k", "a"), PendingState::Published));
        ledger.record(pending("m2", "root", set("k", "b"), PendingState::Published));
        assert_eq!(
            ledger.overlay_map_key("root", "k", None),
            Some(ObjectValue::from("b"))
        );

        ledger.record(pending(
            "m3",
            "root",
            Operation::MapRemove { key: "k".into() },
            PendingState::Published,
        ));
        assert_eq!(
            ledger.overlay_map_key("root", "k", Some(ObjectValue::from("z"))),
            None
        );
        assert_eq!(
            ledger.overlay_map_key("root", "other", Some(ObjectValue::from("z"))),
            Some(ObjectValue::from("z"))
        );
    }

    #[test]
    fn overlay_map_snapshot() {
        let mut ledger = PendingLedger::new();
        ledger.record(pending("m1", "root", set("new", "v"), PendingState::Queued));
        ledger.record(pending(
            "m2",
            "root",
            Operation::MapRemove { key: "old".into() },
            PendingState::Queued,
        ));

        let mut entries = BTreeMap::new();
        entries.insert("old".to_string(), ObjectValue::Bool(true));
        ledger.overlay_map("root", &mut entries);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["new"], ObjectValue::from("v"));
    }

    #[test]
    fn counter_overlay_sums_pending() {
        let mut ledger = PendingLedger::new();
        let id = "counter:a@1";
        ledger.record(pending("m1", id, Operation::CounterInc { amount: 2.0 }, PendingState::Published));
        ledger.record(pending("m2", id, Operation::CounterInc { amount: 3.0 }, PendingState::Failed));
        assert_eq!(ledger.overlay_counter(id, 10.0), 15.0);
        assert_eq!(ledger.overlay_counter("counter:other@1", 1.0), 1.0);
    }

    #[test]
    fn confirm_removes_operation() {
        let mut ledger = PendingLedger::new();
        ledger.record(pending("m1", "root", set("k", "a"), PendingState::Published));
        assert!(ledger.confirm("m1").is_some());
        assert!(ledger.confirm("m1").is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn queued_operations_are_taken_once() {
        let mut ledger = PendingLedger::new();
        ledger.record(pending("m1", "root", set("k", "a"), PendingState::Queued));
        ledger.record(pending("m2", "root", set("k", "b"), PendingState::Published));

        let outbound = ledger.take_queued();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].id, "m1");
        assert!(ledger.take_queued().is_empty());
        assert_eq!(ledger.get("m1").unwrap().state, PendingState::Published);
    }

    #[test]
    fn failure_lifecycle() {
        let mut ledger = PendingLedger::new();
        ledger.record(pending("m1", "root", set("k", "a"), PendingState::Published));
        ledger.record(pending("m2", "root", set("j", "b"), PendingState::Queued));
        ledger.record(pending("m3", "root", set("i", "c"), PendingState::Published));

        ledger.mark_failed(&["m1".to_string()]);
        assert_eq!(ledger.get("m1").unwrap().state, PendingState::Failed);

        let failed = ledger.fail_outstanding();
        assert_eq!(failed, vec!["m2".to_string(), "m3".to_string()]);

        let dropped = ledger.drop_failed();
        assert_eq!(dropped.len(), 3);
        assert!(ledger.is_empty());
    }
}
