//! Assembly of a multi-message sync sequence.
//!
//! A full-state sync may be split across many wire messages. States are
//! accumulated here, keyed by object id, together with any incremental
//! operations that arrive before the final message. Nothing touches the pool
//! until the sequence is complete.

use crate::operation::InboundOperation;
use crate::wire::ObjectState;
use crate::{ObjectId, Timestamp};
use std::collections::BTreeMap;

/// One object's state as received in a sync, with the server timestamp of the
/// message that carried it.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedObject {
    pub state: ObjectState,
    /// Ages a synced tombstone from the server's time rather than receipt time
    pub serial_timestamp: Option<Timestamp>,
}

impl From<ObjectState> for SyncedObject {
    fn from(state: ObjectState) -> Self {
        Self {
            state,
            serial_timestamp: None,
        }
    }
}

/// A sync sequence in progress.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncSequence {
    sequence_id: Option<String>,
    /// BTreeMap for deterministic application order
    objects: BTreeMap<ObjectId, SyncedObject>,
    buffered: Vec<InboundOperation>,
}

impl SyncSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequence_id(&self) -> Option<&str> {
        self.sequence_id.as_deref()
    }

    /// Continue with the sequence `sequence_id`.
    ///
    /// If a different sequence was in progress, its states and buffered
    /// operations are discarded and `false` is returned.
    pub fn begin(&mut self, sequence_id: &str) -> bool {
        match &self.sequence_id {
            Some(current) if current != sequence_id => {
                *self = Self {
                    sequence_id: Some(sequence_id.to_string()),
                    ..Self::default()
                };
                false
            }
            Some(_) => true,
            None => {
                self.sequence_id = Some(sequence_id.to_string());
                true
            }
        }
    }

    /// Add one object's state. A map split across messages has its entries
    /// merged; otherwise the later state replaces the earlier one.
    pub fn add_object(&mut self, state: ObjectState, serial_timestamp: Option<Timestamp>) {
        match self.objects.get_mut(&state.object_id) {
            Some(existing) => {
                if !state.tombstone {
                    let more = state.map.as_ref().and_then(|m| m.entries.as_ref());
                    let entries = existing.state.map.as_mut().and_then(|m| m.entries.as_mut());
                    if let (Some(entries), Some(more)) = (entries, more) {
                        entries.extend(more.clone());
                        existing.serial_timestamp = serial_timestamp.or(existing.serial_timestamp);
                        return;
                    }
                }
                *existing = SyncedObject {
                    state,
                    serial_timestamp,
                };
            }
            None => {
                self.objects.insert(
                    state.object_id.clone(),
                    SyncedObject {
                        state,
                        serial_timestamp,
                    },
                );
            }
        }
    }

    pub fn buffer(&mut self, op: InboundOperation) {
        self.buffered.push(op);
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered.len()
    }

    /// Consume the sequence: the received states and the operations buffered
    /// in receipt order.
    pub fn finish(self) -> (Vec<SyncedObject>, Vec<InboundOperation>) {
        (self.objects.into_values().collect(), self.buffered)
    }
}
