//! The synchronization coordinator.
//!
//! Owns the pool and drives it through `Idle -> Syncing -> Synced`:
//!
//! - `Idle`: not attached. Incoming operations are dropped; the next sync
//!   will carry their effect.
//! - `Syncing`: a full-state sync is being received. Operations are buffered
//!   and local writes are queued instead of published.
//! - `Synced`: operations are applied as they arrive and local writes are
//!   published immediately.
//!
//! Every entry point returns [`Effects`] describing what the caller must do
//! next (notify subscribers, publish, resolve waiters). The coordinator never
//! performs IO itself.

use crate::operation::{InboundOperation, Operation};
use crate::pool::{ObjectsPool, PoolChanges};
use crate::reconcile::{PendingOp, PendingState};
use crate::snapshot::SyncSequence;
use crate::value::{ObjectKind, ObjectValue};
use crate::wire::{ObjectMessage, ObjectOperation, OutboundObjectMessage, SyncCursor};
use crate::{Error, LocalClock, MessageId, ObjectId, ObjectUpdate, Result, Timestamp};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    Idle,
    Syncing,
    Synced,
}

/// What a coordinator step produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Effects {
    /// Visible changes to deliver to subscribers
    pub updates: Vec<(ObjectId, ObjectUpdate)>,
    /// Objects no longer in the pool; their subscriptions should be dropped
    pub removed: Vec<ObjectId>,
    /// Local writes confirmed by their echo
    pub confirmed: Vec<MessageId>,
    /// Local writes that can no longer complete
    pub failed: Vec<MessageId>,
    /// Queued local writes that are now ready to publish
    pub outbound: Vec<OutboundObjectMessage>,
    /// State transitions, in order
    pub state_changes: Vec<SyncState>,
    /// The current sync was abandoned and a fresh one is needed
    pub resync_requested: bool,
}

impl Effects {
    fn absorb(&mut self, changes: PoolChanges) {
        self.updates.extend(changes.updates);
        self.removed.extend(changes.removed);
        self.confirmed.extend(changes.confirmed);
    }

    pub fn is_empty(&self) -> bool {
        *self == Effects::default()
    }
}

/// The result of issuing a local write.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalWrite {
    /// The written object; for creates, the new object's id
    pub object_id: ObjectId,
    /// Ids whose echo completes the write
    pub message_ids: Vec<MessageId>,
    /// Messages to publish now; empty while the write is queued
    pub outbound: Vec<OutboundObjectMessage>,
    /// Optimistic visible changes
    pub updates: Vec<(ObjectId, ObjectUpdate)>,
}

#[derive(Debug, Clone)]
pub struct SyncCoordinator {
    state: SyncState,
    pool: ObjectsPool,
    sequence: Option<SyncSequence>,
    clock: LocalClock,
}

impl SyncCoordinator {
    /// A coordinator in `Idle` with an empty root map. `client_id` prefixes
    /// local message ids and must be unique per session.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            state: SyncState::Idle,
            pool: ObjectsPool::new(),
            sequence: None,
            clock: LocalClock::new(client_id),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == SyncState::Synced
    }

    pub fn pool(&self) -> &ObjectsPool {
        &self.pool
    }

    fn transition(&mut self, to: SyncState, effects: &mut Effects) {
        if self.state != to {
            debug!(from = ?self.state, to = ?to, "Sync state changed");
            self.state = to;
            effects.state_changes.push(to);
        }
    }

    /// The channel attached. With `has_objects`, wait for a sync; without, the
    /// channel holds no objects and the pool is reset immediately.
    pub fn start_sync(&mut self, has_objects: bool, now: Timestamp) -> Effects {
        let mut effects = Effects::default();
        if has_objects {
            info!("Starting object sync");
            self.sequence = Some(SyncSequence::new());
            self.transition(SyncState::Syncing, &mut effects);
            return effects;
        }

        info!("Attached with no objects; resetting pool");
        self.transition(SyncState::Syncing, &mut effects);
        self.sequence = None;
        effects.absorb(self.pool.reset());
        self.finish_sync(&mut effects, Vec::new(), now);
        effects
    }

    /// Handle one chunk of a sync sequence.
    ///
    /// `channel_serial` is the cursor of the carrying protocol message. `None`
    /// means the whole sync is in this chunk.
    pub fn handle_sync_messages(
        &mut self,
        messages: Vec<ObjectMessage>,
        channel_serial: Option<&str>,
        now: Timestamp,
    ) -> Effects {
        let mut effects = Effects::default();
        let cursor = match channel_serial.map(SyncCursor::parse).transpose() {
            Ok(cursor) => cursor,
            Err(e) => {
                self.abandon_sync(e, &mut effects);
                return effects;
            }
        };

        if self.state != SyncState::Syncing {
            self.sequence = Some(SyncSequence::new());
            self.transition(SyncState::Syncing, &mut effects);
        }
        let sequence = self.sequence.get_or_insert_with(SyncSequence::new);
        let sequence_id = cursor.as_ref().map(|c| c.sequence_id.as_str()).unwrap_or("");
        if !sequence.begin(sequence_id) {
            info!(sequence_id, "New sync sequence started; discarding partial sync");
        }

        for message in messages {
            match message.object {
                Some(state) => sequence.add_object(state, message.serial_timestamp),
                None => warn!(message_id = ?message.id, "Sync message without object state"),
            }
        }

        let last = cursor.as_ref().map_or(true, SyncCursor::is_last);
        if !last {
            debug!(objects = sequence.object_count(), "Sync chunk received");
            return effects;
        }

        let Some(sequence) = self.sequence.take() else {
            return effects;
        };
        let (states, buffered) = sequence.finish();
        match self.pool.initialize_from_sync(states, now) {
            Ok(changes) => effects.absorb(changes),
            Err(e) => {
                self.abandon_sync(e, &mut effects);
                return effects;
            }
        }
        self.finish_sync(&mut effects, buffered, now);
        effects
    }

    /// Replay buffered operations, publish queued writes and enter `Synced`.
    fn finish_sync(&mut self, effects: &mut Effects, buffered: Vec<InboundOperation>, now: Timestamp) {
        let replayed = buffered.len();
        for op in &buffered {
            effects.absorb(self.pool.apply_operation(op, now));
        }
        effects.outbound = self.pool.pending_mut().take_queued();
        self.transition(SyncState::Synced, effects);
        info!(
            objects = self.pool.len(),
            replayed,
            queued = effects.outbound.len(),
            "Object sync complete"
        );
    }

    fn abandon_sync(&mut self, error: Error, effects: &mut Effects) {
        warn!(error = %error, "Abandoning object sync");
        self.sequence = None;
        self.transition(SyncState::Idle, effects);
        effects.resync_requested = true;
    }

    /// Handle incremental operation messages.
    pub fn handle_operations(&mut self, messages: Vec<ObjectMessage>, now: Timestamp) -> Effects {
        let mut effects = Effects::default();
        for message in messages {
            let op = match InboundOperation::try_from(message) {
                Ok(op) => op,
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable object message");
                    continue;
                }
            };
            match self.state {
                SyncState::Idle => {
                    debug!(object_id = %op.object_id, serial = %op.serial, "Not attached; dropping operation");
                }
                SyncState::Syncing => {
                    if let Some(sequence) = self.sequence.as_mut() {
                        sequence.buffer(op);
                    }
                }
                SyncState::Synced => effects.absorb(self.pool.apply_operation(&op, now)),
            }
        }
        effects
    }

    /// The channel left the attached state. Writes in flight can no longer be
    /// confirmed and are failed.
    pub fn detach(&mut self) -> Effects {
        let mut effects = Effects::default();
        self.sequence = None;
        effects.failed = self.pool.pending_mut().fail_outstanding();
        self.transition(SyncState::Idle, &mut effects);
        effects
    }

    /// A publish was rejected by the channel.
    pub fn publish_failed(&mut self, message_ids: &[MessageId]) {
        warn!(count = message_ids.len(), "Publish failed; keeping optimistic state until next sync");
        self.pool.pending_mut().mark_failed(message_ids);
    }

    pub fn collect_garbage(&mut self, now: Timestamp, grace: u64) -> Effects {
        Effects {
            removed: self.pool.collect_garbage(now, grace),
            ..Default::default()
        }
    }

    // ========================================================================
    // Local writes
    // ========================================================================

    fn expect_kind(&self, object_id: &str, expected: ObjectKind) -> Result<()> {
        match self.pool.kind_of(object_id) {
            Some(kind) if kind == expected => Ok(()),
            Some(_) => Err(Error::WrongObjectKind {
                object_id: object_id.to_string(),
                expected,
            }),
            None => Err(Error::ObjectNotFound(object_id.to_string())),
        }
    }

    fn record_local(&mut self, wire: ObjectOperation, now: Timestamp) -> Result<LocalWrite> {
        let operation = Operation::decode(&wire)?;
        let message_id = self.clock.tick();
        let object_id = wire.object_id.clone();
        let state = if self.is_synced() {
            PendingState::Published
        } else {
            PendingState::Queued
        };

        let pending = PendingOp {
            message_id: message_id.clone(),
            object_id: object_id.clone(),
            operation,
            wire,
            applied_at: now,
            state,
        };
        let outbound = match state {
            PendingState::Published => vec![pending.outbound()],
            _ => {
                debug!(message_id = %message_id, "Not synced; queueing local write");
                Vec::new()
            }
        };
        let updates = self.pool.record_pending(pending);

        Ok(LocalWrite {
            object_id,
            message_ids: vec![message_id],
            outbound,
            updates,
        })
    }

    pub fn local_map_set(
        &mut self,
        object_id: &str,
        key: &str,
        value: ObjectValue,
        now: Timestamp,
    ) -> Result<LocalWrite> {
        value.validate()?;
        self.expect_kind(object_id, ObjectKind::Map)?;
        self.record_local(ObjectOperation::map_set(object_id, key, &value), now)
    }

    pub fn local_map_remove(&mut self, object_id: &str, key: &str, now: Timestamp) -> Result<LocalWrite> {
        self.expect_kind(object_id, ObjectKind::Map)?;
        self.record_local(ObjectOperation::map_remove(object_id, key), now)
    }

    pub fn local_counter_inc(&mut self, object_id: &str, amount: f64, now: Timestamp) -> Result<LocalWrite> {
        if !amount.is_finite() {
            return Err(Error::InvalidCounterAmount(amount));
        }
        self.expect_kind(object_id, ObjectKind::Counter)?;
        self.record_local(ObjectOperation::counter_inc(object_id, amount), now)
    }

    /// Create a map. `server_time` and `nonce` determine the new object's id.
    pub fn local_create_map(
        &mut self,
        entries: BTreeMap<String, ObjectValue>,
        nonce: &str,
        server_time: Timestamp,
        now: Timestamp,
    ) -> Result<LocalWrite> {
        for value in entries.values() {
            value.validate()?;
        }
        let wire = ObjectOperation::map_create(&entries, nonce, server_time)?;
        self.pool.create_object(&wire, now)?;
        self.record_local(wire, now)
    }

    /// Create a counter. `server_time` and `nonce` determine the new object's id.
    pub fn local_create_counter(
        &mut self,
        count: f64,
        nonce: &str,
        server_time: Timestamp,
        now: Timestamp,
    ) -> Result<LocalWrite> {
        if !count.is_finite() {
            return Err(Error::InvalidCounterAmount(count));
        }
        let wire = ObjectOperation::counter_create(count, nonce, server_time)?;
        self.pool.create_object(&wire, now)?;
        self.record_local(wire, now)
    }
}
