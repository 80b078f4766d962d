//! The objects pool.
//!
//! All replicated objects of a channel live here, keyed by id. Objects refer
//! to each other only through [`ObjectValue::Reference`], so there is no
//! ownership between objects and reference cycles are harmless. A reference to
//! an id that is not in the pool, or to a deleted object, reads as absent.
//!
//! The pool also owns the [`PendingLedger`]: every read goes through the
//! optimistic overlay, and every change notification is computed as the
//! difference in what a reader would see before and after.

use crate::counter::{CounterUpdate, ReplicatedCounter};
use crate::map::{KeyChange, MapUpdate, ReplicatedMap};
use crate::object::{ObjectMeta, ObjectUpdate};
use crate::operation::{InboundOperation, Operation};
use crate::reconcile::{PendingLedger, PendingOp};
use crate::snapshot::SyncedObject;
use crate::value::{ObjectKind, ObjectValue};
use crate::wire::{ObjectOperation, ObjectState};
use crate::{Error, MessageId, ObjectId, Result, Timestamp, ROOT_OBJECT_ID};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

/// A replicated object stored in the pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Map(ReplicatedMap),
    Counter(ReplicatedCounter),
}

impl Entry {
    /// An empty object of the kind encoded in `object_id`.
    pub fn zero_value(object_id: &str) -> Result<Self> {
        Ok(match ObjectKind::from_object_id(object_id)? {
            ObjectKind::Map => Entry::Map(ReplicatedMap::new(object_id)),
            ObjectKind::Counter => Entry::Counter(ReplicatedCounter::new(object_id)),
        })
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            Entry::Map(_) => ObjectKind::Map,
            Entry::Counter(_) => ObjectKind::Counter,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Entry::Map(map) => map.meta(),
            Entry::Counter(counter) => counter.meta(),
        }
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Entry::Map(map) => map.meta_mut(),
            Entry::Counter(counter) => counter.meta_mut(),
        }
    }

    fn tombstone(&mut self, at: Timestamp) -> bool {
        match self {
            Entry::Map(map) => map.tombstone(at),
            Entry::Counter(counter) => counter.tombstone(at).is_some(),
        }
    }
}

/// What a reader sees of one object.
#[derive(Debug, Clone, PartialEq)]
enum Visible {
    Map(BTreeMap<String, ObjectValue>),
    Counter(f64),
    Absent,
}

/// Outcome of a pool mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolChanges {
    /// Visible changes per object, in application order
    pub updates: Vec<(ObjectId, ObjectUpdate)>,
    /// Objects removed from the pool
    pub removed: Vec<ObjectId>,
    /// Local operations confirmed by their server echo
    pub confirmed: Vec<MessageId>,
}

impl PoolChanges {
    pub fn extend(&mut self, other: PoolChanges) {
        self.updates.extend(other.updates);
        self.removed.extend(other.removed);
        self.confirmed.extend(other.confirmed);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectsPool {
    entries: HashMap<ObjectId, Entry>,
    pending: PendingLedger,
}

impl Default for ObjectsPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectsPool {
    /// A pool holding only an empty root map.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            ROOT_OBJECT_ID.to_string(),
            Entry::Map(ReplicatedMap::new(ROOT_OBJECT_ID)),
        );
        Self {
            entries,
            pending: PendingLedger::new(),
        }
    }

    pub fn get(&self, object_id: &str) -> Option<&Entry> {
        self.entries.get(object_id)
    }

    pub fn contains(&self, object_id: &str) -> bool {
        self.entries.contains_key(object_id)
    }

    pub fn kind_of(&self, object_id: &str) -> Option<ObjectKind> {
        self.entries.get(object_id).map(Entry::kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn object_ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.entries.keys()
    }

    pub fn pending(&self) -> &PendingLedger {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut PendingLedger {
        &mut self.pending
    }

    // ========================================================================
    // Reads
    // ========================================================================

    fn map(&self, object_id: &str) -> Result<&ReplicatedMap> {
        match self.entries.get(object_id) {
            Some(Entry::Map(map)) => Ok(map),
            Some(Entry::Counter(_)) => Err(Error::WrongObjectKind {
                object_id: object_id.to_string(),
                expected: ObjectKind::Map,
            }),
            None => Err(Error::ObjectNotFound(object_id.to_string())),
        }
    }

    fn counter(&self, object_id: &str) -> Result<&ReplicatedCounter> {
        match self.entries.get(object_id) {
            Some(Entry::Counter(counter)) => Ok(counter),
            Some(Entry::Map(_)) => Err(Error::WrongObjectKind {
                object_id: object_id.to_string(),
                expected: ObjectKind::Counter,
            }),
            None => Err(Error::ObjectNotFound(object_id.to_string())),
        }
    }

    /// Whether a reference to `object_id` currently resolves.
    fn is_live(&self, object_id: &str) -> bool {
        self.entries
            .get(object_id)
            .is_some_and(|e| !e.meta().is_tombstoned())
    }

    fn resolve(&self, value: ObjectValue) -> Option<ObjectValue> {
        match &value {
            ObjectValue::Reference(id) if !self.is_live(id) => None,
            _ => Some(value),
        }
    }

    /// Current value of `key`, including pending local writes.
    pub fn map_get(&self, object_id: &str, key: &str) -> Result<Option<ObjectValue>> {
        let map = self.map(object_id)?;
        if map.meta().is_tombstoned() {
            return Ok(None);
        }
        let confirmed = map.get(key).cloned();
        let value = self.pending.overlay_map_key(object_id, key, confirmed);
        Ok(value.and_then(|v| self.resolve(v)))
    }

    /// Snapshot of the live entries of a map, in key order.
    pub fn map_entries(&self, object_id: &str) -> Result<Vec<(String, ObjectValue)>> {
        match self.visible(object_id) {
            Visible::Map(entries) => Ok(entries.into_iter().collect()),
            _ => self.map(object_id).map(|_| Vec::new()),
        }
    }

    /// Current counter value, including pending local increments.
    pub fn counter_value(&self, object_id: &str) -> Result<f64> {
        let counter = self.counter(object_id)?;
        if counter.meta().is_tombstoned() {
            return Ok(0.0);
        }
        Ok(self.pending.overlay_counter(object_id, counter.value()))
    }

    fn visible(&self, object_id: &str) -> Visible {
        match self.entries.get(object_id) {
            Some(Entry::Map(map)) => {
                if map.meta().is_tombstoned() {
                    return Visible::Map(BTreeMap::new());
                }
                let mut entries: BTreeMap<String, ObjectValue> = map
                    .entries()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                self.pending.overlay_map(object_id, &mut entries);
                entries.retain(|_, v| match v {
                    ObjectValue::Reference(id) => self.is_live(id),
                    _ => true,
                });
                Visible::Map(entries)
            }
            Some(Entry::Counter(counter)) => {
                if counter.meta().is_tombstoned() {
                    return Visible::Counter(0.0);
                }
                Visible::Counter(self.pending.overlay_counter(object_id, counter.value()))
            }
            None => Visible::Absent,
        }
    }

    fn is_tombstoned(&self, object_id: &str) -> bool {
        self.entries
            .get(object_id)
            .is_some_and(|e| e.meta().is_tombstoned())
    }

    /// Compare two views of one object and describe the visible change.
    fn diff(before: &Visible, after: &Visible) -> Option<ObjectUpdate> {
        match (before, after) {
            (Visible::Map(before), Visible::Map(after)) => {
                let mut update = MapUpdate::default();
                for (key, value) in after {
                    if before.get(key) != Some(value) {
                        update.changes.insert(key.clone(), KeyChange::Updated);
                    }
                }
                for key in before.keys() {
                    if !after.contains_key(key) {
                        update.changes.insert(key.clone(), KeyChange::Removed);
                    }
                }
                (!update.is_empty()).then_some(ObjectUpdate::Map(update))
            }
            (Visible::Counter(before), Visible::Counter(after)) => {
                let amount = after - before;
                (amount != 0.0).then_some(ObjectUpdate::Counter(CounterUpdate { amount }))
            }
            _ => None,
        }
    }

    /// Run `mutate` and report the visible change it made to `object_id`.
    fn observe<F>(&mut self, object_id: &str, mutate: F) -> Vec<(ObjectId, ObjectUpdate)>
    where
        F: FnOnce(&mut Self),
    {
        let before = self.visible(object_id);
        let was_tombstoned = self.is_tombstoned(object_id);
        mutate(self);
        let after = self.visible(object_id);

        let mut updates = Vec::new();
        if let Some(update) = Self::diff(&before, &after) {
            updates.push((object_id.to_string(), update));
        }
        if !was_tombstoned && self.is_tombstoned(object_id) {
            updates.push((object_id.to_string(), ObjectUpdate::Deleted));
        }
        updates
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Create a zero-value object for `object_id` if it is not already pooled.
    fn ensure_object(&mut self, object_id: &str) -> Result<()> {
        if !self.entries.contains_key(object_id) {
            let entry = Entry::zero_value(object_id)?;
            debug!(object_id = %object_id, "Created zero-value object");
            self.entries.insert(object_id.to_string(), entry);
        }
        Ok(())
    }

    fn ensure_referenced(&mut self, ids: Vec<ObjectId>) {
        for id in ids {
            if let Err(e) = self.ensure_object(&id) {
                warn!(object_id = %id, error = %e, "Ignoring reference to invalid object id");
            }
        }
    }

    /// Apply a confirmed remote operation.
    ///
    /// Stale, duplicate and inapplicable operations are absorbed and logged.
    /// If the operation is the echo of a pending local write, the write is
    /// confirmed.
    pub fn apply_operation(&mut self, op: &InboundOperation, now: Timestamp) -> PoolChanges {
        let mut confirmed = Vec::new();
        let mut result = Ok(());
        let updates = self.observe(&op.object_id, |pool| {
            if let Some(message_id) = &op.message_id {
                if let Some(pending) = pool.pending.confirm(message_id) {
                    confirmed.push(pending.message_id);
                }
            }
            result = pool.apply_confirmed(op, now);
        });
        let changes = PoolChanges {
            updates,
            removed: Vec::new(),
            confirmed,
        };

        match result {
            Ok(()) => {}
            Err(Error::DuplicateOperation { object_id, serial }) => {
                debug!(object_id = %object_id, serial = %serial, "Ignoring duplicate operation");
            }
            Err(e) => {
                warn!(object_id = %op.object_id, serial = %op.serial, error = %e, "Discarding operation");
            }
        }
        changes
    }

    fn apply_confirmed(&mut self, op: &InboundOperation, now: Timestamp) -> Result<()> {
        if let Operation::Unknown(action) = op.operation {
            warn!(object_id = %op.object_id, action, "Discarding operation with unknown action");
            return Ok(());
        }
        self.ensure_object(&op.object_id)?;
        let entry = self
            .entries
            .get_mut(&op.object_id)
            .ok_or_else(|| Error::ObjectNotFound(op.object_id.clone()))?;

        if entry.meta().is_tombstoned() {
            debug!(object_id = %op.object_id, serial = %op.serial, "Ignoring operation on deleted object");
            return Ok(());
        }
        if entry.meta().already_synced(&op.site_code, &op.serial) {
            return Err(Error::DuplicateOperation {
                object_id: op.object_id.clone(),
                serial: op.serial.to_string(),
            });
        }

        let mut referenced = Vec::new();
        match (entry, &op.operation) {
            (Entry::Map(map), Operation::MapCreate { entries }) => {
                if !map.merge_initial_value(entries, now) {
                    debug!(object_id = %op.object_id, "Create operation already merged");
                }
                referenced.extend(map.referenced_ids().cloned());
            }
            (Entry::Map(map), Operation::MapSet { key, value }) => {
                if map.apply_set(key, value.clone(), Some(op.serial.clone())) {
                    if let ObjectValue::Reference(id) = value {
                        referenced.push(id.clone());
                    }
                } else {
                    debug!(object_id = %op.object_id, key = %key, serial = %op.serial, "Stale MAP_SET");
                }
            }
            (Entry::Map(map), Operation::MapRemove { key }) => {
                if !map.apply_remove(key, Some(op.serial.clone()), op.tombstoned_at(now)) {
                    debug!(object_id = %op.object_id, key = %key, serial = %op.serial, "Stale MAP_REMOVE");
                }
            }
            (Entry::Counter(counter), Operation::CounterCreate { count }) => {
                if counter.merge_initial_value(*count).is_none() {
                    debug!(object_id = %op.object_id, "Create operation already merged");
                }
            }
            (Entry::Counter(counter), Operation::CounterInc { amount }) => {
                counter.apply_increment(&op.serial, *amount)?;
            }
            (_, Operation::ObjectDelete) if op.object_id == ROOT_OBJECT_ID => {
                warn!(serial = %op.serial, "Ignoring delete of the root object");
            }
            (entry, Operation::ObjectDelete) => {
                entry.tombstone(op.tombstoned_at(now));
                debug!(object_id = %op.object_id, "Object deleted");
            }
            (entry, operation) => {
                return Err(Error::WrongObjectKind {
                    object_id: op.object_id.clone(),
                    expected: operation.target_kind().unwrap_or(entry.kind()),
                });
            }
        }
        self.ensure_referenced(referenced);
        Ok(())
    }

    /// Register a locally created object and merge its initial value.
    pub fn create_object(&mut self, create: &ObjectOperation, now: Timestamp) -> Result<ObjectId> {
        let operation = Operation::decode(create)?;
        let object_id = create.object_id.clone();
        self.ensure_object(&object_id)?;
        let entry = self
            .entries
            .get_mut(&object_id)
            .ok_or_else(|| Error::ObjectNotFound(object_id.clone()))?;

        let mut referenced = Vec::new();
        match (entry, &operation) {
            (Entry::Map(map), Operation::MapCreate { entries }) => {
                map.merge_initial_value(entries, now);
                referenced.extend(map.referenced_ids().cloned());
            }
            (Entry::Counter(counter), Operation::CounterCreate { count }) => {
                counter.merge_initial_value(*count);
            }
            (entry, _) => {
                return Err(Error::WrongObjectKind {
                    object_id,
                    expected: entry.kind(),
                });
            }
        }
        self.ensure_referenced(referenced);
        Ok(object_id)
    }

    /// Record a local write and report what it changed for readers.
    pub fn record_pending(&mut self, op: PendingOp) -> Vec<(ObjectId, ObjectUpdate)> {
        let object_id = op.object_id.clone();
        self.observe(&object_id, |pool| pool.pending.record(op))
    }

    /// Rebuild the pool from a complete sync.
    ///
    /// Every state is validated before anything is changed; a malformed state
    /// rejects the whole sync with [`Error::ProtocolViolation`]. Objects not in
    /// the sync are removed, except the root and objects whose local creation
    /// is still pending. Failed local writes are dropped.
    ///
    /// A tombstoned state is aged from its message's serial timestamp, falling
    /// back to `now` when the server sent none.
    pub fn initialize_from_sync(
        &mut self,
        objects: impl IntoIterator<Item = impl Into<SyncedObject>>,
        now: Timestamp,
    ) -> Result<PoolChanges> {
        let objects: Vec<SyncedObject> = objects.into_iter().map(Into::into).collect();
        for synced in &objects {
            validate_state(&synced.state)?;
        }

        let synced: HashSet<&str> = objects.iter().map(|o| o.state.object_id.as_str()).collect();
        let removed: Vec<ObjectId> = self
            .entries
            .keys()
            .filter(|id| {
                id.as_str() != ROOT_OBJECT_ID
                    && !synced.contains(id.as_str())
                    && !self.pending.has_pending_create(id)
            })
            .cloned()
            .collect();

        let before: Vec<(ObjectId, Visible, bool)> = self
            .entries
            .keys()
            .filter(|id| !removed.contains(id))
            .map(|id| (id.clone(), self.visible(id), self.is_tombstoned(id)))
            .collect();

        for id in &removed {
            self.entries.remove(id);
        }
        let dropped = self.pending.drop_failed();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Dropped failed local operations");
        }

        let mut referenced = Vec::new();
        for SyncedObject { state, serial_timestamp } in &objects {
            let mut entry = match self.entries.remove(&state.object_id) {
                Some(entry) => entry,
                None => Entry::zero_value(&state.object_id)?,
            };
            match &mut entry {
                Entry::Map(map) => {
                    map.replace_data(state, now);
                    referenced.extend(map.referenced_ids().cloned());
                }
                Entry::Counter(counter) => counter.replace_data(state),
            }
            if state.tombstone {
                entry.tombstone(serial_timestamp.unwrap_or(now));
            } else {
                entry.meta_mut().tombstoned_at = None;
            }
            self.entries.insert(state.object_id.clone(), entry);
        }
        self.ensure_referenced(referenced);

        let mut changes = PoolChanges {
            removed,
            ..Default::default()
        };
        for (id, before, was_tombstoned) in before {
            let after = self.visible(&id);
            if let Some(update) = Self::diff(&before, &after) {
                changes.updates.push((id.clone(), update));
            }
            if !was_tombstoned && self.is_tombstoned(&id) {
                changes.updates.push((id, ObjectUpdate::Deleted));
            }
        }
        debug!(objects = self.entries.len(), removed = changes.removed.len(), "Pool rebuilt from sync");
        Ok(changes)
    }

    /// Reset to an empty root map, as after attaching to a channel with no
    /// objects.
    pub fn reset(&mut self) -> PoolChanges {
        let removed: Vec<ObjectId> = self
            .entries
            .keys()
            .filter(|id| id.as_str() != ROOT_OBJECT_ID && !self.pending.has_pending_create(id))
            .cloned()
            .collect();
        for id in &removed {
            self.entries.remove(id);
        }
        self.pending.drop_failed();

        let updates = self.observe(ROOT_OBJECT_ID, |pool| {
            match pool.entries.get_mut(ROOT_OBJECT_ID) {
                Some(Entry::Map(root)) => root.reset(),
                _ => {
                    pool.entries.insert(
                        ROOT_OBJECT_ID.to_string(),
                        Entry::Map(ReplicatedMap::new(ROOT_OBJECT_ID)),
                    );
                }
            }
        });
        PoolChanges {
            updates,
            removed,
            confirmed: Vec::new(),
        }
    }

    /// Ids reachable from the root through live references.
    fn reachable(&self) -> HashSet<ObjectId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([ROOT_OBJECT_ID.to_string()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(Entry::Map(map)) = self.entries.get(&id) {
                queue.extend(map.referenced_ids().filter(|r| !seen.contains(*r)).cloned());
            }
        }
        seen
    }

    /// Remove aged tombstones.
    ///
    /// Tombstoned map entries older than `grace` are dropped. Tombstoned
    /// objects older than `grace` that are unreachable from the root are
    /// removed from the pool; their ids are returned. The root is never
    /// removed.
    pub fn collect_garbage(&mut self, now: Timestamp, grace: u64) -> Vec<ObjectId> {
        let mut entries_removed = 0;
        for entry in self.entries.values_mut() {
            if let Entry::Map(map) = entry {
                entries_removed += map.gc_entries(now, grace);
            }
        }

        let reachable = self.reachable();
        let removed: Vec<ObjectId> = self
            .entries
            .iter()
            .filter(|(id, entry)| {
                id.as_str() != ROOT_OBJECT_ID
                    && !reachable.contains(*id)
                    && entry
                        .meta()
                        .tombstoned_at
                        .is_some_and(|at| now.saturating_sub(at) >= grace)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &removed {
            self.entries.remove(id);
        }

        if entries_removed > 0 || !removed.is_empty() {
            debug!(entries = entries_removed, objects = removed.len(), "Collected garbage");
        }
        removed
    }
}

/// Check that a synced state is consistent with its object id.
fn validate_state(state: &ObjectState) -> Result<()> {
    let kind = ObjectKind::from_object_id(&state.object_id)
        .map_err(|e| Error::ProtocolViolation(e.to_string()))?;
    let contradicts = match kind {
        ObjectKind::Map => state.counter.is_some() && state.map.is_none(),
        ObjectKind::Counter => state.map.is_some() && state.counter.is_none(),
    };
    if contradicts {
        return Err(Error::ProtocolViolation(format!(
            "synced state for {} does not describe a {}",
            state.object_id, kind
        )));
    }
    Ok(())
}
