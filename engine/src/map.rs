//! Replicated last-writer-wins map.
//!
//! Each key keeps the value written by the operation with the highest
//! [`Timeserial`]. Removing a key leaves a tombstone that keeps its serial, so
//! an older write arriving late cannot bring the key back.
//!
//! A missing serial sorts before every present serial, and two missing serials
//! are considered equal. This matters for entries merged from a create
//! operation, which carry no serial of their own.

use crate::object::ObjectMeta;
use crate::value::ObjectValue;
use crate::wire::{MapSemantics, ObjectState, WireEnum, WireMapEntry};
use crate::{ObjectId, Result, Timeserial, Timestamp};
use std::collections::BTreeMap;
use tracing::warn;

/// One key of a map.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry {
    /// `None` when tombstoned
    pub value: Option<ObjectValue>,
    pub tombstone: bool,
    pub timeserial: Option<Timeserial>,
    /// When the key was removed
    pub tombstoned_at: Option<Timestamp>,
}

impl MapEntry {
    fn live(value: ObjectValue, timeserial: Option<Timeserial>) -> Self {
        Self {
            value: Some(value),
            tombstone: false,
            timeserial,
            tombstoned_at: None,
        }
    }

    fn removed(timeserial: Option<Timeserial>, at: Timestamp) -> Self {
        Self {
            value: None,
            tombstone: true,
            timeserial,
            tombstoned_at: Some(at),
        }
    }

    /// Decode a wire entry. `now` ages tombstones that carry no timestamp.
    pub fn from_wire(entry: &WireMapEntry, now: Timestamp) -> Result<Self> {
        let timeserial = Timeserial::from_wire(entry.timeserial.as_deref());
        if entry.tombstone.unwrap_or(false) {
            return Ok(Self::removed(
                timeserial,
                entry.serial_timestamp.unwrap_or(now),
            ));
        }
        let data = entry.data.as_ref().ok_or_else(|| {
            crate::Error::Serialization("live map entry without data".into())
        })?;
        Ok(Self::live(ObjectValue::from_wire(data)?, timeserial))
    }
}

/// How a key changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyChange {
    Updated,
    Removed,
}

/// Visible changes to a map, keyed by map key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapUpdate {
    pub changes: BTreeMap<String, KeyChange>,
}

impl MapUpdate {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Whether an operation with `op_serial` may overwrite an entry last written
/// at `entry_serial`.
pub(crate) fn can_apply(entry_serial: Option<&Timeserial>, op_serial: Option<&Timeserial>) -> bool {
    match (entry_serial, op_serial) {
        (Some(entry), Some(op)) => op > entry,
        (None, Some(_)) => true,
        (Some(_), None) | (None, None) => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatedMap {
    meta: ObjectMeta,
    semantics: WireEnum<MapSemantics>,
    entries: BTreeMap<String, MapEntry>,
}

impl ReplicatedMap {
    /// An empty map, awaiting its create operation or synced state.
    pub fn new(object_id: impl Into<ObjectId>) -> Self {
        Self {
            meta: ObjectMeta::new(object_id),
            semantics: MapSemantics::Lww.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    pub fn semantics(&self) -> WireEnum<MapSemantics> {
        self.semantics
    }

    /// Set `key`. Returns whether the write won.
    pub fn apply_set(&mut self, key: &str, value: ObjectValue, serial: Option<Timeserial>) -> bool {
        if let Some(existing) = self.entries.get(key) {
            if !can_apply(existing.timeserial.as_ref(), serial.as_ref()) {
                return false;
            }
        }
        self.entries
            .insert(key.to_string(), MapEntry::live(value, serial));
        true
    }

    /// Tombstone `key`. Returns whether the removal won.
    pub fn apply_remove(&mut self, key: &str, serial: Option<Timeserial>, at: Timestamp) -> bool {
        if let Some(existing) = self.entries.get(key) {
            if !can_apply(existing.timeserial.as_ref(), serial.as_ref()) {
                return false;
            }
        }
        self.entries
            .insert(key.to_string(), MapEntry::removed(serial, at));
        true
    }

    /// The stored value of a live key. References are returned unresolved.
    pub fn get(&self, key: &str) -> Option<&ObjectValue> {
        self.entries
            .get(key)
            .filter(|e| !e.tombstone)
            .and_then(|e| e.value.as_ref())
    }

    /// Raw entry, including tombstones.
    pub fn entry(&self, key: &str) -> Option<&MapEntry> {
        self.entries.get(key)
    }

    /// Live keys and values in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &ObjectValue)> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.tombstone)
            .filter_map(|(k, e)| e.value.as_ref().map(|v| (k, v)))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids referenced by live entries.
    pub fn referenced_ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.entries().filter_map(|(_, v)| match v {
            ObjectValue::Reference(id) => Some(id),
            _ => None,
        })
    }

    /// Merge the entries of a create operation, once per object.
    ///
    /// Returns `false` if a create operation was already merged.
    pub fn merge_initial_value(
        &mut self,
        entries: &BTreeMap<String, WireMapEntry>,
        now: Timestamp,
    ) -> bool {
        if self.meta.create_merged {
            return false;
        }
        for (key, wire) in entries {
            match MapEntry::from_wire(wire, now) {
                Ok(entry) if entry.tombstone => {
                    self.apply_remove(key, entry.timeserial, entry.tombstoned_at.unwrap_or(now));
                }
                Ok(MapEntry {
                    value: Some(value),
                    timeserial,
                    ..
                }) => {
                    self.apply_set(key, value, timeserial);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(object_id = %self.meta.object_id, key = %key, error = %e, "Skipping undecodable create entry");
                }
            }
        }
        self.meta.create_merged = true;
        true
    }

    /// Replace the whole map with a synced state.
    pub fn replace_data(&mut self, state: &ObjectState, now: Timestamp) {
        self.meta.replace(&state.site_timeserials);
        self.entries.clear();
        if let Some(map) = &state.map {
            if let Some(semantics) = map.semantics {
                self.semantics = semantics;
            }
            for (key, wire) in map.entries.iter().flatten() {
                match MapEntry::from_wire(wire, now) {
                    Ok(entry) => {
                        self.entries.insert(key.clone(), entry);
                    }
                    Err(e) => {
                        warn!(object_id = %self.meta.object_id, key = %key, error = %e, "Skipping undecodable synced entry");
                    }
                }
            }
        }
        if let Some(create_op) = &state.create_op {
            let entries = create_op
                .map
                .as_ref()
                .and_then(|m| m.entries.clone())
                .unwrap_or_default();
            self.merge_initial_value(&entries, now);
        }
    }

    /// Delete the map. All entries are dropped and later operations ignored.
    pub fn tombstone(&mut self, at: Timestamp) -> bool {
        if self.meta.is_tombstoned() {
            return false;
        }
        self.meta.tombstoned_at = Some(at);
        self.entries.clear();
        true
    }

    /// Drop every entry and all sync bookkeeping.
    pub fn reset(&mut self) {
        self.meta = ObjectMeta::new(self.meta.object_id.clone());
        self.entries.clear();
    }

    /// Remove tombstoned entries older than `grace`. Returns how many were removed.
    pub fn gc_entries(&mut self, now: Timestamp, grace: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| match e.tombstoned_at {
            Some(at) if e.tombstone => now.saturating_sub(at) < grace,
            _ => true,
        });
        before - self.entries.len()
    }

    pub(crate) fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}
