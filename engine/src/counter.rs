//! Replicated counter.
//!
//! Increments commute, so the only thing a counter has to guard against is
//! applying the same increment twice. Each applied serial is remembered until
//! the next synced state replaces the value; serials already folded into that
//! state are recognized through the site watermarks on [`ObjectMeta`].

use crate::object::ObjectMeta;
use crate::wire::ObjectState;
use crate::{Error, ObjectId, Result, Timeserial, Timestamp};
use std::collections::HashSet;

/// A visible change to a counter value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterUpdate {
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatedCounter {
    meta: ObjectMeta,
    value: f64,
    /// Serials of increments applied since the last synced state. Holds one
    /// entry per distinct increment; emptied by `replace_data` and `tombstone`,
    /// so it is bounded by the traffic between two syncs of this object.
    applied: HashSet<Timeserial>,
}

impl ReplicatedCounter {
    /// A zero-valued counter, awaiting its create operation or synced state.
    pub fn new(object_id: impl Into<ObjectId>) -> Self {
        Self {
            meta: ObjectMeta::new(object_id),
            value: 0.0,
            applied: HashSet::new(),
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Apply a remote increment exactly once.
    pub fn apply_increment(&mut self, serial: &Timeserial, amount: f64) -> Result<CounterUpdate> {
        if !amount.is_finite() {
            return Err(Error::InvalidCounterAmount(amount));
        }
        if !self.applied.insert(serial.clone()) {
            return Err(Error::DuplicateOperation {
                object_id: self.meta.object_id.clone(),
                serial: serial.to_string(),
            });
        }
        self.value += amount;
        Ok(CounterUpdate { amount })
    }

    /// Add the create operation's initial count, once per object.
    pub fn merge_initial_value(&mut self, count: f64) -> Option<CounterUpdate> {
        if self.meta.create_merged {
            return None;
        }
        self.meta.create_merged = true;
        if count == 0.0 || !count.is_finite() {
            return None;
        }
        self.value += count;
        Some(CounterUpdate { amount: count })
    }

    /// Replace the whole counter with a synced state.
    pub fn replace_data(&mut self, state: &ObjectState) {
        self.meta.replace(&state.site_timeserials);
        self.applied.clear();
        self.value = state
            .counter
            .as_ref()
            .and_then(|c| c.count)
            .filter(|c| c.is_finite())
            .unwrap_or(0.0);

        if let Some(create_op) = &state.create_op {
            let count = create_op.counter.as_ref().and_then(|c| c.count);
            self.merge_initial_value(count.unwrap_or(0.0));
        }
    }

    /// Delete the counter. Its value drops to zero and later operations are ignored.
    pub fn tombstone(&mut self, at: Timestamp) -> Option<CounterUpdate> {
        if self.meta.is_tombstoned() {
            return None;
        }
        self.meta.tombstoned_at = Some(at);
        let previous = self.value;
        self.value = 0.0;
        self.applied.clear();
        Some(CounterUpdate { amount: -previous })
    }

    pub(crate) fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    #[cfg(test)]
    fn applied_len(&self) -> usize {
        self.applied.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ObjectOperation, WireCounter};
    use std::collections::BTreeMap;

    fn ts(s: &str) -> Timeserial {
        Timeserial::new(s)
    }

    #[test]
    fn increments_add_up() {
        let mut counter = ReplicatedCounter::new("counter:a@1");
        counter.apply_increment(&ts("01"), 5.0).unwrap();
        counter.apply_increment(&ts("02"), -2.5).unwrap();
        assert_eq!(counter.value(), 2.5);
    }

    #[test]
    fn duplicate_serial_is_rejected() {
        let mut counter = ReplicatedCounter::new("counter:a@1");
        counter.apply_increment(&ts("01"), 5.0).unwrap();
        let err = counter.apply_increment(&ts("01"), 5.0).unwrap_err();
        assert!(matches!(err, Error::DuplicateOperation { .. }));
        assert_eq!(counter.value(), 5.0);
    }

    #[test]
    fn applied_serials_are_released_by_sync_and_delete() {
        let mut counter = ReplicatedCounter::new("counter:a@1");
        for n in 0..50 {
            counter.apply_increment(&ts(&format!("{n:02}")), 1.0).unwrap();
        }
        assert_eq!(counter.applied_len(), 50);

        counter.replace_data(&ObjectState::counter("counter:a@1", 50.0));
        assert_eq!(counter.applied_len(), 0);
        assert_eq!(counter.value(), 50.0);

        counter.apply_increment(&ts("99"), 1.0).unwrap();
        assert_eq!(counter.applied_len(), 1);
        counter.tombstone(1);
        assert_eq!(counter.applied_len(), 0);
    }

    #[test]
    fn out_of_order_delivery() {
        let mut counter = ReplicatedCounter::new("counter:a@1");
        counter.apply_increment(&ts("02"), 3.0).unwrap();
        counter.apply_increment(&ts("01"), 5.0).unwrap();
        assert_eq!(counter.value(), 8.0);
    }

    #[test]
    fn non_finite_amount_is_rejected() {
        let mut counter = ReplicatedCounter::new("counter:a@1");
        assert!(counter.apply_increment(&ts("01"), f64::NAN).is_err());
        assert_eq!(counter.value(), 0.0);
    }

    #[test]
    fn create_is_merged_once() {
        let mut counter = ReplicatedCounter::new("counter:a@1");
        assert_eq!(
            counter.merge_initial_value(10.0),
            Some(CounterUpdate { amount: 10.0 })
        );
        assert_eq!(counter.merge_initial_value(10.0), None);
        assert_eq!(counter.value(), 10.0);
    }

    #[test]
    fn replace_data_resets_and_merges_create_op() {
        let mut counter = ReplicatedCounter::new("counter:a@1");
        counter.apply_increment(&ts("01"), 100.0).unwrap();

        let mut state = ObjectState::counter("counter:a@1", 4.0);
        state.create_op = Some(ObjectOperation::counter_create(1.0, "n", 1).unwrap());
        counter.replace_data(&state);

        assert_eq!(counter.value(), 5.0);
        assert!(counter.meta().create_merged);
        // Applied set is cleared; the synced state is authoritative.
        counter.apply_increment(&ts("01"), 1.0).unwrap();
        assert_eq!(counter.value(), 6.0);
    }

    #[test]
    fn replace_data_without_count_is_zero() {
        let mut counter = ReplicatedCounter::new("counter:a@1");
        counter.apply_increment(&ts("01"), 3.0).unwrap();
        let state = ObjectState {
            counter: Some(WireCounter { count: None }),
            site_timeserials: BTreeMap::new(),
            ..ObjectState::counter("counter:a@1", 0.0)
        };
        counter.replace_data(&state);
        assert_eq!(counter.value(), 0.0);
    }

    #[test]
    fn tombstone_zeroes_value() {
        let mut counter = ReplicatedCounter::new("counter:a@1");
        counter.apply_increment(&ts("01"), 7.0).unwrap();
        assert_eq!(counter.tombstone(50), Some(CounterUpdate { amount: -7.0 }));
        assert_eq!(counter.value(), 0.0);
        assert_eq!(counter.meta().tombstoned_at, Some(50));
        assert_eq!(counter.tombstone(60), None);
    }
}
