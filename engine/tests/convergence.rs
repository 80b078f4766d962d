//! Convergence properties of converge-engine
//!
//! Replicas that receive the same operations, in any order and with any
//! amount of redelivery, must end up showing the same state.

use converge_engine::{
    ObjectMessage, ObjectOperation, ObjectState, ObjectValue, SyncCoordinator, ROOT_OBJECT_ID,
};
use proptest::prelude::*;

const COUNTER: &str = "counter:shared@1";
const KEYS: [&str; 3] = ["a", "b", "c"];

/// A generated remote operation.
#[derive(Debug, Clone)]
enum Op {
    Set { key: usize, value: i32 },
    Remove { key: usize },
    Inc { amount: i32 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..KEYS.len(), -100i32..100).prop_map(|(key, value)| Op::Set { key, value }),
        (0..KEYS.len()).prop_map(|key| Op::Remove { key }),
        (-50i32..50).prop_map(|amount| Op::Inc { amount }),
    ]
}

/// Attach each op to a distinct serial from one of two sites.
fn to_messages(ops: &[Op]) -> Vec<ObjectMessage> {
    ops.iter()
        .enumerate()
        .map(|(i, op)| {
            let site = if i % 2 == 0 { "siteA" } else { "siteB" };
            let serial = format!("{:06}@{}", i + 1, site);
            let operation = match op {
                Op::Set { key, value } => ObjectOperation::map_set(
                    ROOT_OBJECT_ID,
                    KEYS[*key],
                    &ObjectValue::Number(*value as f64),
                ),
                Op::Remove { key } => ObjectOperation::map_remove(ROOT_OBJECT_ID, KEYS[*key]),
                Op::Inc { amount } => ObjectOperation::counter_inc(COUNTER, *amount as f64),
            };
            ObjectMessage::operation(operation, serial, site)
        })
        .collect()
}

fn replica() -> SyncCoordinator {
    let mut replica = SyncCoordinator::new("replica");
    replica.start_sync(false, 0);
    replica
}

/// Everything a reader can observe.
fn observe(replica: &SyncCoordinator) -> (Vec<(String, ObjectValue)>, f64) {
    let pool = replica.pool();
    let entries = pool.map_entries(ROOT_OBJECT_ID).unwrap();
    let counter = pool.counter_value(COUNTER).unwrap_or(0.0);
    (entries, counter)
}

fn arb_delivery() -> impl Strategy<Value = (Vec<ObjectMessage>, Vec<ObjectMessage>)> {
    prop::collection::vec(arb_op(), 1..40).prop_flat_map(|ops| {
        let messages = to_messages(&ops);
        (
            Just(messages.clone()).prop_shuffle(),
            Just(messages).prop_shuffle(),
        )
    })
}

proptest! {
    #[test]
    fn prop_any_delivery_order_converges((first, second) in arb_delivery()) {
        let mut a = replica();
        let mut b = replica();
        a.handle_operations(first, 0);
        b.handle_operations(second, 0);
        prop_assert_eq!(observe(&a), observe(&b));
    }

    #[test]
    fn prop_redelivery_is_idempotent((messages, _) in arb_delivery()) {
        let mut once = replica();
        once.handle_operations(messages.clone(), 0);

        let mut twice = replica();
        twice.handle_operations(messages.clone(), 0);
        twice.handle_operations(messages, 0);

        prop_assert_eq!(observe(&once), observe(&twice));
    }

    #[test]
    fn prop_counter_is_sum_of_distinct_increments(
        amounts in prop::collection::vec(-1000i32..1000, 1..50),
        initial in -100i32..100,
    ) {
        let ops: Vec<Op> = amounts.iter().map(|&amount| Op::Inc { amount }).collect();
        let mut messages = to_messages(&ops);
        messages.reverse();

        let mut r = SyncCoordinator::new("replica");
        r.handle_sync_messages(
            vec![
                ObjectMessage::sync_state(ObjectState::empty_map(ROOT_OBJECT_ID)),
                ObjectMessage::sync_state(ObjectState::counter(COUNTER, initial as f64)),
            ],
            None,
            0,
        );
        r.handle_operations(messages, 0);

        let expected = initial as f64 + amounts.iter().map(|&a| a as f64).sum::<f64>();
        prop_assert_eq!(r.pool().counter_value(COUNTER).unwrap(), expected);
    }

    #[test]
    fn prop_removed_key_stays_removed(
        stale in prop::collection::vec(1u32..500, 0..20),
        remove_at in 500u32..1000,
    ) {
        let mut r = replica();
        let remove = ObjectMessage::operation(
            ObjectOperation::map_remove(ROOT_OBJECT_ID, "k"),
            format!("{remove_at:06}"),
            "siteA",
        );
        r.handle_operations(vec![remove], 0);

        // Anything at or before the removal serial, including the removal serial itself.
        let writes = stale
            .iter()
            .chain(std::iter::once(&remove_at))
            .map(|serial| {
                ObjectMessage::operation(
                    ObjectOperation::map_set(ROOT_OBJECT_ID, "k", &ObjectValue::Number(*serial as f64)),
                    format!("{serial:06}"),
                    "siteB",
                )
            })
            .collect();
        r.handle_operations(writes, 0);

        prop_assert_eq!(r.pool().map_get(ROOT_OBJECT_ID, "k").unwrap(), None);
    }

    #[test]
    fn prop_operations_during_sync_are_applied_once(
        before in prop::collection::vec(-100i32..100, 0..20),
        during in prop::collection::vec(-100i32..100, 0..20),
        snapshot in -100i32..100,
    ) {
        let ops: Vec<Op> = before.iter().chain(during.iter()).map(|&amount| Op::Inc { amount }).collect();
        let messages = to_messages(&ops);
        let (early, late) = messages.split_at(before.len());

        let mut r = replica();
        r.handle_operations(early.to_vec(), 0);
        r.start_sync(true, 0);

        // Buffered until the snapshot completes.
        r.handle_operations(late.to_vec(), 0);
        let buffered_value = r.pool().counter_value(COUNTER).unwrap_or(0.0);
        let expected_before = before.iter().map(|&a| a as f64).sum::<f64>();
        prop_assert_eq!(buffered_value, expected_before);

        r.handle_sync_messages(
            vec![ObjectMessage::sync_state(ObjectState::counter(COUNTER, snapshot as f64))],
            Some("seq:"),
            0,
        );
        prop_assert!(r.is_synced());

        let expected = snapshot as f64 + during.iter().map(|&a| a as f64).sum::<f64>();
        prop_assert_eq!(r.pool().counter_value(COUNTER).unwrap(), expected);
    }
}
