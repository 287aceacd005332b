//! Property-based test generators using proptest.

use proptest::prelude::*;
use tessera_codec::Value;
use tessera_protocol::{Attributes, Operation};

/// Strategy for namespace names drawn from a small fixed set, so generated
/// transactions collide often.
pub fn namespace_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["todos", "users", "tags"]).prop_map(str::to_string)
}

/// Strategy for entity ids drawn from a small fixed set.
pub fn entity_id_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["1", "2", "3"]).prop_map(str::to_string)
}

/// Strategy for scalar attribute values.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        "[a-z]{0,8}".prop_map(Value::from),
    ]
}

/// Strategy for attribute maps with one to three entries.
pub fn attributes_strategy() -> impl Strategy<Value = Attributes> {
    prop::collection::btree_map("[a-z]{1,6}", scalar_strategy(), 1..4)
}

/// Strategy for a single valid operation.
pub fn operation_strategy() -> impl Strategy<Value = Operation> {
    (
        namespace_strategy(),
        entity_id_strategy(),
        attributes_strategy(),
        0..5u8,
    )
        .prop_map(|(ns, id, attrs, kind)| match kind {
            0 => Operation::update(&ns, &id, attrs),
            1 => Operation::merge(&ns, &id, attrs),
            2 => Operation::link(&ns, &id, "links", &[id.as_str()]),
            3 => Operation::unlink(&ns, &id, "links", &[id.as_str()]),
            _ => Operation::delete(&ns, &id),
        })
}

/// Strategy for a non-empty transaction.
pub fn transaction_strategy() -> impl Strategy<Value = Vec<Operation>> {
    prop::collection::vec(operation_strategy(), 1..4)
}

/// Outcome script for `count` transactions: the order in which the server
/// answers them (a permutation of `0..count`) and whether each is accepted.
pub fn outcome_schedule_strategy(count: usize) -> impl Strategy<Value = (Vec<usize>, Vec<bool>)> {
    (
        Just((0..count).collect::<Vec<_>>()).prop_shuffle(),
        prop::collection::vec(any::<bool>(), count),
    )
}

/// Strategy for a batch of transactions together with an outcome script.
pub fn transactions_with_outcomes_strategy(
) -> impl Strategy<Value = (Vec<Vec<Operation>>, Vec<usize>, Vec<bool>)> {
    (1..8usize).prop_flat_map(|count| {
        (
            prop::collection::vec(transaction_strategy(), count),
            outcome_schedule_strategy(count),
        )
            .prop_map(|(transactions, (order, accepted))| (transactions, order, accepted))
    })
}

/// Strategy for a query shape over one or two namespaces, with an optional
/// `where` equality.
pub fn query_shape_strategy() -> impl Strategy<Value = serde_json::Value> {
    prop::collection::btree_map(
        namespace_strategy(),
        prop::option::of(any::<bool>()),
        1..3,
    )
    .prop_map(|namespaces| {
        let mut shape = serde_json::Map::new();
        for (ns, done) in namespaces {
            let options = match done {
                Some(done) => serde_json::json!({ "where": { "done": done } }),
                None => serde_json::json!({}),
            };
            shape.insert(ns, options);
        }
        serde_json::Value::Object(shape)
    })
}
