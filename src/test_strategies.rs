use crate::collector::consumer_offsets::ConsumerKey;
use crate::collector::lag_calculator::LagRecord;
use proptest::prelude::*;

/// Arbitrary topic name (valid Kafka topic chars)
pub fn arb_topic() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9._-]{0,20}"
}

/// Arbitrary non-empty group ID
pub fn arb_group_id() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9._-]{0,48}"
}

/// Committed offset anywhere around the highwater mark, including past it.
pub fn arb_offsets() -> impl Strategy<Value = (i64, i64)> {
    (0..i64::MAX / 4).prop_flat_map(|highwater| (0..=highwater.saturating_add(1000), Just(highwater)))
}

pub fn arb_lag_record() -> impl Strategy<Value = LagRecord> {
    (
        arb_group_id(),
        arb_topic(),
        0i32..64,
        arb_offsets(),
        proptest::option::of(-1.0e3f64..1.0e6),
    )
        .prop_map(|(group, topic, partition, (consumer, highwater), seconds)| LagRecord {
            key: ConsumerKey::new(group, topic, partition),
            consumer_offset: consumer,
            highwater_offset: highwater,
            offset_lag: highwater - consumer,
            time_lag_seconds: seconds,
        })
}
