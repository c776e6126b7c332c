use crate::collector::consumer_offsets::{ConsumerKey, ConsumerOffsets};
use crate::collector::timestamp_history::TimestampHistory;
use crate::kafka::{BrokerDirectory, TopicPartition};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct LagRecord {
    pub key: ConsumerKey,
    pub consumer_offset: i64,
    pub highwater_offset: i64,
    /// Highwater minus committed offset. Negative when the group committed
    /// past the highwater mark.
    pub offset_lag: i64,
    pub time_lag_seconds: Option<f64>,
}

impl LagRecord {
    pub fn is_negative(&self) -> bool {
        self.offset_lag < 0
    }
}

/// Everything reportable from one cycle's readings.
#[derive(Debug, Default, Clone)]
pub struct LagComputation {
    /// Consumer offsets whose partition exists in the cluster, in key order.
    pub consumer_offsets: Vec<(ConsumerKey, i64)>,
    pub records: Vec<LagRecord>,
    /// Consumer offsets for partitions the cluster does not know about.
    pub skipped_unknown_partitions: usize,
    /// Consumer offsets without a highwater offset this cycle.
    pub missing_highwater: usize,
}

pub struct LagCalculator;

impl LagCalculator {
    pub fn calculate(
        consumer_offsets: &ConsumerOffsets,
        highwater_offsets: &BTreeMap<TopicPartition, i64>,
        history: &TimestampHistory,
        directory: &dyn BrokerDirectory,
    ) -> LagComputation {
        let mut computation = LagComputation::default();
        let mut topology: HashMap<&str, Option<Vec<i32>>> = HashMap::new();

        for (key, &consumer_offset) in consumer_offsets {
            let tp = &key.tp;
            let known = topology
                .entry(tp.topic.as_str())
                .or_insert_with(|| directory.partitions_of(&tp.topic))
                .as_ref()
                .is_some_and(|partitions| partitions.contains(&tp.partition));
            if !known {
                warn!(
                    group = %key.group,
                    topic = %tp.topic,
                    partition = tp.partition,
                    "Consumer group has offsets for a partition missing from the cluster, skipping it"
                );
                computation.skipped_unknown_partitions += 1;
                directory.request_metadata_refresh();
                continue;
            }

            computation.consumer_offsets.push((key.clone(), consumer_offset));

            let Some(&highwater_offset) = highwater_offsets.get(tp) else {
                warn!(
                    group = %key.group,
                    topic = %tp.topic,
                    partition = tp.partition,
                    "No highwater offset for partition (leader failover?), cannot compute lag"
                );
                computation.missing_highwater += 1;
                continue;
            };

            computation.records.push(LagRecord {
                key: key.clone(),
                consumer_offset,
                highwater_offset,
                offset_lag: highwater_offset - consumer_offset,
                time_lag_seconds: time_lag(history, tp, consumer_offset, highwater_offset),
            });
        }

        computation
    }
}

fn time_lag(
    history: &TimestampHistory,
    tp: &TopicPartition,
    consumer_offset: i64,
    highwater_offset: i64,
) -> Option<f64> {
    let produced_at = history.timestamp_at(tp, highwater_offset)?;
    let Some(consumed_at) = history.interpolate(tp, consumer_offset) else {
        debug!(topic = %tp.topic, partition = tp.partition, "Time lag unavailable");
        return None;
    };
    Some(produced_at - consumed_at)
}
