use crate::collector::now_seconds;
use crate::collector::consumer_offsets::ConsumerKey;
use crate::metrics::MetricSink;
use crate::metrics::definitions::EVENT_TYPE_CONSUMER_LAG;
use crate::metrics::types::{Event, Labels, Severity};
use std::collections::HashSet;
use tracing::debug;

/// Raises one negative-lag event per (group, topic, partition) per cycle.
#[derive(Debug, Default)]
pub struct AnomalyReporter {
    reported: HashSet<ConsumerKey>,
}

impl AnomalyReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether an event was sent.
    pub fn negative_lag(
        &mut self,
        sink: &dyn MetricSink,
        key: &ConsumerKey,
        consumer_offset: i64,
        highwater_offset: i64,
        tags: &Labels,
    ) -> bool {
        if !self.reported.insert(key.clone()) {
            return false;
        }

        let group = &key.group;
        let topic = &key.tp.topic;
        let partition = key.tp.partition;
        let text = format!(
            "Consumer group: {group}, topic: {topic}, partition: {partition} has negative consumer lag. \
             This should never happen and will result in the consumer skipping new messages until \
             the lag turns positive."
        );
        debug!(
            group = %group,
            topic = %topic,
            partition,
            consumer_offset,
            highwater_offset,
            "Negative consumer lag"
        );

        sink.event(Event {
            timestamp: now_seconds(),
            event_type: EVENT_TYPE_CONSUMER_LAG,
            title: format!("Negative consumer lag for group: {group}."),
            text,
            tags: tags.clone(),
            severity: Severity::Error,
            aggregation_key: format!("{group}:{topic}:{partition}"),
        });
        true
    }

    pub fn reported(&self) -> usize {
        self.reported.len()
    }
}
