use crate::collector::anomaly::AnomalyReporter;
use crate::collector::budget::ContextBudget;
use crate::collector::consumer_offsets::ConsumerKey;
use crate::collector::lag_calculator::LagComputation;
use crate::kafka::TopicPartition;
use crate::metrics::MetricSink;
use crate::metrics::definitions::{
    HELP_BROKER_OFFSET, HELP_CONSUMER_LAG, HELP_CONSUMER_LAG_SECONDS, HELP_CONSUMER_OFFSET,
    LABEL_CONSUMER_GROUP, LABEL_INSTANCE, LABEL_PARTITION, LABEL_SOURCE, LABEL_TOPIC, METRIC_BROKER_OFFSET,
    METRIC_CONSUMER_LAG, METRIC_CONSUMER_LAG_SECONDS, METRIC_CONSUMER_OFFSET, SOURCE_KAFKA,
};
use crate::metrics::types::{Labels, MetricPoint};
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmissionSummary {
    pub discovered: usize,
    pub emitted: usize,
    pub events: usize,
    pub truncated: bool,
}

/// Emits one cycle's data points in priority order under a context budget:
/// highwater offsets, consumer offsets, offset lags, then time lags.
pub struct Reporter<'a> {
    sink: &'a dyn MetricSink,
    instance: &'a str,
    tags: &'a Labels,
}

impl<'a> Reporter<'a> {
    pub fn new(sink: &'a dyn MetricSink, instance: &'a str, tags: &'a Labels) -> Self {
        Self {
            sink,
            instance,
            tags,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn emit(
        &self,
        highwater_offsets: &BTreeMap<TopicPartition, i64>,
        lags: &LagComputation,
        ceiling: usize,
    ) -> EmissionSummary {
        let mut budget = ContextBudget::new(ceiling);
        let mut anomalies = AnomalyReporter::new();

        for (tp, offset) in highwater_offsets {
            if budget.admit() {
                self.sink.gauge(MetricPoint::gauge(
                    METRIC_BROKER_OFFSET,
                    self.partition_labels(tp),
                    *offset as f64,
                    HELP_BROKER_OFFSET,
                ));
            }
        }

        for (key, offset) in &lags.consumer_offsets {
            if budget.admit() {
                self.sink.gauge(MetricPoint::gauge(
                    METRIC_CONSUMER_OFFSET,
                    self.consumer_labels(key),
                    *offset as f64,
                    HELP_CONSUMER_OFFSET,
                ));
            }
        }

        for record in &lags.records {
            if record.is_negative() {
                anomalies.negative_lag(
                    self.sink,
                    &record.key,
                    record.consumer_offset,
                    record.highwater_offset,
                    &self.consumer_labels(&record.key),
                );
            }
            if budget.admit() {
                self.sink.gauge(MetricPoint::gauge(
                    METRIC_CONSUMER_LAG,
                    self.consumer_labels(&record.key),
                    record.offset_lag as f64,
                    HELP_CONSUMER_LAG,
                ));
            }
        }

        for record in &lags.records {
            let Some(seconds) = record.time_lag_seconds else {
                continue;
            };
            if budget.admit() {
                self.sink.gauge(MetricPoint::gauge(
                    METRIC_CONSUMER_LAG_SECONDS,
                    self.consumer_labels(&record.key),
                    seconds,
                    HELP_CONSUMER_LAG_SECONDS,
                ));
            }
        }

        let truncated = budget.warn_if_truncated(self.instance);
        EmissionSummary {
            discovered: budget.discovered(),
            emitted: budget.emitted(),
            events: anomalies.reported(),
            truncated,
        }
    }

    fn partition_labels(&self, tp: &TopicPartition) -> Labels {
        let mut labels = self.tags.clone();
        labels.insert(LABEL_INSTANCE.to_string(), self.instance.to_string());
        labels.insert(LABEL_TOPIC.to_string(), tp.topic.clone());
        labels.insert(LABEL_PARTITION.to_string(), tp.partition.to_string());
        labels
    }

    fn consumer_labels(&self, key: &ConsumerKey) -> Labels {
        let mut labels = self.partition_labels(&key.tp);
        labels.insert(LABEL_CONSUMER_GROUP.to_string(), key.group.clone());
        labels.insert(LABEL_SOURCE.to_string(), SOURCE_KAFKA.to_string());
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::lag_calculator::LagRecord;
    use crate::metrics::RecordingSink;

    fn record(group: &str, partition: i32, consumer: i64, highwater: i64, seconds: Option<f64>) -> LagRecord {
        LagRecord {
            key: ConsumerKey::new(group, "orders", partition),
            consumer_offset: consumer,
            highwater_offset: highwater,
            offset_lag: highwater - consumer,
            time_lag_seconds: seconds,
        }
    }

    fn lags(records: Vec<LagRecord>) -> LagComputation {
        LagComputation {
            consumer_offsets: records
                .iter()
                .map(|r| (r.key.clone(), r.consumer_offset))
                .collect(),
            records,
            ..LagComputation::default()
        }
    }

    fn highwater(records: &[LagRecord]) -> BTreeMap<TopicPartition, i64> {
        records
            .iter()
            .map(|r| (r.key.tp.clone(), r.highwater_offset))
            .collect()
    }

    #[test]
    fn test_emits_all_points_with_labels() {
        let sink = RecordingSink::default();
        let tags = Labels::from([("env".to_string(), "prod".to_string())]);
        let records = vec![record("billing", 0, 100, 150, Some(10.0))];

        let summary =
            Reporter::new(&sink, "main", &tags).emit(&highwater(&records), &lags(records), 200);

        assert_eq!(summary.emitted, 4);
        assert!(!summary.truncated);
        let names: Vec<_> = sink.points().iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec![
                METRIC_BROKER_OFFSET,
                METRIC_CONSUMER_OFFSET,
                METRIC_CONSUMER_LAG,
                METRIC_CONSUMER_LAG_SECONDS
            ]
        );

        let points = sink.points();
        assert_eq!(points[0].labels.get("consumer_group"), None);
        assert_eq!(points[0].labels["env"], "prod");
        assert_eq!(points[0].labels["instance"], "main");
        assert_eq!(points[2].labels["consumer_group"], "billing");
        assert_eq!(points[2].labels["partition"], "0");
        assert_eq!(points[2].labels["source"], "kafka");
    }

    #[test]
    fn test_truncation_drops_lags_before_raw_offsets() {
        let sink = RecordingSink::default();
        let records = vec![record("billing", 0, 100, 150, Some(1.0))];

        // candidates: broker offset, consumer offset, lag, lag seconds + one more highwater
        let mut highwater_offsets = highwater(&records);
        highwater_offsets.insert(TopicPartition::new("orders", 1), 7);

        let summary = Reporter::new(&sink, "main", &Labels::new()).emit(&highwater_offsets, &lags(records), 3);

        assert_eq!(summary.discovered, 5);
        assert_eq!(summary.emitted, 3);
        assert!(summary.truncated);
        let names: Vec<_> = sink.points().iter().map(|p| p.name).collect();
        assert_eq!(names, vec![METRIC_BROKER_OFFSET, METRIC_BROKER_OFFSET, METRIC_CONSUMER_OFFSET]);
    }

    #[test]
    fn test_negative_lag_reported_and_raises_one_event() {
        let sink = RecordingSink::default();
        let records = vec![record("billing", 0, 300, 200, None)];

        let summary = Reporter::new(&sink, "main", &Labels::new()).emit(&highwater(&records), &lags(records), 200);

        assert_eq!(summary.events, 1);
        assert_eq!(sink.events().len(), 1);
        assert_eq!(sink.values(METRIC_CONSUMER_LAG), vec![-100.0]);
        assert!(sink.values(METRIC_CONSUMER_LAG_SECONDS).is_empty());
    }

    #[test]
    fn test_event_raised_even_when_lag_is_truncated() {
        let sink = RecordingSink::default();
        let records = vec![record("billing", 0, 300, 200, None)];

        Reporter::new(&sink, "main", &Labels::new()).emit(&highwater(&records), &lags(records), 1);

        assert_eq!(sink.events().len(), 1);
        assert!(sink.values(METRIC_CONSUMER_LAG).is_empty());
    }

    #[test]
    fn test_instances_sharing_a_partition_render_distinct_series() {
        use crate::metrics::RegistrySink;
        use crate::metrics::registry::MetricsRegistry;
        use std::sync::Arc;
        use std::time::Duration;

        let registry = Arc::new(MetricsRegistry::new());
        let records = vec![record("billing", 0, 100, 150, None)];
        for instance in ["a", "b"] {
            let sink = RegistrySink::new(Arc::clone(&registry), instance);
            registry.begin_cycle(instance);
            Reporter::new(&sink, instance, &Labels::new())
                .emit(&highwater(&records), &lags(records.clone()), 200);
            registry.finish_cycle(instance, Duration::ZERO);
        }

        let output = registry.render_prometheus();
        let broker_lines: Vec<_> = output
            .lines()
            .filter(|l| l.starts_with("kafka_broker_offset{"))
            .collect();
        assert_eq!(broker_lines.len(), 2);
        assert_ne!(broker_lines[0], broker_lines[1]);
        assert!(output.contains(
            "kafka_broker_offset{instance=\"a\",partition=\"0\",topic=\"orders\"} 150"
        ));
        assert!(output.contains(
            "kafka_broker_offset{instance=\"b\",partition=\"0\",topic=\"orders\"} 150"
        ));
    }

    mod proptests {
        use super::*;
        use crate::test_strategies::arb_lag_record;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn emitted_never_exceeds_ceiling(
                records in prop::collection::vec(arb_lag_record(), 0..40),
                ceiling in 0usize..100,
            ) {
                let sink = RecordingSink::default();
                let highwater_offsets = highwater(&records);
                let negative = records.iter().filter(|r| r.is_negative()).count();
                let lags = lags(records);

                let summary = Reporter::new(&sink, "main", &Labels::new())
                    .emit(&highwater_offsets, &lags, ceiling);

                prop_assert!(summary.emitted <= ceiling);
                prop_assert_eq!(sink.points().len(), summary.emitted);
                prop_assert_eq!(summary.truncated, summary.discovered > ceiling);
                prop_assert!(summary.events <= negative);
            }
        }
    }
}
