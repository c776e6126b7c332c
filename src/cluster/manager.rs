use crate::cache::PersistentCache;
use crate::collector::consumer_offsets::{
    ConsumerGroupSpec, ConsumerOffsetCollector, ConsumerOffsets,
};
use crate::collector::highwater::{HighwaterCollection, HighwaterCollector, HighwaterScope};
use crate::collector::lag_calculator::LagCalculator;
use crate::collector::reporter::Reporter;
use crate::collector::timestamp_history::TimestampHistory;
use crate::collector::{RequestSettings, now_seconds};
use crate::config::{ExporterConfig, InstanceConfig};
use crate::error::Result;
use crate::kafka::client::KafkaClient;
use crate::kafka::{BrokerDirectory, TopicPartition, WireClient};
use crate::metrics::registry::MetricsRegistry;
use crate::metrics::types::Labels;
use crate::metrics::{MetricSink, RegistrySink};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};

/// Default timeout for a single collection cycle (should be less than `poll_interval`)
const DEFAULT_COLLECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Collaborators of a manager. Production wires them to rdkafka, the file
/// cache and the registry; tests substitute in-memory versions.
pub struct Backends {
    pub directory: Arc<dyn BrokerDirectory>,
    pub wire: Arc<dyn WireClient>,
    pub cache: Arc<dyn PersistentCache>,
    pub sink: Arc<dyn MetricSink>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub groups_attempted: usize,
    pub groups_skipped: usize,
    pub highwater_offsets: usize,
    pub partitions_skipped: usize,
    pub contexts_discovered: usize,
    pub contexts_emitted: usize,
    pub events: usize,
}

/// Runs collection cycles for one configured instance.
pub struct ClusterManager {
    instance: String,
    tags: Labels,
    groups: BTreeMap<String, ConsumerGroupSpec>,
    monitor_unlisted: bool,
    monitor_all_highwater: bool,
    max_partition_contexts: usize,
    cache_key: String,
    consumers: ConsumerOffsetCollector,
    highwater: HighwaterCollector,
    directory: Arc<dyn BrokerDirectory>,
    wire: Arc<dyn WireClient>,
    cache: Arc<dyn PersistentCache>,
    sink: Arc<dyn MetricSink>,
    registry: Arc<MetricsRegistry>,
    clock: fn() -> f64,
    poll_interval: Duration,
    max_backoff: Duration,
    collection_timeout: Duration,
}

impl ClusterManager {
    pub fn new(
        config: &InstanceConfig,
        exporter_config: &ExporterConfig,
        registry: Arc<MetricsRegistry>,
        cache: Arc<dyn PersistentCache>,
    ) -> Result<Self> {
        let client = Arc::new(KafkaClient::new(config)?);
        let backends = Backends {
            directory: Arc::clone(&client) as Arc<dyn BrokerDirectory>,
            wire: client,
            cache,
            sink: Arc::new(RegistrySink::new(Arc::clone(&registry), config.name.clone())),
        };
        Ok(Self::with_backends(config, exporter_config, registry, backends))
    }

    pub fn with_backends(
        config: &InstanceConfig,
        exporter_config: &ExporterConfig,
        registry: Arc<MetricsRegistry>,
        backends: Backends,
    ) -> Self {
        let settings = RequestSettings {
            timeout: config.request_timeout,
            max_concurrent: config.max_concurrent_requests,
            batch_size: config.broker_requests_batch_size,
        };
        let Backends {
            directory,
            wire,
            cache,
            sink,
        } = backends;

        // Collection timeout should be less than poll_interval to avoid overlap,
        // but must leave room for a few sequential requests.
        let min_viable = config.request_timeout * 3 + Duration::from_secs(5);
        let collection_timeout = if exporter_config.poll_interval > Duration::from_secs(10) {
            exporter_config
                .poll_interval
                .saturating_sub(Duration::from_secs(5))
                .max(min_viable)
        } else {
            DEFAULT_COLLECTION_TIMEOUT
                .min(exporter_config.poll_interval)
                .max(min_viable)
        };

        if collection_timeout > exporter_config.poll_interval {
            warn!(
                instance = %config.name,
                poll_interval = ?exporter_config.poll_interval,
                request_timeout = ?config.request_timeout,
                collection_timeout = ?collection_timeout,
                "collection_timeout exceeds poll_interval; consider increasing poll_interval"
            );
        }

        info!(
            instance = %config.name,
            groups = config.consumer_groups.len(),
            monitor_unlisted_consumer_groups = config.monitor_unlisted_consumer_groups,
            monitor_all_broker_highwatermarks = config.monitor_all_broker_highwatermarks,
            max_partition_contexts = config.max_partition_contexts,
            poll_interval = ?exporter_config.poll_interval,
            "Created cluster manager"
        );

        Self {
            instance: config.name.clone(),
            tags: config.labels(),
            groups: config.group_specs(),
            monitor_unlisted: config.monitor_unlisted_consumer_groups,
            monitor_all_highwater: config.monitor_all_broker_highwatermarks,
            max_partition_contexts: config.max_partition_contexts,
            cache_key: config.cache_key(),
            consumers: ConsumerOffsetCollector::new(
                Arc::clone(&directory),
                Arc::clone(&wire),
                settings,
            ),
            highwater: HighwaterCollector::new(
                Arc::clone(&directory),
                Arc::clone(&wire),
                settings,
                config.tolerate_broker_failures,
            ),
            directory,
            wire,
            cache,
            sink,
            registry,
            clock: now_seconds,
            poll_interval: exporter_config.poll_interval,
            max_backoff: Duration::from_secs(300),
            collection_timeout,
        }
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: fn() -> f64) -> Self {
        self.clock = clock;
        self
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    #[instrument(skip(self, shutdown), fields(instance = %self.instance))]
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("Starting collection loop");

        let mut interval = tokio::time::interval(self.poll_interval);
        let mut consecutive_errors = 0u32;
        let mut current_backoff = Duration::from_secs(1);

        self.registry.set_healthy(true);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Wrap collect_once with a timeout to prevent hangs
                    let collection_result = tokio::time::timeout(
                        self.collection_timeout,
                        self.collect_once()
                    ).await;

                    match collection_result {
                        Ok(Ok(_)) => {
                            consecutive_errors = 0;
                            current_backoff = Duration::from_secs(1);
                            self.registry.set_healthy(true);
                        }
                        Ok(Err(e)) => {
                            consecutive_errors += 1;
                            error!(
                                error = %e,
                                consecutive_errors = consecutive_errors,
                                "Collection failed"
                            );

                            if consecutive_errors >= 3 {
                                self.registry.set_healthy(false);

                                let backoff = current_backoff.min(self.max_backoff);
                                warn!(
                                    backoff_secs = backoff.as_secs(),
                                    "Applying backoff due to consecutive errors"
                                );

                                tokio::time::sleep(backoff).await;
                                current_backoff = (current_backoff * 2).min(self.max_backoff);
                            }
                        }
                        Err(_timeout) => {
                            consecutive_errors += 1;
                            error!(
                                timeout_secs = self.collection_timeout.as_secs(),
                                consecutive_errors = consecutive_errors,
                                "Collection timed out"
                            );

                            if consecutive_errors >= 3 {
                                self.registry.set_healthy(false);
                            }
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        self.registry.remove_instance(&self.instance);
        info!("Collection loop stopped");
    }

    /// One full cycle: consumer offsets, highwater offsets, history update,
    /// lag computation and emission. Nothing is reported when a fatal error
    /// ends the cycle early.
    #[instrument(skip(self), fields(instance = %self.instance))]
    pub async fn collect_once(&self) -> Result<CycleSummary> {
        let start = Instant::now();

        self.wire.sync_metadata().await?;

        // 1. Consumer offsets: failed groups are skipped
        let step = Instant::now();
        let consumers = self
            .consumers
            .collect(&self.groups, self.monitor_unlisted)
            .await?;
        let consumer_ms = step.elapsed().as_millis();

        // 2. Highwater offsets: any error is fatal
        let step = Instant::now();
        let mut history = TimestampHistory::load(self.cache.as_ref(), &self.cache_key);
        let highwater = self
            .collect_highwater(&consumers.offsets, &mut history)
            .await?;
        let highwater_ms = step.elapsed().as_millis();

        if let Err(e) = history.save(self.cache.as_ref(), &self.cache_key) {
            warn!(error = %e, "Failed to persist broker timestamps");
        }

        // 3. Lags, then emission in priority order
        let step = Instant::now();
        let lags = LagCalculator::calculate(
            &consumers.offsets,
            &highwater.offsets,
            &history,
            self.directory.as_ref(),
        );

        self.registry.begin_cycle(&self.instance);
        let emission = Reporter::new(self.sink.as_ref(), &self.instance, &self.tags).emit(
            &highwater.offsets,
            &lags,
            self.max_partition_contexts,
        );
        self.registry.finish_cycle(&self.instance, start.elapsed());
        let report_ms = step.elapsed().as_millis();

        let summary = CycleSummary {
            groups_attempted: consumers.groups_attempted,
            groups_skipped: consumers.groups_skipped,
            highwater_offsets: highwater.offsets.len(),
            partitions_skipped: lags.skipped_unknown_partitions + lags.missing_highwater,
            contexts_discovered: emission.discovered,
            contexts_emitted: emission.emitted,
            events: emission.events,
        };

        info!(
            groups_attempted = summary.groups_attempted,
            groups_skipped = summary.groups_skipped,
            consumer_offsets = consumers.offsets.len(),
            highwater_offsets = summary.highwater_offsets,
            partitions_skipped = summary.partitions_skipped,
            contexts_discovered = summary.contexts_discovered,
            contexts_emitted = summary.contexts_emitted,
            negative_lag_events = summary.events,
            consumer_offsets_ms = %consumer_ms,
            highwater_offsets_ms = %highwater_ms,
            report_ms = %report_ms,
            "Collection cycle completed, took {} seconds",
            start.elapsed().as_secs_f32()
        );

        Ok(summary)
    }

    async fn collect_highwater(
        &self,
        consumer_offsets: &ConsumerOffsets,
        history: &mut TimestampHistory,
    ) -> Result<HighwaterCollection> {
        if consumer_offsets.len() >= self.max_partition_contexts {
            warn!(
                consumer_offsets = consumer_offsets.len(),
                max_partition_contexts = self.max_partition_contexts,
                "Context limit reached, skipping highwater offset collection"
            );
            return Ok(HighwaterCollection::default());
        }

        let consumed: BTreeSet<TopicPartition> =
            consumer_offsets.keys().map(|key| key.tp.clone()).collect();
        let scope = if self.monitor_all_highwater {
            HighwaterScope::AllPartitions
        } else {
            HighwaterScope::Consumed(&consumed)
        };

        self.highwater
            .collect(
                scope,
                self.max_partition_contexts - consumer_offsets.len(),
                history,
                (self.clock)(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::Config;
    use crate::error::LagError;
    use crate::kafka::mock::MockCluster;
    use crate::metrics::RecordingSink;
    use crate::metrics::definitions::{
        METRIC_BROKER_OFFSET, METRIC_CONSUMER_LAG, METRIC_CONSUMER_LAG_SECONDS,
        METRIC_CONSUMER_OFFSET,
    };

    const T0: f64 = 1_700_000_000.0;

    fn observed_at_t0_plus_10() -> f64 {
        T0 + 10.0
    }

    struct Harness {
        cluster: Arc<MockCluster>,
        cache: Arc<MemoryCache>,
        sink: Arc<RecordingSink>,
        registry: Arc<MetricsRegistry>,
        config: InstanceConfig,
        exporter: ExporterConfig,
    }

    impl Harness {
        fn new(instance_toml: &str) -> Self {
            let content = format!(
                "[exporter]\npoll_interval = \"15s\"\n\n[[instances]]\nname = \"main\"\n\
                 kafka_connect_str = \"localhost:9092\"\nrequest_timeout = \"1s\"\n{instance_toml}"
            );
            let mut config = Config::parse(&content).unwrap();
            Self {
                cluster: Arc::new(MockCluster::new()),
                cache: Arc::new(MemoryCache::default()),
                sink: Arc::new(RecordingSink::default()),
                registry: Arc::new(MetricsRegistry::new()),
                config: config.instances.remove(0),
                exporter: config.exporter,
            }
        }

        fn manager(&self) -> ClusterManager {
            let backends = Backends {
                directory: Arc::clone(&self.cluster) as Arc<dyn BrokerDirectory>,
                wire: Arc::clone(&self.cluster) as Arc<dyn WireClient>,
                cache: Arc::clone(&self.cache) as Arc<dyn PersistentCache>,
                sink: Arc::clone(&self.sink) as Arc<dyn MetricSink>,
            };
            ClusterManager::with_backends(
                &self.config,
                &self.exporter,
                Arc::clone(&self.registry),
                backends,
            )
            .with_clock(observed_at_t0_plus_10)
        }

        fn seed_history(&self, points: &[(&str, i32, i64, f64)]) {
            let mut history = TimestampHistory::new();
            for (topic, partition, offset, ts) in points {
                history.record(&TopicPartition::new(*topic, *partition), *offset, *ts);
            }
            history
                .save(self.cache.as_ref(), &self.config.cache_key())
                .unwrap();
        }

        fn history(&self) -> TimestampHistory {
            TimestampHistory::load(self.cache.as_ref(), &self.config.cache_key())
        }
    }

    const BILLING_ORDERS: &str = "[instances.consumer_groups.billing]\norders = [0]\n";

    #[tokio::test]
    async fn test_lag_and_time_lag_from_history() {
        let h = Harness::new(BILLING_ORDERS);
        h.cluster.add_partition("orders", 0, 1, 150);
        h.cluster.add_group("billing", 1, &[("orders", 0, 100)]);
        h.seed_history(&[("orders", 0, 100, T0), ("orders", 0, 200, T0 + 10.0)]);

        let summary = h.manager().collect_once().await.unwrap();

        assert_eq!(h.sink.values(METRIC_BROKER_OFFSET), vec![150.0]);
        assert_eq!(h.sink.values(METRIC_CONSUMER_OFFSET), vec![100.0]);
        assert_eq!(h.sink.values(METRIC_CONSUMER_LAG), vec![50.0]);
        assert_eq!(h.sink.values(METRIC_CONSUMER_LAG_SECONDS), vec![10.0]);
        assert_eq!(summary.contexts_emitted, 4);
        assert!(h.sink.events().is_empty());

        let tp = TopicPartition::new("orders", 0);
        assert_eq!(h.history().timestamp_at(&tp, 150), Some(T0 + 10.0));
        assert_eq!(h.history().len(&tp), 3);
    }

    #[tokio::test]
    async fn test_negative_lag_emits_gauge_and_single_event() {
        let h = Harness::new(BILLING_ORDERS);
        h.cluster.add_partition("orders", 0, 1, 200);
        h.cluster.add_group("billing", 1, &[("orders", 0, 300)]);

        let summary = h.manager().collect_once().await.unwrap();

        assert_eq!(h.sink.values(METRIC_CONSUMER_LAG), vec![-100.0]);
        assert_eq!(summary.events, 1);
        let events = h.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].aggregation_key, "billing:orders:0");
    }

    #[tokio::test]
    async fn test_first_cycle_has_no_time_lag() {
        let h = Harness::new(BILLING_ORDERS);
        h.cluster.add_partition("orders", 0, 1, 40);
        h.cluster.add_group("billing", 1, &[("orders", 0, 10)]);

        h.manager().collect_once().await.unwrap();

        assert_eq!(h.sink.values(METRIC_CONSUMER_LAG), vec![30.0]);
        assert!(h.sink.values(METRIC_CONSUMER_LAG_SECONDS).is_empty());
    }

    #[tokio::test]
    async fn test_context_ceiling_truncates_lags_first() {
        let h = Harness::new(
            "max_partition_contexts = 3\n[instances.consumer_groups.billing]\norders = [0, 1]\n",
        );
        h.cluster.add_partition("orders", 0, 1, 10);
        h.cluster.add_partition("orders", 1, 1, 20);
        h.cluster.add_group("billing", 1, &[("orders", 0, 5), ("orders", 1, 15)]);

        let summary = h.manager().collect_once().await.unwrap();

        // 2 highwater + 2 consumer + 2 lag candidates
        assert_eq!(summary.contexts_discovered, 6);
        assert_eq!(summary.contexts_emitted, 3);
        let names: Vec<_> = h.sink.points().iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec![METRIC_BROKER_OFFSET, METRIC_BROKER_OFFSET, METRIC_CONSUMER_OFFSET]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_timeout_fails_cycle_and_reports_nothing() {
        let h = Harness::new("monitor_all_broker_highwatermarks = true\n[instances.consumer_groups.billing]\n");
        for broker in 1..=5 {
            h.cluster.add_partition("orders", broker, broker, 100);
        }
        h.cluster.add_group("billing", 1, &[("orders", 1, 50)]);
        h.cluster.hang_broker(3);

        let err = h.manager().collect_once().await.unwrap_err();

        assert!(matches!(err, LagError::HighwaterUnavailable(_)));
        assert!(h.sink.points().is_empty());
        assert!(h.sink.events().is_empty());
        assert!(h.history().is_empty());
    }

    #[tokio::test]
    async fn test_failed_group_is_skipped_and_others_reported() {
        let h = Harness::new(
            "[instances.consumer_groups.billing]\n[instances.consumer_groups.audit]\n",
        );
        h.cluster.add_partition("orders", 0, 1, 10);
        h.cluster.add_group("billing", 1, &[("orders", 0, 5)]);
        h.cluster.add_group("audit", 1, &[("orders", 0, 1)]);
        h.cluster.fail_group("audit");

        let summary = h.manager().collect_once().await.unwrap();

        assert_eq!(summary.groups_attempted, 2);
        assert_eq!(summary.groups_skipped, 1);
        assert_eq!(h.sink.values(METRIC_CONSUMER_LAG), vec![5.0]);
    }

    #[tokio::test]
    async fn test_consumer_offsets_at_ceiling_skip_highwater() {
        let h = Harness::new(
            "max_partition_contexts = 1\n[instances.consumer_groups.billing]\norders = [0]\n",
        );
        h.cluster.add_partition("orders", 0, 1, 10);
        h.cluster.add_group("billing", 1, &[("orders", 0, 5)]);

        let summary = h.manager().collect_once().await.unwrap();

        assert_eq!(summary.highwater_offsets, 0);
        assert!(h.cluster.list_offsets_requests().is_empty());
        assert_eq!(h.sink.values(METRIC_CONSUMER_OFFSET), vec![5.0]);
    }

    #[tokio::test]
    async fn test_only_consumed_partitions_get_highwater_by_default() {
        let h = Harness::new(BILLING_ORDERS);
        h.cluster.add_partition("orders", 0, 1, 10);
        h.cluster.add_partition("orders", 1, 1, 10);
        h.cluster.add_partition("payments", 0, 2, 10);
        h.cluster.add_group("billing", 1, &[("orders", 0, 5)]);

        h.manager().collect_once().await.unwrap();

        assert_eq!(h.sink.values(METRIC_BROKER_OFFSET), vec![10.0]);
        assert_eq!(h.cluster.list_offsets_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_history_accumulates_across_cycles() {
        let h = Harness::new(BILLING_ORDERS);
        h.cluster.add_partition("orders", 0, 1, 100);
        h.cluster.add_group("billing", 1, &[("orders", 0, 100)]);
        h.manager().collect_once().await.unwrap();

        h.cluster.set_highwater("orders", 0, 200);
        h.manager().collect_once().await.unwrap();

        let tp = TopicPartition::new("orders", 0);
        assert_eq!(h.history().len(&tp), 2);
    }

    #[tokio::test]
    async fn test_corrupt_cache_is_treated_as_empty() {
        let h = Harness::new(BILLING_ORDERS);
        h.cluster.add_partition("orders", 0, 1, 100);
        h.cluster.add_group("billing", 1, &[("orders", 0, 90)]);
        h.cache.write(&h.config.cache_key(), b"not json").unwrap();

        h.manager().collect_once().await.unwrap();

        assert_eq!(h.sink.values(METRIC_CONSUMER_LAG), vec![10.0]);
        assert_eq!(h.history().len(&TopicPartition::new("orders", 0)), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = Harness::new(BILLING_ORDERS);
        h.cluster.add_partition("orders", 0, 1, 100);
        h.cluster.add_group("billing", 1, &[("orders", 0, 90)]);

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(h.manager().run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(!h.sink.points().is_empty());
        assert_eq!(h.registry.instance_count(), 0);
    }
}
