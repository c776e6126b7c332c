use crate::collector::timestamp_history::TimestampHistory;
use crate::collector::{RequestSettings, with_timeout};
use crate::error::{LagError, Result, UnitFailure};
use crate::kafka::{
    BrokerDirectory, BrokerId, ListOffsetsRequest, PartitionOutcome, PartitionResponse,
    TopicPartition, WireClient, is_internal_topic,
};
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Which partitions the highwater phase covers. Internal topics are never covered.
#[derive(Debug, Clone, Copy)]
pub enum HighwaterScope<'a> {
    AllPartitions,
    Consumed(&'a BTreeSet<TopicPartition>),
}

impl HighwaterScope<'_> {
    fn covers(&self, tp: &TopicPartition) -> bool {
        if is_internal_topic(&tp.topic) {
            return false;
        }
        match self {
            Self::AllPartitions => true,
            Self::Consumed(partitions) => partitions.contains(tp),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct HighwaterCollection {
    pub offsets: BTreeMap<TopicPartition, i64>,
    pub brokers_queried: usize,
    pub brokers_failed: usize,
    pub not_leader: usize,
    pub unknown_partitions: usize,
    /// Brokers left unqueried because the context budget ran out.
    pub brokers_skipped_for_budget: usize,
}

pub struct HighwaterCollector {
    directory: Arc<dyn BrokerDirectory>,
    client: Arc<dyn WireClient>,
    settings: RequestSettings,
    tolerate_broker_failures: bool,
}

impl HighwaterCollector {
    pub fn new(
        directory: Arc<dyn BrokerDirectory>,
        client: Arc<dyn WireClient>,
        settings: RequestSettings,
        tolerate_broker_failures: bool,
    ) -> Self {
        Self {
            directory,
            client,
            settings,
            tolerate_broker_failures,
        }
    }

    /// Fetch the highwater offset of every in-scope partition from its leader
    /// and record each reading in `history` at `observed_at`.
    ///
    /// Brokers are queried in batches; no new batch starts once `budget`
    /// offsets have been collected. Any error returned here is fatal for the
    /// cycle.
    #[instrument(skip(self, scope, history))]
    pub async fn collect(
        &self,
        scope: HighwaterScope<'_>,
        budget: usize,
        history: &mut TimestampHistory,
        observed_at: f64,
    ) -> Result<HighwaterCollection> {
        let requests = self.build_requests(scope);
        let mut collection = HighwaterCollection::default();
        debug!(brokers = requests.len(), "Requesting highwater offsets");

        let batch_size = self.settings.batch_size.max(1);
        let mut batches = requests.chunks(batch_size);
        while let Some(batch) = batches.next() {
            if collection.offsets.len() >= budget {
                collection.brokers_skipped_for_budget =
                    batch.len() + batches.by_ref().map(<[_]>::len).sum::<usize>();
                debug!(
                    collected = collection.offsets.len(),
                    skipped_brokers = collection.brokers_skipped_for_budget,
                    "Context budget reached, not requesting more highwater offsets"
                );
                break;
            }

            let responses: Vec<(BrokerId, Result<Vec<PartitionResponse>>)> =
                futures::stream::iter(batch.to_vec())
                    .map(|(broker, request)| {
                        let client = Arc::clone(&self.client);
                        let timeout = self.settings.timeout;
                        async move {
                            let response = with_timeout(
                                timeout,
                                || format!("list offsets on broker {broker}"),
                                client.list_latest_offsets(broker, &request),
                            )
                            .await;
                            (broker, response)
                        }
                    })
                    .buffer_unordered(self.settings.max_concurrent.max(1))
                    .collect()
                    .await;

            for (broker, response) in responses {
                collection.brokers_queried += 1;
                match self.settle(broker, response, &mut collection, history, observed_at) {
                    Ok(()) => {}
                    Err(UnitFailure::Recoverable { unit, error }) => {
                        warn!(unit = %unit, error = %error, "Highwater request failed, skipping broker");
                        collection.brokers_failed += 1;
                    }
                    Err(UnitFailure::Fatal(error)) => return Err(error),
                }
            }
        }

        if collection.brokers_queried > 0 && collection.brokers_failed == collection.brokers_queried {
            return Err(LagError::HighwaterUnavailable(format!(
                "none of {} brokers answered",
                collection.brokers_queried
            )));
        }

        info!(
            partitions = collection.offsets.len(),
            brokers_queried = collection.brokers_queried,
            brokers_failed = collection.brokers_failed,
            not_leader = collection.not_leader,
            unknown_partitions = collection.unknown_partitions,
            "Highwater offset collection finished"
        );
        Ok(collection)
    }

    /// One request per leader broker, covering every in-scope partition it leads.
    fn build_requests(&self, scope: HighwaterScope<'_>) -> Vec<(BrokerId, ListOffsetsRequest)> {
        self.directory
            .brokers()
            .into_iter()
            .filter_map(|broker| {
                let mut request = ListOffsetsRequest::default();
                for tp in self.directory.partitions_led_by(broker) {
                    if scope.covers(&tp) {
                        request.add(&tp);
                    }
                }
                (!request.is_empty()).then_some((broker, request))
            })
            .collect()
    }

    /// Outcome of one broker request as a collection unit. A failed request is
    /// recoverable only when broker failures are tolerated; a partition error
    /// the protocol does not explain is always fatal.
    fn settle(
        &self,
        broker: BrokerId,
        response: Result<Vec<PartitionResponse>>,
        collection: &mut HighwaterCollection,
        history: &mut TimestampHistory,
        observed_at: f64,
    ) -> std::result::Result<(), UnitFailure> {
        let partitions = response.map_err(|e| self.broker_failure(broker, e))?;
        self.apply(broker, partitions, collection, history, observed_at)
    }

    fn broker_failure(&self, broker: BrokerId, error: LagError) -> UnitFailure {
        if self.tolerate_broker_failures {
            UnitFailure::recoverable(format!("broker {broker}"), error)
        } else {
            UnitFailure::Fatal(LagError::HighwaterUnavailable(format!("broker {broker}: {error}")))
        }
    }

    fn apply(
        &self,
        broker: BrokerId,
        partitions: Vec<PartitionResponse>,
        collection: &mut HighwaterCollection,
        history: &mut TimestampHistory,
        observed_at: f64,
    ) -> std::result::Result<(), UnitFailure> {
        for PartitionResponse { tp, outcome } in partitions {
            match outcome {
                PartitionOutcome::Success(offset) => {
                    history.record(&tp, offset, observed_at);
                    collection.offsets.insert(tp, offset);
                }
                PartitionOutcome::NotLeader => {
                    warn!(
                        broker,
                        topic = %tp.topic,
                        partition = tp.partition,
                        "Broker is no longer the partition leader, refreshing metadata"
                    );
                    collection.not_leader += 1;
                    self.directory.request_metadata_refresh();
                }
                PartitionOutcome::UnknownTopicOrPartition => {
                    warn!(
                        broker,
                        topic = %tp.topic,
                        partition = tp.partition,
                        "Broker does not know the partition, it may have been deleted"
                    );
                    collection.unknown_partitions += 1;
                }
                PartitionOutcome::OtherFatal(reason) => {
                    return Err(UnitFailure::Fatal(LagError::Protocol(format!(
                        "highwater offset for {tp} on broker {broker}: {reason}"
                    ))));
                }
            }
        }
        Ok(())
    }
}
