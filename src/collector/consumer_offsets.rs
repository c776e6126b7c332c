use crate::collector::{RequestSettings, with_timeout};
use crate::error::{LagError, Result, UnitFailure};
use crate::kafka::{
    BrokerDirectory, BrokerId, ListedGroup, NO_COMMITTED_OFFSET, TopicPartition, WireClient,
};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionSelection {
    All,
    Explicit(Vec<i32>),
}

/// What to fetch for one configured consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerGroupSpec {
    /// Every partition the group has committed offsets for.
    AllPartitions,
    Topics(BTreeMap<String, PartitionSelection>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerKey {
    pub group: String,
    pub tp: TopicPartition,
}

impl ConsumerKey {
    pub fn new(group: impl Into<String>, topic: impl Into<String>, partition: i32) -> Self {
        Self {
            group: group.into(),
            tp: TopicPartition::new(topic, partition),
        }
    }
}

pub type ConsumerOffsets = BTreeMap<ConsumerKey, i64>;

#[derive(Debug, Default, Clone)]
pub struct ConsumerCollection {
    pub offsets: ConsumerOffsets,
    pub groups_attempted: usize,
    pub groups_skipped: usize,
    pub brokers_skipped: usize,
    /// Partitions reported without a committed offset.
    pub offsets_dropped: usize,
}

type GroupOutcome = (String, std::result::Result<Vec<(TopicPartition, i64)>, UnitFailure>);

pub struct ConsumerOffsetCollector {
    directory: Arc<dyn BrokerDirectory>,
    client: Arc<dyn WireClient>,
    settings: RequestSettings,
}

impl ConsumerOffsetCollector {
    pub fn new(
        directory: Arc<dyn BrokerDirectory>,
        client: Arc<dyn WireClient>,
        settings: RequestSettings,
    ) -> Self {
        Self {
            directory,
            client,
            settings,
        }
    }

    /// Fetch committed offsets for the configured groups, or for every group
    /// any broker coordinates when `monitor_unlisted` is set. A failing group
    /// or broker is skipped; only a configuration problem is an error.
    #[instrument(skip(self, groups), fields(groups = groups.len()))]
    pub async fn collect(
        &self,
        groups: &BTreeMap<String, ConsumerGroupSpec>,
        monitor_unlisted: bool,
    ) -> Result<ConsumerCollection> {
        let mut collection = ConsumerCollection::default();

        let outcomes = if monitor_unlisted {
            self.collect_discovered(&mut collection).await
        } else if !groups.is_empty() {
            self.collect_configured(groups).await
        } else {
            return Err(LagError::Config(
                "Cannot fetch consumer offsets because no consumer_groups are specified \
                 and monitor_unlisted_consumer_groups is disabled"
                    .to_string(),
            ));
        };

        collection.groups_attempted = outcomes.len();
        for (group, outcome) in outcomes {
            match outcome {
                Ok(offsets) => {
                    debug!(group = %group, partitions = offsets.len(), "Fetched group offsets");
                    for (tp, offset) in offsets {
                        if offset == NO_COMMITTED_OFFSET {
                            collection.offsets_dropped += 1;
                            continue;
                        }
                        collection.offsets.insert(ConsumerKey { group: group.clone(), tp }, offset);
                    }
                }
                Err(UnitFailure::Recoverable { unit, error }) => {
                    warn!(group = %group, unit = %unit, error = %error, "Skipping consumer group");
                    collection.groups_skipped += 1;
                }
                Err(UnitFailure::Fatal(error)) => return Err(error),
            }
        }

        if collection.offsets_dropped > 0 {
            // Partitions without a commit may have been deleted
            self.directory.request_metadata_refresh();
        }

        info!(
            groups_attempted = collection.groups_attempted,
            groups_skipped = collection.groups_skipped,
            brokers_skipped = collection.brokers_skipped,
            offsets = collection.offsets.len(),
            offsets_dropped = collection.offsets_dropped,
            "Consumer offset collection finished"
        );

        Ok(collection)
    }

    /// Coordinator lookup followed by one scoped offset fetch, per group.
    async fn collect_configured(
        &self,
        groups: &BTreeMap<String, ConsumerGroupSpec>,
    ) -> Vec<GroupOutcome> {
        let units: Vec<(String, Option<Vec<TopicPartition>>)> = groups
            .iter()
            .map(|(group, spec)| (group.clone(), self.scope_partitions(group, spec)))
            .collect();

        futures::stream::iter(units)
            .map(|(group, partitions)| {
                let client = Arc::clone(&self.client);
                let timeout = self.settings.timeout;
                async move {
                    let outcome =
                        fetch_configured_group(client.as_ref(), timeout, &group, partitions).await;
                    (group, outcome)
                }
            })
            .buffer_unordered(self.settings.max_concurrent.max(1))
            .collect()
            .await
    }

    /// `None` asks the coordinator for every offset the group has committed.
    fn scope_partitions(&self, group: &str, spec: &ConsumerGroupSpec) -> Option<Vec<TopicPartition>> {
        let ConsumerGroupSpec::Topics(topics) = spec else {
            return None;
        };

        let mut partitions = Vec::new();
        for (topic, selection) in topics {
            match selection {
                PartitionSelection::Explicit(ps) => {
                    partitions.extend(ps.iter().map(|p| TopicPartition::new(topic.clone(), *p)));
                }
                PartitionSelection::All => match self.directory.partitions_of(topic) {
                    Some(ps) => {
                        partitions.extend(ps.into_iter().map(|p| TopicPartition::new(topic.clone(), p)));
                    }
                    None => {
                        warn!(
                            group = %group,
                            topic = %topic,
                            "Configured topic has no partitions in the cluster, skipping it"
                        );
                        self.directory.request_metadata_refresh();
                    }
                },
            }
        }
        Some(partitions)
    }

    /// List groups on every broker, then fetch each consumer group's offsets
    /// from the broker that listed it. A broker only lists the groups it
    /// coordinates, so no coordinator lookup is needed. Listing and fetching
    /// are two separate barriers, each bounded by `max_concurrent`.
    async fn collect_discovered(&self, collection: &mut ConsumerCollection) -> Vec<GroupOutcome> {
        let brokers = self.directory.brokers();
        debug!(brokers = brokers.len(), "Listing consumer groups on all brokers");

        let listings: Vec<(BrokerId, Result<Vec<ListedGroup>>)> = futures::stream::iter(brokers)
            .map(|broker| {
                let client = Arc::clone(&self.client);
                let timeout = self.settings.timeout;
                async move {
                    let listed = with_timeout(
                        timeout,
                        || format!("group listing on broker {broker}"),
                        client.list_groups(broker),
                    )
                    .await;
                    (broker, listed)
                }
            })
            .buffer_unordered(self.settings.max_concurrent.max(1))
            .collect()
            .await;

        let mut units: Vec<(BrokerId, String)> = Vec::new();
        for (broker, listed) in listings {
            match listed {
                Ok(groups) => {
                    let before = units.len();
                    units.extend(
                        groups
                            .into_iter()
                            .filter(|g| g.is_consumer_group())
                            .map(|g| (broker, g.group_id)),
                    );
                    debug!(broker, groups = units.len() - before, "Discovered consumer groups");
                }
                Err(e) => {
                    warn!(broker, error = %e, "Failed to list consumer groups, skipping broker");
                    collection.brokers_skipped += 1;
                }
            }
        }

        futures::stream::iter(units)
            .map(|(broker, group)| {
                let client = Arc::clone(&self.client);
                let timeout = self.settings.timeout;
                async move {
                    let outcome = fetch_offsets(client.as_ref(), timeout, broker, &group, None)
                        .await
                        .map_err(|e| UnitFailure::recoverable(format!("group {group}"), e));
                    (group, outcome)
                }
            })
            .buffer_unordered(self.settings.max_concurrent.max(1))
            .collect()
            .await
    }
}

async fn fetch_configured_group(
    client: &dyn WireClient,
    timeout: Duration,
    group: &str,
    partitions: Option<Vec<TopicPartition>>,
) -> std::result::Result<Vec<(TopicPartition, i64)>, UnitFailure> {
    let unit = || format!("group {group}");
    let coordinator = with_timeout(
        timeout,
        || format!("coordinator lookup for group {group}"),
        client.find_coordinator(group),
    )
    .await
    .map_err(|e| UnitFailure::recoverable(unit(), e))?;

    if partitions.as_ref().is_some_and(Vec::is_empty) {
        return Ok(Vec::new());
    }

    fetch_offsets(client, timeout, coordinator, group, partitions.as_deref())
        .await
        .map_err(|e| UnitFailure::recoverable(unit(), e))
}

async fn fetch_offsets(
    client: &dyn WireClient,
    timeout: Duration,
    coordinator: BrokerId,
    group: &str,
    partitions: Option<&[TopicPartition]>,
) -> Result<Vec<(TopicPartition, i64)>> {
    with_timeout(
        timeout,
        || format!("offset fetch for group {group} on broker {coordinator}"),
        client.fetch_group_offsets(coordinator, group, partitions),
    )
    .await
}
