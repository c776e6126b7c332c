//! In-memory cluster used by the collector and cycle tests.

use super::{
    BrokerDirectory, BrokerId, ListOffsetsRequest, ListedGroup, NO_COMMITTED_OFFSET,
    PartitionOutcome, PartitionResponse, TopicPartition, WireClient,
};
use crate::error::{LagError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct MockState {
    brokers: BTreeSet<BrokerId>,
    leaders: BTreeMap<TopicPartition, BrokerId>,
    highwater: BTreeMap<TopicPartition, i64>,
    coordinators: HashMap<String, BrokerId>,
    listed_groups: HashMap<BrokerId, Vec<ListedGroup>>,
    committed: HashMap<String, BTreeMap<TopicPartition, i64>>,
    outcome_overrides: HashMap<TopicPartition, PartitionOutcome>,
    failing_brokers: HashSet<BrokerId>,
    hanging_brokers: HashSet<BrokerId>,
    failing_groups: HashSet<String>,
    list_offsets_requests: Vec<(BrokerId, ListOffsetsRequest)>,
}

#[derive(Default)]
pub struct MockCluster {
    state: Mutex<MockState>,
    refresh_requests: AtomicUsize,
    fetches_in_flight: AtomicUsize,
    max_fetches_in_flight: AtomicUsize,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn add_broker(&self, broker: BrokerId) {
        self.state().brokers.insert(broker);
    }

    pub fn add_partition(&self, topic: &str, partition: i32, leader: BrokerId, highwater: i64) {
        let mut state = self.state();
        let tp = TopicPartition::new(topic, partition);
        state.brokers.insert(leader);
        state.leaders.insert(tp.clone(), leader);
        state.highwater.insert(tp, highwater);
    }

    pub fn set_highwater(&self, topic: &str, partition: i32, highwater: i64) {
        self.state()
            .highwater
            .insert(TopicPartition::new(topic, partition), highwater);
    }

    /// Register a group coordinated by `coordinator` with the given commits.
    pub fn add_group(&self, group: &str, coordinator: BrokerId, commits: &[(&str, i32, i64)]) {
        let mut state = self.state();
        state.coordinators.insert(group.to_string(), coordinator);
        state
            .listed_groups
            .entry(coordinator)
            .or_default()
            .push(ListedGroup {
                group_id: group.to_string(),
                protocol_type: "consumer".to_string(),
            });
        let offsets = state.committed.entry(group.to_string()).or_default();
        for (topic, partition, offset) in commits {
            offsets.insert(TopicPartition::new(*topic, *partition), *offset);
        }
    }

    pub fn add_listed_group(&self, broker: BrokerId, group: &str, protocol_type: &str) {
        self.state()
            .listed_groups
            .entry(broker)
            .or_default()
            .push(ListedGroup {
                group_id: group.to_string(),
                protocol_type: protocol_type.to_string(),
            });
    }

    pub fn set_outcome(&self, topic: &str, partition: i32, outcome: PartitionOutcome) {
        self.state()
            .outcome_overrides
            .insert(TopicPartition::new(topic, partition), outcome);
    }

    pub fn fail_broker(&self, broker: BrokerId) {
        self.state().failing_brokers.insert(broker);
    }

    /// Requests to this broker never complete; callers must time out.
    pub fn hang_broker(&self, broker: BrokerId) {
        self.state().hanging_brokers.insert(broker);
    }

    pub fn fail_group(&self, group: &str) {
        self.state().failing_groups.insert(group.to_string());
    }

    pub fn refresh_requests(&self) -> usize {
        self.refresh_requests.load(Ordering::SeqCst)
    }

    /// Highest number of offset fetches that were pending at the same time.
    pub fn max_fetches_in_flight(&self) -> usize {
        self.max_fetches_in_flight.load(Ordering::SeqCst)
    }

    pub fn list_offsets_requests(&self) -> Vec<(BrokerId, ListOffsetsRequest)> {
        self.state().list_offsets_requests.clone()
    }

    async fn maybe_hang(&self, broker: BrokerId) {
        let hangs = self.state().hanging_brokers.contains(&broker);
        if hangs {
            std::future::pending::<()>().await;
        }
    }
}

impl BrokerDirectory for MockCluster {
    fn brokers(&self) -> Vec<BrokerId> {
        self.state().brokers.iter().copied().collect()
    }

    fn partitions_led_by(&self, broker: BrokerId) -> Vec<TopicPartition> {
        self.state()
            .leaders
            .iter()
            .filter(|(_, leader)| **leader == broker)
            .map(|(tp, _)| tp.clone())
            .collect()
    }

    fn partitions_of(&self, topic: &str) -> Option<Vec<i32>> {
        let partitions: Vec<i32> = self
            .state()
            .leaders
            .keys()
            .filter(|tp| tp.topic == topic)
            .map(|tp| tp.partition)
            .collect();
        (!partitions.is_empty()).then_some(partitions)
    }

    fn request_metadata_refresh(&self) {
        self.refresh_requests.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl WireClient for MockCluster {
    async fn find_coordinator(&self, group_id: &str) -> Result<BrokerId> {
        let coordinator = self.state().coordinators.get(group_id).copied();
        match coordinator {
            Some(broker) => {
                self.maybe_hang(broker).await;
                Ok(broker)
            }
            None => Err(LagError::Protocol(format!(
                "coordinator not available for group {group_id}"
            ))),
        }
    }

    async fn list_groups(&self, broker: BrokerId) -> Result<Vec<ListedGroup>> {
        self.maybe_hang(broker).await;
        let state = self.state();
        if state.failing_brokers.contains(&broker) {
            return Err(LagError::Protocol(format!("broker {broker} unavailable")));
        }
        Ok(state.listed_groups.get(&broker).cloned().unwrap_or_default())
    }

    async fn fetch_group_offsets(
        &self,
        coordinator: BrokerId,
        group_id: &str,
        partitions: Option<&[TopicPartition]>,
    ) -> Result<Vec<(TopicPartition, i64)>> {
        self.maybe_hang(coordinator).await;

        let in_flight = self.fetches_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_fetches_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.fetches_in_flight.fetch_sub(1, Ordering::SeqCst);

        let state = self.state();
        if state.failing_groups.contains(group_id) {
            return Err(LagError::Protocol(format!("offset fetch failed for {group_id}")));
        }
        if state.coordinators.get(group_id) != Some(&coordinator) {
            return Err(LagError::Protocol(format!(
                "broker {coordinator} is not the coordinator for {group_id}"
            )));
        }
        let committed = state.committed.get(group_id).cloned().unwrap_or_default();
        Ok(match partitions {
            None => committed.into_iter().collect(),
            Some(requested) => requested
                .iter()
                .map(|tp| {
                    let offset = committed.get(tp).copied().unwrap_or(NO_COMMITTED_OFFSET);
                    (tp.clone(), offset)
                })
                .collect(),
        })
    }

    async fn list_latest_offsets(
        &self,
        broker: BrokerId,
        request: &ListOffsetsRequest,
    ) -> Result<Vec<PartitionResponse>> {
        self.maybe_hang(broker).await;
        let mut state = self.state();
        state.list_offsets_requests.push((broker, request.clone()));
        if state.failing_brokers.contains(&broker) {
            return Err(LagError::Protocol(format!("broker {broker} unavailable")));
        }

        Ok(request
            .partitions()
            .map(|tp| {
                let outcome = if let Some(outcome) = state.outcome_overrides.get(&tp) {
                    outcome.clone()
                } else if state.leaders.get(&tp) != Some(&broker) {
                    PartitionOutcome::NotLeader
                } else if let Some(hw) = state.highwater.get(&tp) {
                    PartitionOutcome::Success(*hw)
                } else {
                    PartitionOutcome::UnknownTopicOrPartition
                };
                PartitionResponse { tp, outcome }
            })
            .collect())
    }
}
