//! Broker-facing capabilities consumed by the collectors.
//!
//! The collectors only see [`BrokerDirectory`] (cluster topology) and
//! [`WireClient`] (request/response against a single broker). The rdkafka
//! backed implementation lives in [`client`]; tests use [`mock`].

pub mod client;
#[cfg(test)]
pub mod mock;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

pub type BrokerId = i32;

/// Offset the protocol reports for a partition without a committed offset.
pub const NO_COMMITTED_OFFSET: i64 = -1;

/// Broker-reserved topics, never part of highwater collection.
pub const INTERNAL_TOPICS: &[&str] = &["__consumer_offsets", "__transaction_state", "_schema"];

pub fn is_internal_topic(topic: &str) -> bool {
    INTERNAL_TOPICS.contains(&topic)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.topic, self.partition)
    }
}

/// A group as reported by a broker's group listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedGroup {
    pub group_id: String,
    pub protocol_type: String,
}

impl ListedGroup {
    /// Groups from pre-0.9 clients that commit to Kafka have an empty protocol type.
    pub fn is_consumer_group(&self) -> bool {
        self.protocol_type.is_empty() || self.protocol_type == "consumer"
    }
}

/// Latest-offset request for the partitions a single broker leads, grouped by topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOffsetsRequest {
    pub topics: BTreeMap<String, Vec<i32>>,
}

impl ListOffsetsRequest {
    pub fn add(&mut self, tp: &TopicPartition) {
        self.topics
            .entry(tp.topic.clone())
            .or_default()
            .push(tp.partition);
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn partition_count(&self) -> usize {
        self.topics.values().map(Vec::len).sum()
    }

    pub fn partitions(&self) -> impl Iterator<Item = TopicPartition> + '_ {
        self.topics
            .iter()
            .flat_map(|(topic, ps)| ps.iter().map(move |p| TopicPartition::new(topic.clone(), *p)))
    }
}

/// Per-partition result of a latest-offset request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionOutcome {
    Success(i64),
    NotLeader,
    UnknownTopicOrPartition,
    OtherFatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionResponse {
    pub tp: TopicPartition,
    pub outcome: PartitionOutcome,
}

/// Cluster topology as cached by the client.
pub trait BrokerDirectory: Send + Sync {
    fn brokers(&self) -> Vec<BrokerId>;

    fn partitions_led_by(&self, broker: BrokerId) -> Vec<TopicPartition>;

    /// `None` when the topic is unknown to the cluster.
    fn partitions_of(&self, topic: &str) -> Option<Vec<i32>>;

    /// Ask for fresh topology before the next use.
    fn request_metadata_refresh(&self);
}

#[async_trait]
pub trait WireClient: Send + Sync {
    /// Bring the topology behind [`BrokerDirectory`] up to date if a refresh
    /// was requested. Called once at the start of every cycle.
    async fn sync_metadata(&self) -> Result<()> {
        Ok(())
    }

    async fn find_coordinator(&self, group_id: &str) -> Result<BrokerId>;

    async fn list_groups(&self, broker: BrokerId) -> Result<Vec<ListedGroup>>;

    /// Committed offsets of `group_id`. `None` partitions fetches every offset
    /// the group has committed. Partitions without a commit come back as
    /// [`NO_COMMITTED_OFFSET`].
    async fn fetch_group_offsets(
        &self,
        coordinator: BrokerId,
        group_id: &str,
        partitions: Option<&[TopicPartition]>,
    ) -> Result<Vec<(TopicPartition, i64)>>;

    async fn list_latest_offsets(
        &self,
        broker: BrokerId,
        request: &ListOffsetsRequest,
    ) -> Result<Vec<PartitionResponse>>;
}
