//! librdkafka-backed [`BrokerDirectory`] and [`WireClient`].
//!
//! librdkafka hides per-broker routing: group requests go to the group
//! coordinator and watermark queries to the partition leader on their own.
//! The broker ids handed to the collectors are therefore routing hints, and
//! cluster-wide calls (group listing) are attributed to the lowest broker id.

use super::{
    BrokerDirectory, BrokerId, ListOffsetsRequest, ListedGroup, NO_COMMITTED_OFFSET,
    PartitionOutcome, PartitionResponse, TopicPartition, WireClient,
};
use crate::config::InstanceConfig;
use crate::error::{LagError, Result};
use async_trait::async_trait;
use rdkafka::admin::AdminClient;
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::metadata::Metadata;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::types::RDKafkaErrorCode;
use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Default)]
struct Topology {
    brokers: Vec<BrokerId>,
    leaders: BTreeMap<TopicPartition, BrokerId>,
    partitions: BTreeMap<String, Vec<i32>>,
}

impl Topology {
    fn from_metadata(metadata: &Metadata) -> Self {
        let mut topology = Self {
            brokers: metadata.brokers().iter().map(|b| b.id()).collect(),
            ..Self::default()
        };
        topology.brokers.sort_unstable();

        for topic in metadata.topics() {
            if topic.error().is_some() {
                continue;
            }
            let ids = topology.partitions.entry(topic.name().to_string()).or_default();
            for partition in topic.partitions() {
                ids.push(partition.id());
                // leader -1: failover in progress
                if partition.leader() >= 0 {
                    topology
                        .leaders
                        .insert(TopicPartition::new(topic.name(), partition.id()), partition.leader());
                }
            }
            ids.sort_unstable();
        }
        topology
    }
}

pub struct KafkaClient {
    instance: String,
    admin: Arc<AdminClient<DefaultClientContext>>,
    consumer: Arc<BaseConsumer>,
    timeout: Duration,
    topology: RwLock<Topology>,
    refresh_requested: AtomicBool,
}

impl KafkaClient {
    pub fn new(config: &InstanceConfig) -> Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", config.bootstrap_servers());
        client_config.set("client.id", format!("kafka-lag-engine-{}", config.name));

        for (key, value) in &config.consumer_properties {
            client_config.set(key, value);
        }

        let admin: AdminClient<DefaultClientContext> = client_config.create()?;

        let consumer: BaseConsumer = client_config
            .clone()
            .set("group.id", format!("kafka-lag-engine-internal-{}", config.name))
            .set("enable.auto.commit", "false")
            .create()?;

        info!(
            instance = %config.name,
            bootstrap_servers = %config.bootstrap_servers(),
            "Created Kafka client"
        );

        Ok(Self {
            instance: config.name.clone(),
            admin: Arc::new(admin),
            consumer: Arc::new(consumer),
            timeout: config.request_timeout,
            topology: RwLock::new(Topology::default()),
            refresh_requested: AtomicBool::new(true),
        })
    }

    fn topology(&self) -> std::sync::RwLockReadGuard<'_, Topology> {
        self.topology.read().unwrap_or_else(PoisonError::into_inner)
    }

    async fn blocking<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&BaseConsumer, Duration) -> Result<T> + Send + 'static,
    {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || call(&consumer, timeout))
            .await
            .map_err(|e| LagError::Admin(format!("blocking Kafka call failed: {e}")))?
    }
}

impl BrokerDirectory for KafkaClient {
    fn brokers(&self) -> Vec<BrokerId> {
        self.topology().brokers.clone()
    }

    fn partitions_led_by(&self, broker: BrokerId) -> Vec<TopicPartition> {
        self.topology()
            .leaders
            .iter()
            .filter(|(_, leader)| **leader == broker)
            .map(|(tp, _)| tp.clone())
            .collect()
    }

    fn partitions_of(&self, topic: &str) -> Option<Vec<i32>> {
        self.topology().partitions.get(topic).cloned()
    }

    fn request_metadata_refresh(&self) {
        self.refresh_requested.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl WireClient for KafkaClient {
    #[instrument(skip(self), fields(instance = %self.instance))]
    async fn sync_metadata(&self) -> Result<()> {
        if !self.refresh_requested.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let topology = match self
            .blocking(|consumer, timeout| {
                Ok(Topology::from_metadata(&consumer.fetch_metadata(None, timeout)?))
            })
            .await
        {
            Ok(topology) => topology,
            Err(e) => {
                self.refresh_requested.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };

        debug!(
            brokers = topology.brokers.len(),
            topics = topology.partitions.len(),
            partitions = topology.partitions.values().map(Vec::len).sum::<usize>(),
            "Refreshed cluster metadata"
        );
        *self.topology.write().unwrap_or_else(PoisonError::into_inner) = topology;
        Ok(())
    }

    /// Checks the group is alive on its coordinator; librdkafka routes the
    /// later offset fetch there by itself.
    async fn find_coordinator(&self, group_id: &str) -> Result<BrokerId> {
        let group = group_id.to_string();
        let state = self
            .blocking(move |consumer, timeout| {
                let list = consumer.fetch_group_list(Some(group.as_str()), timeout)?;
                Ok(list.groups().first().map(|g| g.state().to_string()))
            })
            .await?;

        match state.as_deref() {
            None | Some("Dead") => Err(LagError::Protocol(format!(
                "no coordinator for consumer group {group_id}"
            ))),
            Some(_) => self
                .topology()
                .brokers
                .first()
                .copied()
                .ok_or_else(|| LagError::Protocol("no brokers known".to_string())),
        }
    }

    async fn list_groups(&self, broker: BrokerId) -> Result<Vec<ListedGroup>> {
        if self.topology().brokers.first() != Some(&broker) {
            return Ok(Vec::new());
        }

        self.blocking(|consumer, timeout| {
            let list = consumer.fetch_group_list(None, timeout)?;
            Ok(list
                .groups()
                .iter()
                .map(|g| ListedGroup {
                    group_id: g.name().to_string(),
                    protocol_type: g.protocol_type().to_string(),
                })
                .collect())
        })
        .await
    }

    async fn fetch_group_offsets(
        &self,
        _coordinator: BrokerId,
        group_id: &str,
        partitions: Option<&[TopicPartition]>,
    ) -> Result<Vec<(TopicPartition, i64)>> {
        let admin = Arc::clone(&self.admin);
        let group = group_id.to_string();
        let partitions = partitions.map(<[TopicPartition]>::to_vec);
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || {
            list_consumer_group_offsets(&admin, &group, partitions.as_deref(), timeout)
        })
        .await
        .map_err(|e| LagError::Admin(format!("blocking Kafka call failed: {e}")))?
    }

    /// One batched latest-offset lookup for every partition in `request`.
    /// librdkafka splits it into a ListOffsets request per partition leader.
    async fn list_latest_offsets(
        &self,
        broker: BrokerId,
        request: &ListOffsetsRequest,
    ) -> Result<Vec<PartitionResponse>> {
        let mut tpl = TopicPartitionList::with_capacity(request.partition_count());
        for tp in request.partitions() {
            // timestamp -1 asks for the latest offset
            tpl.add_partition_offset(&tp.topic, tp.partition, Offset::End)?;
        }

        self.blocking(move |consumer, timeout| {
            let answered = consumer.offsets_for_times(tpl, timeout).map_err(|e| {
                if classify(&e).is_none() {
                    LagError::Timeout(format!("list offsets on broker {broker}: {e}"))
                } else {
                    LagError::Kafka(e)
                }
            })?;
            partition_responses(broker, &answered)
        })
        .await
    }
}

fn partition_responses(broker: BrokerId, answered: &TopicPartitionList) -> Result<Vec<PartitionResponse>> {
    let mut responses = Vec::with_capacity(answered.count());
    for elem in answered.elements() {
        let tp = TopicPartition::new(elem.topic(), elem.partition());
        let outcome = match (elem.error(), elem.offset()) {
            (Ok(()), Offset::Offset(offset)) if offset >= 0 => PartitionOutcome::Success(offset),
            (Ok(()), other) => PartitionOutcome::OtherFatal(format!("no latest offset returned: {other:?}")),
            (Err(e), _) => match classify(&e) {
                Some(outcome) => outcome,
                None => {
                    return Err(LagError::Timeout(format!(
                        "latest offset for {tp} from broker {broker}: {e}"
                    )));
                }
            },
        };
        responses.push(PartitionResponse { tp, outcome });
    }
    Ok(responses)
}

/// Map a latest-offset lookup error onto a partition outcome. `None` for timeouts,
/// which fail the whole broker request.
fn classify(error: &KafkaError) -> Option<PartitionOutcome> {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::OperationTimedOut | RDKafkaErrorCode::RequestTimedOut) => None,
        Some(RDKafkaErrorCode::NotLeaderForPartition | RDKafkaErrorCode::LeaderNotAvailable) => {
            Some(PartitionOutcome::NotLeader)
        }
        Some(
            RDKafkaErrorCode::UnknownTopicOrPartition
            | RDKafkaErrorCode::UnknownTopic
            | RDKafkaErrorCode::UnknownPartition,
        ) => Some(PartitionOutcome::UnknownTopicOrPartition),
        _ => Some(PartitionOutcome::OtherFatal(error.to_string())),
    }
}

/// Committed offsets of a group via the Admin ListConsumerGroupOffsets call.
/// `None` partitions asks for every offset the group committed.
#[allow(clippy::too_many_lines, clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn list_consumer_group_offsets(
    admin: &AdminClient<DefaultClientContext>,
    group_id: &str,
    partitions: Option<&[TopicPartition]>,
    timeout: Duration,
) -> Result<Vec<(TopicPartition, i64)>> {
    use rdkafka::bindings::*;

    let group_cstr = CString::new(group_id)
        .map_err(|e| LagError::Admin(format!("Invalid group_id contains null byte: {e}")))?;
    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);

    unsafe {
        let rk = admin.inner().native_ptr();

        struct Cleanup {
            tpl: *mut rd_kafka_topic_partition_list_t,
            request: *mut rd_kafka_ListConsumerGroupOffsets_t,
            options: *mut rd_kafka_AdminOptions_t,
            queue: *mut rd_kafka_queue_t,
            event: *mut rd_kafka_event_t,
        }
        impl Drop for Cleanup {
            fn drop(&mut self) {
                unsafe {
                    if !self.event.is_null() {
                        rd_kafka_event_destroy(self.event);
                    }
                    if !self.queue.is_null() {
                        rd_kafka_queue_destroy(self.queue);
                    }
                    if !self.options.is_null() {
                        rd_kafka_AdminOptions_destroy(self.options);
                    }
                    if !self.request.is_null() {
                        rd_kafka_ListConsumerGroupOffsets_destroy(self.request);
                    }
                    // the request holds its own copy of the list
                    if !self.tpl.is_null() {
                        rd_kafka_topic_partition_list_destroy(self.tpl);
                    }
                }
            }
        }

        let mut cleanup = Cleanup {
            tpl: std::ptr::null_mut(),
            request: std::ptr::null_mut(),
            options: std::ptr::null_mut(),
            queue: std::ptr::null_mut(),
            event: std::ptr::null_mut(),
        };

        if let Some(partitions) = partitions {
            let tpl = rd_kafka_topic_partition_list_new(partitions.len() as i32);
            if tpl.is_null() {
                return Err(LagError::Admin("Failed to create topic partition list".into()));
            }
            cleanup.tpl = tpl;
            for tp in partitions {
                let topic = CString::new(tp.topic.as_str())
                    .map_err(|e| LagError::Admin(format!("Topic name contains null byte: {e}")))?;
                // the list copies the topic name
                rd_kafka_topic_partition_list_add(tpl, topic.as_ptr(), tp.partition);
            }
        }

        let request = rd_kafka_ListConsumerGroupOffsets_new(group_cstr.as_ptr(), cleanup.tpl);
        if request.is_null() {
            return Err(LagError::Admin(
                "Failed to create ListConsumerGroupOffsets request".into(),
            ));
        }
        cleanup.request = request;

        let options = rd_kafka_AdminOptions_new(
            rk,
            rd_kafka_admin_op_t::RD_KAFKA_ADMIN_OP_LISTCONSUMERGROUPOFFSETS,
        );
        if options.is_null() {
            return Err(LagError::Admin("Failed to create AdminOptions".into()));
        }
        cleanup.options = options;

        let mut errstr_buf = [0 as c_char; 512];
        let err = rd_kafka_AdminOptions_set_request_timeout(
            options,
            timeout_ms,
            errstr_buf.as_mut_ptr(),
            errstr_buf.len(),
        );
        if err != rd_kafka_resp_err_t::RD_KAFKA_RESP_ERR_NO_ERROR {
            let errstr = CStr::from_ptr(errstr_buf.as_ptr()).to_string_lossy().to_string();
            return Err(LagError::Admin(format!("Failed to set request timeout: {errstr}")));
        }

        let queue = rd_kafka_queue_new(rk);
        if queue.is_null() {
            return Err(LagError::Admin("Failed to create queue".into()));
        }
        cleanup.queue = queue;

        let mut request_ptr = request;
        rd_kafka_ListConsumerGroupOffsets(rk, &mut request_ptr, 1, options, queue);
        cleanup.request = std::ptr::null_mut();

        let event = rd_kafka_queue_poll(queue, timeout_ms);
        if event.is_null() {
            return Err(LagError::Timeout(format!(
                "ListConsumerGroupOffsets for group {group_id}"
            )));
        }
        cleanup.event = event;

        let event_type = rd_kafka_event_type(event);
        if event_type != RD_KAFKA_EVENT_LISTCONSUMERGROUPOFFSETS_RESULT {
            return Err(LagError::Admin(format!("Unexpected event type: {event_type}")));
        }

        let resp_err = rd_kafka_event_error(event);
        if resp_err != rd_kafka_resp_err_t::RD_KAFKA_RESP_ERR_NO_ERROR {
            let err_cstr = rd_kafka_event_error_string(event);
            let err_msg = if err_cstr.is_null() {
                "unknown error".to_string()
            } else {
                CStr::from_ptr(err_cstr).to_string_lossy().to_string()
            };
            return Err(LagError::Admin(format!("ListConsumerGroupOffsets failed: {err_msg}")));
        }

        let result = rd_kafka_event_ListConsumerGroupOffsets_result(event);
        if result.is_null() {
            return Err(LagError::Admin("ListConsumerGroupOffsets result is null".into()));
        }

        let mut n_groups: usize = 0;
        let groups_ptr = rd_kafka_ListConsumerGroupOffsets_result_groups(result, &mut n_groups);

        let mut offsets = Vec::new();
        for i in 0..n_groups {
            let group = *groups_ptr.add(i);

            let group_error = rd_kafka_group_result_error(group);
            if !group_error.is_null()
                && rd_kafka_error_code(group_error) != rd_kafka_resp_err_t::RD_KAFKA_RESP_ERR_NO_ERROR
            {
                let err_str = rd_kafka_error_string(group_error);
                let msg = if err_str.is_null() {
                    "unknown".to_string()
                } else {
                    CStr::from_ptr(err_str).to_string_lossy().to_string()
                };
                return Err(LagError::Protocol(format!("group {group_id}: {msg}")));
            }

            let result_partitions = rd_kafka_group_result_partitions(group);
            if result_partitions.is_null() {
                continue;
            }

            let cnt = (*result_partitions).cnt;
            let elems = (*result_partitions).elems;
            for j in 0..cnt {
                let elem = &*elems.add(j as usize);
                let topic = CStr::from_ptr(elem.topic).to_string_lossy().to_string();
                if elem.err != rd_kafka_resp_err_t::RD_KAFKA_RESP_ERR_NO_ERROR {
                    warn!(group = group_id, topic = %topic, partition = elem.partition, "Offset fetch error for partition");
                }
                // RD_KAFKA_OFFSET_INVALID (-1001) when nothing was committed
                let offset = if elem.offset >= 0 { elem.offset } else { NO_COMMITTED_OFFSET };
                offsets.push((TopicPartition::new(topic, elem.partition), offset));
            }
        }

        debug!(
            group = group_id,
            partitions = offsets.len(),
            "Fetched committed offsets via Admin API"
        );
        Ok(offsets)
    }
}
