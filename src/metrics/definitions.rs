pub const METRIC_BROKER_OFFSET: &str = "kafka_broker_offset";
pub const METRIC_CONSUMER_OFFSET: &str = "kafka_consumer_offset";
pub const METRIC_CONSUMER_LAG: &str = "kafka_consumer_lag";
pub const METRIC_CONSUMER_LAG_SECONDS: &str = "kafka_consumer_lag_seconds";

pub const METRIC_CYCLE_DURATION_SECONDS: &str = "kafka_lag_engine_cycle_duration_seconds";
pub const METRIC_UP: &str = "kafka_lag_engine_up";
pub const METRIC_LAST_UPDATE_TIMESTAMP: &str = "kafka_lag_engine_last_update_timestamp_seconds";

pub const LABEL_INSTANCE: &str = "instance";
pub const LABEL_CONSUMER_GROUP: &str = "consumer_group";
pub const LABEL_TOPIC: &str = "topic";
pub const LABEL_PARTITION: &str = "partition";
pub const LABEL_SOURCE: &str = "source";

pub const SOURCE_KAFKA: &str = "kafka";

pub const HELP_BROKER_OFFSET: &str = "Highwater offset of a partition as reported by its leader";
pub const HELP_CONSUMER_OFFSET: &str = "Committed offset of a consumer group partition";
pub const HELP_CONSUMER_LAG: &str =
    "Offset lag (highwater - committed) of a consumer group partition, negative values included";
pub const HELP_CONSUMER_LAG_SECONDS: &str =
    "Estimated seconds between the committed offset and the highwater offset being produced";
pub const HELP_CYCLE_DURATION_SECONDS: &str = "Duration of the last collection cycle in seconds";
pub const HELP_UP: &str = "1 if the last collection cycles succeeded, 0 otherwise";
pub const HELP_LAST_UPDATE_TIMESTAMP: &str = "Unix timestamp of the last successful collection cycle";

pub const EVENT_TYPE_CONSUMER_LAG: &str = "consumer_lag";
