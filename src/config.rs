use crate::collector::consumer_offsets::{ConsumerGroupSpec, PartitionSelection};
use crate::error::{LagError, Result};
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub exporter: ExporterConfig,
    pub instances: Vec<InstanceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExporterConfig {
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_http_host")]
    pub http_host: String,
    /// Directory holding the persisted offset/timestamp history, one file per instance.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

/// Bootstrap servers, either as a comma separated string or as a list.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ConnectStr {
    Single(String),
    List(Vec<String>),
}

#[derive(Debug, Deserialize, Clone)]
pub struct InstanceConfig {
    pub name: String,
    pub kafka_connect_str: ConnectStr,
    /// group -> topic -> partitions. An empty topic table means every topic the
    /// group has committed offsets for, an empty partition list means every
    /// partition of that topic.
    #[serde(default)]
    pub consumer_groups: BTreeMap<String, BTreeMap<String, Vec<i32>>>,
    #[serde(default)]
    pub monitor_unlisted_consumer_groups: bool,
    #[serde(default)]
    pub monitor_all_broker_highwatermarks: bool,
    #[serde(default = "default_max_partition_contexts")]
    pub max_partition_contexts: usize,
    #[serde(default = "default_broker_requests_batch_size")]
    pub broker_requests_batch_size: usize,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Skip brokers that fail during highwater collection instead of failing the cycle.
    #[serde(default)]
    pub tolerate_broker_failures: bool,
    #[serde(default)]
    pub consumer_properties: HashMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_http_port() -> u16 {
    8000
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/lib/kafka-lag-engine")
}

fn default_max_partition_contexts() -> usize {
    200
}

fn default_broker_requests_batch_size() -> usize {
    30
}

fn default_max_concurrent_requests() -> usize {
    10
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Config {
    pub fn load(path: Option<&str>) -> Result<Config> {
        let config_path = path.unwrap_or("config.toml");

        if !Path::new(config_path).exists() {
            return Err(LagError::Config(format!(
                "Configuration file not found: {config_path}"
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Config> {
        let content = Self::substitute_env_vars(content)?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| LagError::Config(format!("TOML parse error: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    fn substitute_env_vars(content: &str) -> Result<String> {
        // ${VAR}, ${?VAR} -> value or empty; ${VAR:-default} -> value or default
        let re = Regex::new(r"\$\{\??([^}:-]+)(?::-([^}]*))?\}")?;
        Ok(re
            .replace_all(content, |caps: &regex::Captures| {
                let default_value = caps.get(2).map_or("", |m| m.as_str());
                std::env::var(&caps[1]).unwrap_or_else(|_| default_value.to_string())
            })
            .to_string())
    }

    pub fn validate(&self) -> Result<()> {
        if self.instances.is_empty() {
            return Err(LagError::Config(
                "At least one instance must be configured".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for instance in &self.instances {
            instance.validate()?;
            if !names.insert(instance.name.as_str()) {
                return Err(LagError::Config(format!(
                    "Duplicate instance name '{}'",
                    instance.name
                )));
            }
        }

        Ok(())
    }
}

impl InstanceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(LagError::Config(
                "Instance name cannot be empty".to_string(),
            ));
        }

        if self.bootstrap_servers().is_empty() {
            return Err(LagError::Config(format!(
                "Instance '{}': kafka_connect_str cannot be empty",
                self.name
            )));
        }

        if self.broker_requests_batch_size == 0 {
            return Err(LagError::Config(format!(
                "Instance '{}': broker_requests_batch_size must be positive",
                self.name
            )));
        }

        if self.max_concurrent_requests == 0 {
            return Err(LagError::Config(format!(
                "Instance '{}': max_concurrent_requests must be positive",
                self.name
            )));
        }

        if self.request_timeout.is_zero() {
            return Err(LagError::Config(format!(
                "Instance '{}': request_timeout must be positive",
                self.name
            )));
        }

        self.validate_consumer_groups()
    }

    fn validate_consumer_groups(&self) -> Result<()> {
        if self.consumer_groups.is_empty() && !self.monitor_unlisted_consumer_groups {
            return Err(LagError::Config(format!(
                "Instance '{}': no consumer_groups are specified and \
                 monitor_unlisted_consumer_groups is disabled",
                self.name
            )));
        }

        for (group, topics) in &self.consumer_groups {
            if group.is_empty() {
                return Err(LagError::Config(format!(
                    "Instance '{}': consumer group name cannot be empty",
                    self.name
                )));
            }
            for (topic, partitions) in topics {
                if topic.is_empty() {
                    return Err(LagError::Config(format!(
                        "Instance '{}': group '{group}' lists an empty topic name",
                        self.name
                    )));
                }
                if let Some(p) = partitions.iter().find(|p| **p < 0) {
                    return Err(LagError::Config(format!(
                        "Instance '{}': group '{group}' topic '{topic}' has invalid partition {p}",
                        self.name
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn bootstrap_servers(&self) -> String {
        match &self.kafka_connect_str {
            ConnectStr::Single(s) => s.trim().to_string(),
            ConnectStr::List(list) => list
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    pub fn group_specs(&self) -> BTreeMap<String, ConsumerGroupSpec> {
        self.consumer_groups
            .iter()
            .map(|(group, topics)| {
                let spec = if topics.is_empty() {
                    ConsumerGroupSpec::AllPartitions
                } else {
                    ConsumerGroupSpec::Topics(
                        topics
                            .iter()
                            .map(|(topic, partitions)| {
                                let selection = if partitions.is_empty() {
                                    PartitionSelection::All
                                } else {
                                    PartitionSelection::Explicit(partitions.clone())
                                };
                                (topic.clone(), selection)
                            })
                            .collect(),
                    )
                };
                (group.clone(), spec)
            })
            .collect()
    }

    /// Key under which this instance's timestamp history is persisted.
    /// Instances that differ in name, brokers or tags never share history.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.bootstrap_servers().as_bytes());
        for (k, v) in &self.tags {
            hasher.update([0u8]);
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
        }
        format!("broker_timestamps_{:x}", hasher.finalize())
    }

    /// Custom tags as metric labels.
    pub fn labels(&self) -> HashMap<String, String> {
        self.tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

#[cfg(test)]
impl InstanceConfig {
    pub fn for_tests(name: &str, connect: &str) -> Self {
        let content = format!(
            "[exporter]\n\n[[instances]]\nname = \"{name}\"\nkafka_connect_str = \"{connect}\"\n\
             monitor_unlisted_consumer_groups = true\n"
        );
        Config::parse(&content).unwrap().instances.remove(0)
    }
}
