use crate::cache::PersistentCache;
use crate::error::Result;
use crate::kafka::TopicPartition;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Maximum number of offset/timestamp pairs kept per partition.
pub const MAX_TIMESTAMPS: usize = 1000;

/// Offset -> wall clock time (seconds since the epoch) at which the broker
/// reported that offset as its highwater mark, per partition.
///
/// Persisted as `{"<topic>_<partition>": {"<offset>": <seconds>}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimestampHistory {
    partitions: HashMap<String, BTreeMap<i64, f64>>,
}

impl TimestampHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(tp: &TopicPartition) -> String {
        tp.to_string()
    }

    /// Load the history stored under `key`. Missing or unreadable content
    /// yields an empty history.
    pub fn load(cache: &dyn PersistentCache, key: &str) -> Self {
        let bytes = match cache.read(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(key, "No persisted broker timestamps, starting empty");
                return Self::new();
            }
            Err(e) => {
                warn!(key, error = %e, "Could not read broker timestamps from cache");
                return Self::new();
            }
        };

        match Self::decode(&bytes) {
            Ok(history) => {
                debug!(key, partitions = history.partition_count(), "Loaded broker timestamps");
                history
            }
            Err(e) => {
                warn!(key, error = %e, "Discarding corrupt broker timestamps cache");
                Self::new()
            }
        }
    }

    pub fn save(&self, cache: &dyn PersistentCache, key: &str) -> Result<()> {
        cache.write(key, &self.encode()?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Record that `offset` was the highwater mark of `tp` at `timestamp`.
    /// Once a partition holds more than [`MAX_TIMESTAMPS`] entries the lowest
    /// offset is dropped.
    pub fn record(&mut self, tp: &TopicPartition, offset: i64, timestamp: f64) {
        let timestamps = self.partitions.entry(Self::key(tp)).or_default();
        timestamps.insert(offset, timestamp);
        if timestamps.len() > MAX_TIMESTAMPS {
            timestamps.pop_first();
        }
    }

    pub fn timestamp_at(&self, tp: &TopicPartition, offset: i64) -> Option<f64> {
        self.partitions.get(&Self::key(tp))?.get(&offset).copied()
    }

    /// Estimate when `offset` was produced on `tp`.
    ///
    /// Exact hits return the stored value. Otherwise the closest recorded
    /// offsets on either side define a line; when `offset` lies outside the
    /// recorded range the lowest and highest recorded points are used instead.
    /// Fewer than two points gives `None`.
    pub fn interpolate(&self, tp: &TopicPartition, offset: i64) -> Option<f64> {
        let timestamps = self.partitions.get(&Self::key(tp))?;
        if let Some(ts) = timestamps.get(&offset) {
            return Some(*ts);
        }
        if timestamps.len() < 2 {
            debug!(
                topic = %tp.topic,
                partition = tp.partition,
                "Not enough offset history to compute a timestamp"
            );
            return None;
        }

        let before = timestamps.range(..offset).next_back();
        let after = timestamps.range(offset..).next();
        let ((o_before, t_before), (o_after, t_after)) = match (before, after) {
            (Some(b), Some(a)) => (b, a),
            // Consumer replaying from before (or ahead of) the recorded window
            _ => (timestamps.first_key_value()?, timestamps.last_key_value()?),
        };

        Some(linear(*o_before, *t_before, *o_after, *t_after, offset))
    }

    pub fn len(&self, tp: &TopicPartition) -> usize {
        self.partitions.get(&Self::key(tp)).map_or(0, BTreeMap::len)
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.values().all(BTreeMap::is_empty)
    }
}

#[allow(clippy::cast_precision_loss)]
fn linear(o_before: i64, t_before: f64, o_after: i64, t_after: f64, offset: i64) -> f64 {
    let span = (i128::from(o_after) - i128::from(o_before)) as f64;
    let slope = (t_after - t_before) / span;
    t_before + slope * (i128::from(offset) - i128::from(o_before)) as f64
}
