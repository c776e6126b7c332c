use crate::metrics::definitions::{
    HELP_CYCLE_DURATION_SECONDS, HELP_LAST_UPDATE_TIMESTAMP, HELP_UP, LABEL_INSTANCE,
    METRIC_CYCLE_DURATION_SECONDS, METRIC_LAST_UPDATE_TIMESTAMP, METRIC_UP,
};
use crate::metrics::types::{Event, Labels, MetricPoint};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Default staleness threshold: 3x the typical poll interval
const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(90);

const DEFAULT_EVENT_CAPACITY: usize = 100;

pub struct MetricsRegistry {
    metrics: DashMap<String, Vec<MetricPoint>>,
    last_update: DashMap<String, Instant>,
    last_update_timestamp: DashMap<String, u64>, // Unix timestamp in seconds
    cycle_duration_ms: DashMap<String, u64>,
    healthy: AtomicBool,
    events: Mutex<VecDeque<Event>>,
    event_capacity: usize,
    staleness_threshold: Duration,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_staleness_threshold(DEFAULT_STALENESS_THRESHOLD)
    }

    pub fn with_staleness_threshold(staleness_threshold: Duration) -> Self {
        Self {
            metrics: DashMap::new(),
            last_update: DashMap::new(),
            last_update_timestamp: DashMap::new(),
            cycle_duration_ms: DashMap::new(),
            healthy: AtomicBool::new(true),
            events: Mutex::new(VecDeque::new()),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            staleness_threshold,
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Start a new cycle for an instance: its previous points are discarded.
    pub fn begin_cycle(&self, instance: &str) {
        self.metrics.insert(instance.to_string(), Vec::new());
    }

    /// Append points for an instance. Call between `begin_cycle` and `finish_cycle`.
    pub fn push_points(&self, instance: &str, points: Vec<MetricPoint>) {
        self.metrics
            .entry(instance.to_string())
            .or_default()
            .extend(points);
    }

    /// Records the update timestamps so staleness checks work correctly.
    pub fn finish_cycle(&self, instance: &str, duration: Duration) {
        let unix_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        self.last_update.insert(instance.to_string(), Instant::now());
        self.last_update_timestamp
            .insert(instance.to_string(), unix_timestamp);
        self.cycle_duration_ms.insert(
            instance.to_string(),
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        );
    }

    pub fn remove_instance(&self, instance: &str) {
        self.metrics.remove(instance);
        self.last_update.remove(instance);
        self.last_update_timestamp.remove(instance);
        self.cycle_duration_ms.remove(instance);
    }

    /// Number of instances that completed at least one cycle.
    pub fn instance_count(&self) -> usize {
        self.last_update.len()
    }

    /// Keep an event in the bounded ring of recent events.
    pub fn record_event(&self, event: Event) {
        let mut events = self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if events.len() == self.event_capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Most recent events, oldest first.
    pub fn recent_events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn is_fresh(&self, instance: &str, now: Instant) -> bool {
        self.last_update
            .get(instance)
            .is_some_and(|last_update| now.duration_since(*last_update) <= self.staleness_threshold)
    }

    pub fn render_prometheus(&self) -> String {
        self.render_prometheus_with_staleness_check(true)
    }

    /// Render Prometheus metrics, optionally filtering out stale instances
    #[allow(clippy::cast_precision_loss)]
    pub fn render_prometheus_with_staleness_check(&self, filter_stale: bool) -> String {
        let mut output = String::new();
        let now = Instant::now();

        // Collect DashMap guards to keep them alive while we borrow their contents
        let guards: Vec<_> = self
            .metrics
            .iter()
            .filter(|entry| !filter_stale || self.is_fresh(entry.key(), now))
            .collect();

        let mut by_name: BTreeMap<&str, Vec<&MetricPoint>> = BTreeMap::new();
        for guard in &guards {
            for point in guard.value() {
                by_name.entry(point.name).or_default().push(point);
            }
        }

        for (name, points) in &by_name {
            let first = points[0];
            output.push_str(&format!("# HELP {name} {}\n", first.help));
            output.push_str(&format!("# TYPE {name} {}\n", first.metric_type.as_str()));
            for point in points {
                output.push_str(&format!("{name}{} {}\n", render_labels(&point.labels), point.value));
            }
        }

        output.push_str(&format!("# HELP {METRIC_UP} {HELP_UP}\n"));
        output.push_str(&format!("# TYPE {METRIC_UP} gauge\n"));
        output.push_str(&format!("{METRIC_UP} {}\n", i32::from(self.is_healthy())));

        let mut instances: Vec<String> = self
            .last_update_timestamp
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|instance| !filter_stale || self.is_fresh(instance, now))
            .collect();
        instances.sort_unstable();

        if !instances.is_empty() {
            output.push_str(&format!(
                "# HELP {METRIC_LAST_UPDATE_TIMESTAMP} {HELP_LAST_UPDATE_TIMESTAMP}\n"
            ));
            output.push_str(&format!("# TYPE {METRIC_LAST_UPDATE_TIMESTAMP} gauge\n"));
            for instance in &instances {
                if let Some(timestamp) = self.last_update_timestamp.get(instance) {
                    output.push_str(&format!(
                        "{METRIC_LAST_UPDATE_TIMESTAMP}{} {}\n",
                        instance_label(instance),
                        *timestamp
                    ));
                }
            }

            output.push_str(&format!(
                "# HELP {METRIC_CYCLE_DURATION_SECONDS} {HELP_CYCLE_DURATION_SECONDS}\n"
            ));
            output.push_str(&format!("# TYPE {METRIC_CYCLE_DURATION_SECONDS} gauge\n"));
            for instance in &instances {
                if let Some(duration_ms) = self.cycle_duration_ms.get(instance) {
                    output.push_str(&format!(
                        "{METRIC_CYCLE_DURATION_SECONDS}{} {:.3}\n",
                        instance_label(instance),
                        *duration_ms as f64 / 1000.0
                    ));
                }
            }
        }

        output
    }
}

fn instance_label(instance: &str) -> String {
    render_labels(&HashMap::from([(
        LABEL_INSTANCE.to_string(),
        instance.to_string(),
    )]))
}

fn render_labels(labels: &Labels) -> String {
    if labels.is_empty() {
        return String::new();
    }

    let mut pairs: Vec<_> = labels.iter().collect();
    pairs.sort_by_key(|(k, _)| *k);

    let label_str = pairs
        .into_iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect::<Vec<_>>()
        .join(",");

    format!("{{{label_str}}}")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
