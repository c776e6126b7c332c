pub mod definitions;
pub mod registry;
pub mod types;

use std::sync::Arc;
use tracing::error;
use types::{Event, MetricPoint};

use registry::MetricsRegistry;

/// Destination for the data points and events of one instance.
pub trait MetricSink: Send + Sync {
    fn gauge(&self, point: MetricPoint);

    fn event(&self, event: Event);
}

/// Writes into the shared registry under the instance's name.
pub struct RegistrySink {
    registry: Arc<MetricsRegistry>,
    instance: String,
}

impl RegistrySink {
    pub fn new(registry: Arc<MetricsRegistry>, instance: impl Into<String>) -> Self {
        Self {
            registry,
            instance: instance.into(),
        }
    }
}

impl MetricSink for RegistrySink {
    fn gauge(&self, point: MetricPoint) {
        self.registry.push_points(&self.instance, vec![point]);
    }

    fn event(&self, event: Event) {
        error!(
            instance = %self.instance,
            aggregation_key = %event.aggregation_key,
            event_type = event.event_type,
            "{}", event.text
        );
        self.registry.record_event(event);
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    points: std::sync::Mutex<Vec<MetricPoint>>,
    events: std::sync::Mutex<Vec<Event>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn points(&self) -> Vec<MetricPoint> {
        self.points.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Values of `name`, in emission order.
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.points()
            .into_iter()
            .filter(|p| p.name == name)
            .map(|p| p.value)
            .collect()
    }
}

#[cfg(test)]
impl MetricSink for RecordingSink {
    fn gauge(&self, point: MetricPoint) {
        self.points.lock().unwrap().push(point);
    }

    fn event(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}
