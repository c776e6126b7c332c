use serde::Serialize;
use std::collections::HashMap;

pub type Labels = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Gauge,
}

impl MetricType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub name: &'static str,
    pub labels: Labels,
    pub value: f64,
    pub help: &'static str,
    pub metric_type: MetricType,
}

impl MetricPoint {
    pub fn gauge(name: &'static str, labels: Labels, value: f64, help: &'static str) -> Self {
        Self {
            name,
            labels,
            value,
            help,
            metric_type: MetricType::Gauge,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
}

/// One-off diagnostic raised next to the metrics of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub timestamp: f64,
    pub event_type: &'static str,
    pub title: String,
    pub text: String,
    pub tags: Labels,
    pub severity: Severity,
    pub aggregation_key: String,
}
