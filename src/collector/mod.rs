pub mod anomaly;
pub mod budget;
pub mod consumer_offsets;
pub mod highwater;
pub mod lag_calculator;
pub mod reporter;
pub mod timestamp_history;

use crate::error::{LagError, Result};
use std::future::Future;
use std::time::Duration;

/// Limits applied to every broker/coordinator request of a collection phase.
#[derive(Debug, Clone, Copy)]
pub struct RequestSettings {
    pub timeout: Duration,
    pub max_concurrent: usize,
    pub batch_size: usize,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_concurrent: 10,
            batch_size: 30,
        }
    }
}

/// Run one request under its own timeout.
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    what: impl FnOnce() -> String,
    request: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result,
        Err(_) => Err(LagError::Timeout(format!("{} after {timeout:?}", what()))),
    }
}

pub(crate) fn now_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}
