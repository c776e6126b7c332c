use thiserror::Error;

#[derive(Error, Debug)]
pub enum LagError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Admin API error: {0}")]
    Admin(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Highwater offsets unavailable: {0}")]
    HighwaterUnavailable(String),

    #[error("HTTP server error: {0}")]
    Http(String),
}

pub type Result<T> = std::result::Result<T, LagError>;

/// Outcome of a single collection unit (one group, one broker request) that
/// did not succeed. Skipping a unit and aborting the phase are different
/// variants so a caller has to decide which one it is handling.
#[derive(Error, Debug)]
pub enum UnitFailure {
    #[error("{unit} skipped: {error}")]
    Recoverable { unit: String, error: LagError },

    #[error(transparent)]
    Fatal(LagError),
}

impl UnitFailure {
    pub fn recoverable(unit: impl Into<String>, error: LagError) -> Self {
        Self::Recoverable {
            unit: unit.into(),
            error,
        }
    }
}
