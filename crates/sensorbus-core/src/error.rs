//! Error types for the sensorbus pipeline.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur anywhere between a sensor file and the registry.
#[derive(Error, Debug)]
pub enum Error {
    /// Filesystem or socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Sensor document is structurally valid but semantically wrong.
    #[error("Invalid sensor config: {0}")]
    Config(String),

    /// Sensor document is not valid TOML.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Sensor document or wire message is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Glob pattern could not be parsed.
    #[error("Invalid glob pattern: {0}")]
    Glob(#[from] glob::PatternError),

    /// Metric could not be created or registered.
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    /// A measurement's label keys differ from the keys its series was registered with.
    #[error("Label mismatch for {name}: registered {expected:?}, got {actual:?}")]
    LabelMismatch {
        name: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    /// Broker rejected or failed an operation.
    #[error("Broker error: {0}")]
    Broker(String),

    /// The other side of an internal channel has gone away.
    #[error("Channel closed: {0}")]
    Closed(&'static str),

    /// Kafka client error.
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}
