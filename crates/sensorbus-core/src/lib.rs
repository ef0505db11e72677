//! Sensorbus Core Library
//!
//! Polls sysfs/procfs sensor files, carries the readings as JSON messages
//! through a partitioned broker, and folds them into a Prometheus registry
//! whose series are created on first sight.

pub mod broker;
pub mod consumer;
pub mod error;
pub mod measurement;
pub mod origin;
pub mod poller;
pub mod publisher;
pub mod registry;
pub mod spec;

pub use broker::{ConsumerGroup, InitialOffset, MemoryBroker, Transport};
pub use consumer::{Consumer, ConsumerConfig, ConsumerStats};
pub use error::{Error, Result};
pub use measurement::{Measurement, ORIGIN_LABEL};
pub use origin::{OriginExtractor, UNKNOWN_ORIGIN};
pub use poller::{poll_once, SensorPoller};
pub use publisher::{Publisher, PublisherConfig, PublisherStats, PublisherTasks};
pub use registry::MetricRegistry;
pub use spec::{Aggregation, SensorFile, SensorSpec};
