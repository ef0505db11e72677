//! Measurements and their wire encoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::origin::UNKNOWN_ORIGIN;
use crate::Result;

/// Name of the label every sensor measurement carries.
pub const ORIGIN_LABEL: &str = "origin";

/// One timestamped reading, the unit of transfer between poller and registry.
///
/// Serialized as JSON: `{"name", "help", "value", "labels", "timestamp"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    pub help: String,
    pub value: f64,
    pub labels: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Measurement {
    /// Creates a measurement carrying only the origin label, stamped now.
    pub fn new(name: &str, help: &str, value: f64, origin: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(ORIGIN_LABEL.to_string(), origin.to_string());
        Self {
            name: name.to_string(),
            help: help.to_string(),
            value,
            labels,
            timestamp: Utc::now(),
        }
    }

    /// Returns the origin label, if present.
    pub fn origin(&self) -> Option<&str> {
        self.labels.get(ORIGIN_LABEL).map(String::as_str)
    }

    /// Broker partition key: readings of one series stay ordered.
    pub fn partition_key(&self) -> String {
        format!("{}_{}", self.name, self.origin().unwrap_or(UNKNOWN_ORIGIN))
    }

    /// Returns the label keys in sorted order.
    pub fn label_keys(&self) -> Vec<String> {
        self.labels.keys().cloned().collect()
    }

    /// Encodes the measurement as a wire message.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a wire message.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
