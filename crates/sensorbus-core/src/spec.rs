//! Sensor definitions and the sensor document they are loaded from.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::origin::OriginExtractor;
use crate::{Error, Result};

/// How the values read in one tick are turned into measurements.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregation {
    /// One measurement per matched path.
    None,
    /// One measurement holding the arithmetic mean.
    Average,
    /// One measurement holding the maximum.
    Peak,
    /// Each matched file is a `key: value unit` document; one measurement per listed key.
    AllowListedKeys(Vec<String>),
}

impl Aggregation {
    /// Origin label carried by single-value aggregations.
    pub fn origin_label(&self) -> Option<&'static str> {
        match self {
            Aggregation::Average => Some("average"),
            Aggregation::Peak => Some("peak"),
            Aggregation::None | Aggregation::AllowListedKeys(_) => None,
        }
    }
}

/// Aggregation selector as written in the sensor document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    #[default]
    None,
    Average,
    Peak,
    AllowListedKeys,
}

/// One sensor as written in the sensor document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorEntry {
    /// Glob matching the sensor files (e.g., "/sys/class/thermal/thermal_zone*/temp")
    pub pattern: String,

    /// Metric name
    pub name: String,

    /// Metric help text
    pub help: String,

    /// Raw readings are divided by this value
    #[serde(default = "default_divisor")]
    pub divisor: f64,

    /// Regex whose whole match on the path becomes the origin label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_regex: Option<String>,

    /// Aggregation policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<AggregationKind>,

    /// Keys retained by `allow_listed_keys`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,

    /// Older documents select averaging with a flag
    #[serde(default)]
    pub is_average: bool,
}

/// The sensor document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorFile {
    /// Poll interval in milliseconds
    #[serde(default = "default_interval")]
    pub interval_ms: u64,

    /// Sensor sources
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
}

// Default value functions
fn default_divisor() -> f64 {
    1.0
}

fn default_interval() -> u64 {
    1000
}

fn default_keys() -> Vec<String> {
    vec!["MemAvailable".to_string(), "MemFree".to_string()]
}

impl SensorFile {
    /// Loads the sensor document. Paths ending in `.json` are read as JSON,
    /// everything else as TOML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    /// Parses a TOML sensor document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Parses a JSON sensor document.
    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Returns the poll interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Validates every entry and builds the shared, read-only specs.
    pub fn specs(&self) -> Result<Vec<Arc<SensorSpec>>> {
        if self.interval_ms == 0 {
            return Err(Error::Config("interval_ms must be positive".to_string()));
        }
        self.sensors
            .iter()
            .map(|entry| SensorSpec::try_from(entry.clone()).map(Arc::new))
            .collect()
    }
}

/// Immutable description of one sensor source.
#[derive(Debug)]
pub struct SensorSpec {
    pub pattern: String,
    pub name: String,
    pub help: String,
    pub divisor: f64,
    pub aggregation: Aggregation,
    origin: OriginExtractor,
}

impl SensorSpec {
    /// Creates a spec with the positional origin fallback.
    pub fn new(pattern: &str, name: &str, help: &str, aggregation: Aggregation) -> Self {
        Self {
            pattern: pattern.to_string(),
            name: name.to_string(),
            help: help.to_string(),
            divisor: 1.0,
            aggregation,
            origin: OriginExtractor::Positional,
        }
    }

    /// Sets the divisor applied to raw readings.
    pub fn with_divisor(mut self, divisor: f64) -> Self {
        self.divisor = divisor;
        self
    }

    /// Sets the origin pattern, compiling it once.
    pub fn with_origin_regex(mut self, pattern: &str) -> Self {
        self.origin = OriginExtractor::compile(&self.name, Some(pattern));
        self
    }

    /// Returns the origin extractor for this sensor.
    pub fn origin(&self) -> &OriginExtractor {
        &self.origin
    }
}

impl TryFrom<SensorEntry> for SensorSpec {
    type Error = Error;

    fn try_from(entry: SensorEntry) -> Result<Self> {
        if entry.pattern.trim().is_empty() {
            return Err(Error::Config(format!(
                "sensor {:?} has an empty pattern",
                entry.name
            )));
        }
        if !is_valid_metric_name(&entry.name) {
            return Err(Error::Config(format!(
                "invalid metric name {:?}",
                entry.name
            )));
        }
        if entry.help.trim().is_empty() {
            return Err(Error::Config(format!("sensor {} has no help text", entry.name)));
        }
        if !entry.divisor.is_finite() || entry.divisor == 0.0 {
            return Err(Error::Config(format!(
                "sensor {} has divisor {}, expected a finite non-zero number",
                entry.name, entry.divisor
            )));
        }

        let kind = match entry.aggregation {
            Some(kind) => kind,
            None if entry.is_average => AggregationKind::Average,
            None => AggregationKind::None,
        };
        let aggregation = match kind {
            AggregationKind::None => Aggregation::None,
            AggregationKind::Average => Aggregation::Average,
            AggregationKind::Peak => Aggregation::Peak,
            AggregationKind::AllowListedKeys => {
                let keys = entry.keys.unwrap_or_else(default_keys);
                if keys.is_empty() {
                    return Err(Error::Config(format!(
                        "sensor {} has an empty key allow-list",
                        entry.name
                    )));
                }
                Aggregation::AllowListedKeys(keys)
            }
        };

        let origin = OriginExtractor::compile(&entry.name, entry.origin_regex.as_deref());

        Ok(Self {
            pattern: entry.pattern,
            name: entry.name,
            help: entry.help,
            divisor: entry.divisor,
            aggregation,
            origin,
        })
    }
}

/// Checks a name against the Prometheus metric name grammar `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}
