//! Dynamic metric registry.
//!
//! Series are created the first time a metric name is seen, with the label
//! keys of that first measurement. Those keys are fixed for the life of the
//! process: a later measurement with a different key set is rejected with
//! [`Error::LabelMismatch`], never widened into or silently reused.
//!
//! Every creation and update runs under one mutex. Scrapes read through the
//! Prometheus registry's own collectors and never take that mutex.

use prometheus::proto::MetricFamily;
use prometheus::{Encoder, GaugeVec, IntCounter, Opts, Registry, TextEncoder};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::measurement::Measurement;
use crate::{Error, Result};

/// A gauge family with a fixed label-key set.
#[derive(Clone)]
pub struct RegisteredSeries {
    name: String,
    label_keys: Vec<String>,
    gauge: GaugeVec,
}

impl RegisteredSeries {
    /// Returns the metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the label keys, sorted.
    pub fn label_keys(&self) -> &[String] {
        &self.label_keys
    }

    /// Orders label values by the series' keys, looking each one up by name.
    fn label_values<'a>(&self, labels: &'a BTreeMap<String, String>) -> Result<Vec<&'a str>> {
        let values: Option<Vec<&str>> = self
            .label_keys
            .iter()
            .map(|key| labels.get(key).map(String::as_str))
            .collect();
        match values {
            Some(values) if labels.len() == self.label_keys.len() => Ok(values),
            _ => Err(self.mismatch(labels.keys().cloned().collect())),
        }
    }

    fn mismatch(&self, actual: Vec<String>) -> Error {
        Error::LabelMismatch {
            name: self.name.clone(),
            expected: self.label_keys.clone(),
            actual,
        }
    }
}

/// Name → series table backing the `/metrics` endpoint.
pub struct MetricRegistry {
    series: Mutex<HashMap<String, RegisteredSeries>>,
    registry: Registry,
    rejected: IntCounter,
}

impl MetricRegistry {
    /// Creates an empty registry with its own rejection counter registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let rejected = IntCounter::new(
            "sensorbus_measurements_rejected_total",
            "Measurements rejected because their label keys differ from the registered series",
        )?;
        registry.register(Box::new(rejected.clone()))?;

        Ok(Self {
            series: Mutex::new(HashMap::new()),
            registry,
            rejected,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RegisteredSeries>> {
        // Gauges are updated atomically, so a poisoned table is still consistent.
        self.series.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the series registered under `name`, creating it if unseen.
    ///
    /// Fails with [`Error::LabelMismatch`] if `name` exists with other label keys.
    pub fn get_or_create(
        &self,
        name: &str,
        help: &str,
        label_keys: &[String],
    ) -> Result<RegisteredSeries> {
        let mut series = self.lock();
        self.get_or_create_locked(&mut series, name, help, label_keys)
    }

    fn get_or_create_locked(
        &self,
        series: &mut HashMap<String, RegisteredSeries>,
        name: &str,
        help: &str,
        label_keys: &[String],
    ) -> Result<RegisteredSeries> {
        let mut keys = label_keys.to_vec();
        keys.sort();
        keys.dedup();

        if let Some(existing) = series.get(name) {
            if existing.label_keys != keys {
                self.rejected.inc();
                return Err(existing.mismatch(keys));
            }
            return Ok(existing.clone());
        }

        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let gauge = GaugeVec::new(Opts::new(name, help), &key_refs)?;
        self.registry.register(Box::new(gauge.clone()))?;
        info!("Registered metric {} with labels {:?}", name, keys);

        let created = RegisteredSeries {
            name: name.to_string(),
            label_keys: keys,
            gauge,
        };
        series.insert(name.to_string(), created.clone());
        Ok(created)
    }

    /// Sets the value for one label-value combination of a series.
    ///
    /// Unseen combinations are created; the last write wins.
    pub fn set(
        &self,
        series: &RegisteredSeries,
        labels: &BTreeMap<String, String>,
        value: f64,
    ) -> Result<()> {
        let _guard = self.lock();
        Self::set_locked(series, labels, value)
    }

    fn set_locked(
        series: &RegisteredSeries,
        labels: &BTreeMap<String, String>,
        value: f64,
    ) -> Result<()> {
        let values = series.label_values(labels)?;
        series
            .gauge
            .get_metric_with_label_values(&values)?
            .set(value);
        Ok(())
    }

    /// Applies a measurement: creates its series if needed, then sets the value.
    pub fn record(&self, measurement: &Measurement) -> Result<()> {
        let mut series = self.lock();
        let target = self.get_or_create_locked(
            &mut series,
            &measurement.name,
            &measurement.help,
            &measurement.label_keys(),
        )?;
        Self::set_locked(&target, &measurement.labels, measurement.value)
    }

    /// Number of registered series.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no series has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Measurements rejected for a label-key mismatch so far.
    pub fn rejected(&self) -> u64 {
        self.rejected.get()
    }

    /// Snapshot of every registered metric family.
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Reads the current value of one series coordinate from a snapshot.
    pub fn value(&self, name: &str, labels: &BTreeMap<String, String>) -> Option<f64> {
        self.gather()
            .iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| family.get_metric())
            .find(|metric| {
                let pairs = metric.get_label();
                pairs.len() == labels.len()
                    && pairs.iter().all(|pair| {
                        labels.get(pair.get_name()).map(String::as_str) == Some(pair.get_value())
                    })
            })
            .map(|metric| metric.get_gauge().get_value())
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_last_write_wins() {
        let registry = MetricRegistry::new().unwrap();
        let origin = labels(&[("origin", "cpu0")]);

        registry.record(&Measurement::new("cpu_freq", "CPU", 1200.0, "cpu0")).unwrap();
        registry.record(&Measurement::new("cpu_freq", "CPU", 1800.0, "cpu0")).unwrap();

        assert_eq!(registry.value("cpu_freq", &origin), Some(1800.0));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_new_combination_in_existing_series() {
        let registry = MetricRegistry::new().unwrap();
        registry.record(&Measurement::new("zone_temp", "Zone", 40.0, "thermal_zone0")).unwrap();
        registry.record(&Measurement::new("zone_temp", "Zone", 50.0, "thermal_zone1")).unwrap();

        assert_eq!(registry.len(), 1);
        let zone = |origin: &str| registry.value("zone_temp", &labels(&[("origin", origin)]));
        assert_eq!(zone("thermal_zone0"), Some(40.0));
        assert_eq!(zone("thermal_zone1"), Some(50.0));
        assert_eq!(zone("thermal_zone2"), None);
    }

    #[test]
    fn test_labels_matched_by_name() {
        let registry = MetricRegistry::new().unwrap();
        let keys = vec!["origin".to_string(), "host".to_string()];
        let series = registry.get_or_create("load", "Load", &keys).unwrap();
        assert_eq!(series.label_keys(), &["host".to_string(), "origin".to_string()]);

        // Insertion order of the incoming map is irrelevant.
        let mut incoming = BTreeMap::new();
        incoming.insert("origin".to_string(), "cpu1".to_string());
        incoming.insert("host".to_string(), "pi".to_string());
        registry.set(&series, &incoming, 0.5).unwrap();

        assert_eq!(
            registry.value("load", &labels(&[("host", "pi"), ("origin", "cpu1")])),
            Some(0.5)
        );
    }

    #[test]
    fn test_mismatched_keys_are_rejected() {
        let registry = MetricRegistry::new().unwrap();
        registry.record(&Measurement::new("mem", "Memory", 1.0, "MemFree")).unwrap();

        let mut other = Measurement::new("mem", "Memory", 2.0, "MemFree");
        other.labels.insert("host".to_string(), "pi".to_string());
        let err = registry.record(&other).unwrap_err();
        assert!(matches!(err, Error::LabelMismatch { .. }));
        assert_eq!(registry.rejected(), 1);

        // The first shape is untouched.
        assert_eq!(registry.value("mem", &labels(&[("origin", "MemFree")])), Some(1.0));

        let series = registry.get_or_create("mem", "Memory", &["origin".to_string()]).unwrap();
        assert!(registry.set(&series, &labels(&[("zone", "x")]), 3.0).is_err());
    }

    #[test]
    fn test_invalid_metric_name_is_an_error() {
        let registry = MetricRegistry::new().unwrap();
        let m = Measurement::new("cpu-temp", "CPU", 1.0, "cpu0");
        assert!(matches!(registry.record(&m), Err(Error::Prometheus(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_encode_text() {
        let registry = MetricRegistry::new().unwrap();
        let reading = Measurement::new("zone_temp", "Zone temperature", 41.5, "thermal_zone0");
        registry.record(&reading).unwrap();

        let text = registry.encode_text().unwrap();
        assert!(text.contains("# HELP zone_temp Zone temperature"));
        assert!(text.contains("# TYPE zone_temp gauge"));
        assert!(text.contains("zone_temp{origin=\"thermal_zone0\"} 41.5"));
        assert!(text.contains("sensorbus_measurements_rejected_total 0"));
    }
}
