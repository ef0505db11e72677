//! Per-sensor polling.
//!
//! Every [`SensorSpec`] gets its own [`SensorPoller`] task. A tick expands the
//! glob, reads each file, applies the aggregation policy and hands the
//! resulting measurements to the publisher. Nothing a single file does can
//! stop the loop: unreadable or unparsable files are logged and skipped.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::measurement::Measurement;
use crate::publisher::Publisher;
use crate::spec::{Aggregation, SensorSpec};

/// Timer-driven poller for one sensor.
pub struct SensorPoller {
    id: usize,
    spec: Arc<SensorSpec>,
    publisher: Publisher,
    interval: Duration,
}

impl SensorPoller {
    /// Creates a poller; `id` only shows up in logs.
    pub fn new(id: usize, spec: Arc<SensorSpec>, publisher: Publisher, interval: Duration) -> Self {
        Self {
            id,
            spec,
            publisher,
            interval,
        }
    }

    /// Polls until the token is cancelled or the publisher shuts down.
    ///
    /// Ticks are strictly sequential. A full publish buffer blocks here, which
    /// stretches the poll cadence instead of dropping readings.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Started poller {} for sensor: {}", self.id, self.spec.pattern);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for measurement in poll_once(&self.spec) {
                debug!(
                    "Publishing {}{:?} = {:.2}",
                    measurement.name, measurement.labels, measurement.value
                );
                if let Err(e) = self.publisher.publish(measurement).await {
                    warn!("Poller {} stopping: {}", self.id, e);
                    return;
                }
            }
        }

        info!("Poller {} shutting down: {}", self.id, self.spec.pattern);
    }
}

/// Runs a single tick for a sensor and returns the measurements it yields.
pub fn poll_once(spec: &SensorSpec) -> Vec<Measurement> {
    let paths = expand(&spec.pattern);
    if paths.is_empty() {
        warn!("No paths found for {}", spec.pattern);
        return Vec::new();
    }

    if let Aggregation::AllowListedKeys(keys) = &spec.aggregation {
        return paths
            .iter()
            .filter_map(|path| read_file(path))
            .flat_map(|content| parse_key_values(&content, keys))
            .filter_map(|(key, value)| {
                let value = scale(spec, &key, value)?;
                Some(Measurement::new(&spec.name, &spec.help, value, &key))
            })
            .collect();
    }

    let readings: Vec<(PathBuf, f64)> = paths
        .into_iter()
        .filter_map(|path| {
            let raw = read_integer(&path)?;
            let value = scale(spec, &path.to_string_lossy(), raw as f64)?;
            Some((path, value))
        })
        .collect();

    aggregate(spec, readings)
}

/// Divides a raw reading, dropping results that JSON cannot carry.
fn scale(spec: &SensorSpec, source: &str, raw: f64) -> Option<f64> {
    let value = raw / spec.divisor;
    if !value.is_finite() {
        warn!(
            "Dropping non-finite reading {} / {} from {}",
            raw, spec.divisor, source
        );
        return None;
    }
    Some(value)
}

/// Applies the sensor's single-value policy to the readings of one tick.
fn aggregate(spec: &SensorSpec, readings: Vec<(PathBuf, f64)>) -> Vec<Measurement> {
    if readings.is_empty() {
        return Vec::new();
    }

    let values = readings.iter().map(|(_, value)| *value);
    let combined = match spec.aggregation {
        Aggregation::Average => Some(values.sum::<f64>() / readings.len() as f64),
        Aggregation::Peak => values.reduce(f64::max),
        Aggregation::None | Aggregation::AllowListedKeys(_) => None,
    };

    match (combined, spec.aggregation.origin_label()) {
        (Some(value), Some(origin)) => {
            vec![Measurement::new(&spec.name, &spec.help, value, origin)]
        }
        _ => readings
            .iter()
            .map(|(path, value)| {
                let origin = spec.origin().extract(path);
                Measurement::new(&spec.name, &spec.help, *value, &origin)
            })
            .collect(),
    }
}

/// Expands a glob into existing paths, logging unreadable entries.
fn expand(pattern: &str) -> Vec<PathBuf> {
    let entries = match glob::glob(pattern) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Invalid glob pattern {:?}: {}", pattern, e);
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Failed to access {}: {}", e.path().display(), e);
                None
            }
        })
        .collect()
}

fn read_file(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            None
        }
    }
}

/// Reads a sensor file holding a single decimal integer.
fn read_integer(path: &Path) -> Option<i64> {
    let content = read_file(path)?;
    match content.trim().parse::<i64>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Failed to parse value in {}: {}", path.display(), e);
            None
        }
    }
}

/// Parses `key: value [unit]` lines, keeping only allow-listed keys.
///
/// Lines with fewer than two fields or a non-numeric or non-finite value
/// are ignored.
pub fn parse_key_values(content: &str, keys: &[String]) -> Vec<(String, f64)> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let key = fields.next()?.trim_end_matches(':');
            let value = fields.next()?;
            if !keys.iter().any(|allowed| allowed == key) {
                return None;
            }
            let value = value.parse::<f64>().ok().filter(|v| v.is_finite())?;
            Some((key.to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::publisher::PublisherConfig;

    fn write(dir: &Path, relative: &str, content: &str) {
        let path = dir.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn zones(dir: &Path) -> String {
        write(dir, "thermal_zone0/temp", "40000\n");
        write(dir, "thermal_zone1/temp", "50000\n");
        write(dir, "thermal_zone2/temp", "30000\n");
        format!("{}/thermal_zone*/temp", dir.display())
    }

    #[test]
    fn test_zero_matches_emit_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/nothing_here*/temp", dir.path().display());
        let spec = SensorSpec::new(&pattern, "zone_temp", "Zone temperature", Aggregation::None);
        assert!(poll_once(&spec).is_empty());
    }

    #[test]
    fn test_invalid_glob_emits_nothing() {
        let spec = SensorSpec::new("/sys/[", "zone_temp", "Zone temperature", Aggregation::None);
        assert!(poll_once(&spec).is_empty());
    }

    #[test]
    fn test_one_measurement_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = zones(dir.path());
        let spec = SensorSpec::new(&pattern, "zone_temp", "Zone temperature", Aggregation::None)
            .with_divisor(1000.0);

        let mut measurements = poll_once(&spec);
        measurements.sort_by(|a, b| a.origin().cmp(&b.origin()));

        let got: Vec<(&str, f64)> = measurements
            .iter()
            .map(|m| (m.origin().unwrap(), m.value))
            .collect();
        assert_eq!(
            got,
            vec![("thermal_zone0", 40.0), ("thermal_zone1", 50.0), ("thermal_zone2", 30.0)]
        );
    }

    #[test]
    fn test_average() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = zones(dir.path());
        let spec = SensorSpec::new(&pattern, "zone_temp", "Zone temperature", Aggregation::Average)
            .with_divisor(1000.0);

        let measurements = poll_once(&spec);
        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].value, 40.0);
        assert_eq!(measurements[0].origin(), Some("average"));
    }

    #[test]
    fn test_peak() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = zones(dir.path());
        let spec = SensorSpec::new(&pattern, "zone_temp", "Zone temperature", Aggregation::Peak)
            .with_divisor(1000.0);

        let measurements = poll_once(&spec);
        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].value, 50.0);
        assert_eq!(measurements[0].origin(), Some("peak"));
    }

    #[test]
    fn test_bad_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "thermal_zone0/temp", "42000\n");
        write(dir.path(), "thermal_zone1/temp", "n/a\n");
        write(dir.path(), "thermal_zone2/temp", "");
        // A directory matches the glob but cannot be read as a file.
        fs::create_dir_all(dir.path().join("thermal_zone3/temp")).unwrap();
        let pattern = format!("{}/thermal_zone*/temp", dir.path().display());
        let spec = SensorSpec::new(&pattern, "zone_temp", "Zone temperature", Aggregation::None)
            .with_divisor(1000.0);

        let measurements = poll_once(&spec);
        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].origin(), Some("thermal_zone0"));
        assert_eq!(measurements[0].value, 42.0);
    }

    #[test]
    fn test_aggregation_without_readings_emits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "thermal_zone0/temp", "garbage\n");
        let pattern = format!("{}/thermal_zone*/temp", dir.path().display());
        let spec = SensorSpec::new(&pattern, "zone_temp", "Zone temperature", Aggregation::Average);
        assert!(poll_once(&spec).is_empty());
    }

    #[test]
    fn test_origin_regex_applies_to_full_path() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = zones(dir.path());
        let spec = SensorSpec::new(&pattern, "zone_temp", "Zone temperature", Aggregation::None)
            .with_origin_regex(r"zone\d");

        let mut origins: Vec<String> = poll_once(&spec)
            .into_iter()
            .map(|m| m.origin().unwrap().to_string())
            .collect();
        origins.sort();
        assert_eq!(origins, vec!["zone0", "zone1", "zone2"]);
    }

    #[test]
    fn test_allow_listed_keys() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "meminfo",
            "MemAvailable: 123456 kB\nMemFree: 45 kB\nUnrelated: 1 kB\n",
        );
        let pattern = format!("{}/meminfo", dir.path().display());
        let keys = vec!["MemAvailable".to_string(), "MemFree".to_string()];
        let aggregation = Aggregation::AllowListedKeys(keys);
        let spec = SensorSpec::new(&pattern, "memory_kb", "Memory statistics", aggregation);

        let measurements = poll_once(&spec);
        let got: Vec<(&str, f64)> = measurements
            .iter()
            .map(|m| (m.origin().unwrap(), m.value))
            .collect();
        assert_eq!(got, vec![("MemAvailable", 123456.0), ("MemFree", 45.0)]);
    }

    #[test]
    fn test_parse_key_values_ignores_malformed_lines() {
        let keys = vec!["MemFree".to_string(), "Cached".to_string()];
        let content = "MemFree:\nCached: lots kB\n\nMemFree: 7 kB\n";
        assert_eq!(
            parse_key_values(content, &keys),
            vec![("MemFree".to_string(), 7.0)]
        );
    }

    #[test]
    fn test_parse_key_values_rejects_non_finite() {
        let keys = vec![
            "MemFree".to_string(),
            "Cached".to_string(),
            "Buffers".to_string(),
        ];
        let content = "MemFree: NaN kB\nCached: inf kB\nBuffers: -infinity kB\n";
        assert!(parse_key_values(content, &keys).is_empty());
    }

    #[test]
    fn test_overflowing_division_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "thermal_zone0/temp", "40000\n");
        let pattern = format!("{}/thermal_zone*/temp", dir.path().display());
        let spec = SensorSpec::new(&pattern, "zone_temp", "Zone temperature", Aggregation::None)
            .with_divisor(1e-308);
        assert!(poll_once(&spec).is_empty());
    }

    #[tokio::test]
    async fn test_run_publishes_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let spec = SensorSpec::new(
            &zones(dir.path()),
            "zone_temp",
            "Zone temperature",
            Aggregation::Peak,
        )
        .with_divisor(1000.0);

        let broker = MemoryBroker::new(1);
        let (publisher, tasks) = Publisher::spawn(
            Arc::new(broker.clone()),
            "sensors",
            PublisherConfig::default(),
        );
        let poller = SensorPoller::new(
            0,
            Arc::new(spec),
            publisher.clone(),
            Duration::from_millis(10),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poller.run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.partition_len("sensors", 0) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("poller never published");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller ignored cancellation")
            .unwrap();

        drop(publisher);
        tasks.flush().await;
        let sent = broker.partition_len("sensors", 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.partition_len("sensors", 0), sent);
    }
}
