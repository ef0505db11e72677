//! Origin label derivation.
//!
//! The `origin` label tells apart several physical sources of the same
//! metric: a CPU core, a thermal zone, a memory statistic key.

use regex::Regex;
use std::path::Path;
use tracing::warn;

/// Origin reported when nothing identifies the source.
pub const UNKNOWN_ORIGIN: &str = "unknown";

/// Strategy for turning a sensor path into an origin label value.
///
/// Built once per sensor when the config is loaded, so the pattern is
/// compiled a single time and shared by every tick.
#[derive(Debug, Clone)]
pub enum OriginExtractor {
    /// Derive the origin from well-known sysfs path shapes.
    Positional,
    /// The whole substring matched by the pattern is the origin.
    Pattern(Regex),
    /// The configured pattern did not compile; every path maps to `unknown`.
    Invalid(String),
}

impl OriginExtractor {
    /// Compiles the optional origin pattern of the named sensor.
    ///
    /// A pattern that fails to compile is logged here, once, and the
    /// extractor falls back to `unknown` for every path.
    pub fn compile(sensor: &str, pattern: Option<&str>) -> Self {
        match pattern {
            None => OriginExtractor::Positional,
            Some(source) => match Regex::new(source) {
                Ok(re) => OriginExtractor::Pattern(re),
                Err(e) => {
                    warn!(
                        "Invalid origin regex {:?} for sensor {}: {}",
                        source, sensor, e
                    );
                    OriginExtractor::Invalid(source.to_string())
                }
            },
        }
    }

    /// Returns the origin label value for a sensor file path.
    pub fn extract(&self, path: &Path) -> String {
        match self {
            OriginExtractor::Positional => positional_origin(path),
            OriginExtractor::Pattern(re) => {
                let path = path.to_string_lossy();
                re.find(&path)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| UNKNOWN_ORIGIN.to_string())
            }
            OriginExtractor::Invalid(_) => UNKNOWN_ORIGIN.to_string(),
        }
    }
}

/// Fallback for sensors without an origin pattern.
///
/// `/sys/devices/system/cpu/cpuN/cpufreq/<file>` names the core two levels up,
/// `/sys/class/thermal/thermal_zoneN/<file>` names the zone one level up.
fn positional_origin(path: &Path) -> String {
    let text = path.to_string_lossy();
    let dir = if text.contains("/cpu") {
        path.parent().and_then(Path::parent)
    } else if text.contains("/thermal_zone") {
        path.parent()
    } else {
        None
    };

    dir.and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| UNKNOWN_ORIGIN.to_string())
}
