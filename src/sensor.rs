//! ==============================================================================
//! sensor.rs - sensor source abstraction
//! ==============================================================================
//!
//! purpose:
//!     the one pluggable seam between the monitor and the hardware.
//!     a source answers "what are the current values?" and nothing else:
//!     no timers, no clients, no caching of samples.
//!
//! implementations:
//!     - HwmonSource: linux /sys/class/hwmon sysfs interface
//!     - MockSource: synthetic fan/temperature values for hosts without hwmon
//!
//! relationships:
//!     - used by: sampler.rs (called once per tick on the blocking pool)
//!     - produces: domain.rs (SensorRead / Readings)
//!
//! ==============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::domain::{Reading, SensorRead};
use crate::error::SensorError;

pub trait SensorSource: Send + Sync {
    /// short label for logs
    fn name(&self) -> &str;

    /// read every channel once
    ///
    /// may block on sysfs; callers run it off the async executor. Individual
    /// channel failures go into `SensorRead::errors`, only a total failure is
    /// an `Err`.
    fn read(&self) -> Result<SensorRead, SensorError>;
}

// ==============================================================================================
// HWMON IMPLEMENTATION (linux sysfs)
// ==============================================================================================
// layout: <root>/hwmonN/{name, temp1_input, temp1_label, fan1_input, in0_input, ...}
// see https://www.kernel.org/doc/html/latest/hwmon/sysfs-interface.html

pub const DEFAULT_HWMON_ROOT: &str = "/sys/class/hwmon";

#[derive(Debug, Clone, PartialEq)]
struct Channel {
    path: PathBuf,
    name: String,
    kind: String,
}

pub struct HwmonSource {
    root: PathBuf,
    // discovered once so the metric set stays stable between samples;
    // empty means "not found yet", retried on the next read
    channels: Mutex<Vec<Channel>>,
}

impl HwmonSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let channels = discover(&root);
        if channels.is_empty() {
            tracing::warn!(root = %root.display(), "no hwmon channels found, will keep looking");
        } else {
            tracing::info!(root = %root.display(), count = channels.len(), "discovered hwmon channels");
        }
        Self { root, channels: Mutex::new(channels) }
    }
}

impl SensorSource for HwmonSource {
    fn name(&self) -> &str {
        "hwmon"
    }

    fn read(&self) -> Result<SensorRead, SensorError> {
        let channels = {
            let mut guard = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.is_empty() {
                *guard = discover(&self.root);
            }
            guard.clone()
        };

        if channels.is_empty() {
            return Err(SensorError::Unavailable(format!(
                "no *_input channels under {}",
                self.root.display()
            )));
        }

        let mut out = SensorRead::default();
        for ch in &channels {
            match read_raw(&ch.path) {
                Ok(raw) => {
                    let (value, unit) = scale(&ch.kind, raw);
                    out.readings.insert(ch.name.clone(), Reading::new(value, unit, ch.kind.clone()));
                }
                Err(e) => out.errors.push(format!("Failed to read {}: {}", ch.path.display(), e)),
            }
        }

        if out.readings.is_empty() {
            return Err(SensorError::Unavailable(format!(
                "all {} hwmon channels failed",
                channels.len()
            )));
        }
        Ok(out)
    }
}

fn discover(root: &Path) -> Vec<Channel> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };

    let mut dirs: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    dirs.sort();

    let mut channels = Vec::new();
    for dir in dirs {
        let Ok(files) = std::fs::read_dir(&dir) else {
            continue;
        };
        let dir_name = dir.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let index = dir_name.trim_start_matches("hwmon");
        let chip = slurp(&dir.join("name")).unwrap_or_default();

        let mut inputs: Vec<PathBuf> = files
            .flatten()
            .map(|f| f.path())
            .filter(|p| p.file_name().is_some_and(|n| n.to_string_lossy().ends_with("_input")))
            .collect();
        inputs.sort();

        let labelled: Vec<(PathBuf, String, String)> = inputs
            .into_iter()
            .map(|path| {
                let fname = path.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
                let stem = fname.trim_end_matches("_input").to_string();
                let label = slurp(&dir.join(format!("{stem}_label"))).unwrap_or_else(|| stem.clone());
                (path, stem, label)
            })
            .collect();

        // chips label e.g. temp1 and fan1 both "CPU"; the stem keeps every channel reported
        let mut uses: HashMap<&str, usize> = HashMap::new();
        for (_, _, label) in &labelled {
            *uses.entry(label.as_str()).or_default() += 1;
        }

        for (path, stem, label) in &labelled {
            let name = if uses[label.as_str()] > 1 && label != stem {
                format!("{index}:{chip} {label} ({stem})")
            } else {
                format!("{index}:{chip} {label}")
            };
            channels.push(Channel { name, kind: channel_kind(stem), path: path.clone() });
        }
    }
    channels
}

/// "temp1" -> "temp", "in0" -> "voltage", "fan2" -> "fan"
fn channel_kind(stem: &str) -> String {
    let prefix = stem.split(|c: char| c.is_ascii_digit()).next().unwrap_or(stem);
    match prefix {
        "in" => "voltage".to_string(),
        other => other.to_string(),
    }
}

/// sysfs reports milli-units (micro for power)
fn scale(kind: &str, raw: i64) -> (f64, &'static str) {
    let raw = raw as f64;
    match kind {
        "temp" => (raw / 1000.0, "C"),
        "voltage" => (raw / 1000.0, "V"),
        "curr" => (raw / 1000.0, "A"),
        "power" => (raw / 1_000_000.0, "W"),
        "fan" => (raw, "rpm"),
        _ => (raw, ""),
    }
}

fn slurp(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn read_raw(path: &Path) -> std::io::Result<i64> {
    let text = std::fs::read_to_string(path)?;
    text.trim()
        .parse::<i64>()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

// ==============================================================================================
// MOCK IMPLEMENTATION (for dev machines / WSL without hwmon)
// ==============================================================================================

pub struct MockSource {
    tick: AtomicU64,
}

impl MockSource {
    pub fn new() -> Self {
        tracing::info!("Using MOCK sensor source (no hardware access)");
        Self { tick: AtomicU64::new(0) }
    }
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorSource for MockSource {
    fn name(&self) -> &str {
        "mock"
    }

    fn read(&self) -> Result<SensorRead, SensorError> {
        let t = self.tick.fetch_add(1, Ordering::Relaxed) as f64;
        // slow triangle waves so the charts have something to draw
        let wave = |period: f64| {
            let phase = (t % period) / period;
            if phase < 0.5 { phase * 2.0 } else { 2.0 - phase * 2.0 }
        };

        let mut out = SensorRead::default();
        out.readings.insert("0:mock cpu fan".into(), Reading::new(900.0 + 600.0 * wave(40.0), "rpm", "fan"));
        out.readings.insert("0:mock case fan".into(), Reading::new(700.0 + 200.0 * wave(90.0), "rpm", "fan"));
        out.readings.insert("0:mock Package id 0".into(), Reading::new(45.0 + 30.0 * wave(40.0), "C", "temp"));
        out.readings.insert("1:mock edge".into(), Reading::new(40.0 + 35.0 * wave(60.0), "C", "temp"));
        Ok(out)
    }
}
