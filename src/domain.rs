use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// one metric value as reported by a sensor source
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: f64,
    /// display unit, e.g. "C", "rpm", "V" (empty when the kind has none)
    pub unit: String,
    /// hwmon channel class ("temp", "fan", "voltage", ...), one chart per kind
    pub kind: String,
}

impl Reading {
    pub fn new(value: f64, unit: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { value, unit: unit.into(), kind: kind.into() }
    }
}

/// metric name -> reading, ordered so the wire output is stable
pub type Readings = BTreeMap<String, Reading>;

/// result of one successful source read
///
/// `errors` carries the channels that failed this time around; they are left
/// out of `readings` rather than failing the whole read.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SensorRead {
    pub readings: Readings,
    pub errors: Vec<String>,
}

/// a timestamped snapshot of every monitored metric
///
/// immutable once published; shared as `Arc<Sample>` between the sampler,
/// the history ring and the dispatcher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// strictly increasing per process, orders samples for a session
    pub seq: u64,
    /// wall-clock time of the poll (RFC 3339 on the wire)
    pub timestamp: DateTime<Utc>,
    pub readings: Readings,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[cfg(test)]
impl Sample {
    pub fn value(&self, metric: &str) -> Option<f64> {
        self.readings.get(metric).map(|r| r.value)
    }
}
