use std::collections::{BTreeMap, BTreeSet};

use serde::ser::{SerializeStruct, Serializer};
use serde::Serialize;

use crate::sample::{metric_key, MetricField, MetricSample};

const UNAVAILABLE: &str = "unavailable";

/// Statistics for one metric key across a series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldStats {
    Available { min: f64, max: f64, avg: f64 },
    Unavailable,
}

impl FieldStats {
    fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return FieldStats::Unavailable;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = values.iter().sum::<f64>() / values.len() as f64;
        FieldStats::Available {
            min,
            max,
            avg: avg.clamp(min, max),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, FieldStats::Available { .. })
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum StatValue {
    Number(f64),
    Missing(&'static str),
}

impl Serialize for FieldStats {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let (min, max, avg) = match *self {
            FieldStats::Available { min, max, avg } => (
                StatValue::Number(min),
                StatValue::Number(max),
                StatValue::Number(avg),
            ),
            FieldStats::Unavailable => (
                StatValue::Missing(UNAVAILABLE),
                StatValue::Missing(UNAVAILABLE),
                StatValue::Missing(UNAVAILABLE),
            ),
        };
        let mut state = serializer.serialize_struct("FieldStats", 3)?;
        state.serialize_field("min", &min)?;
        state.serialize_field("max", &max)?;
        state.serialize_field("avg", &avg)?;
        state.end()
    }
}

/// Min/max/avg per metric key over a finished series.
///
/// The key set covers every canonical field of every device index seen in the
/// series, and always device 0, so a consumer can rely on `gpu0_*` being
/// present even when no sample succeeded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub sample_count: usize,
    #[serde(rename = "gpu_metrics_summary")]
    pub fields: BTreeMap<String, FieldStats>,
}

impl MetricsSummary {
    pub fn from_samples(samples: &[MetricSample]) -> Self {
        let mut devices: BTreeSet<usize> = BTreeSet::from([0]);
        let mut observed: BTreeMap<(usize, MetricField), Vec<f64>> = BTreeMap::new();

        for sample in samples.iter().filter(|sample| !sample.is_error()) {
            devices.extend(0..sample.devices.len());
            for (device, field, value) in sample.values() {
                if value.is_finite() {
                    observed.entry((device, field)).or_default().push(value);
                }
            }
        }

        let mut fields = BTreeMap::new();
        for device in devices {
            for field in MetricField::ALL {
                let stats = observed
                    .get(&(device, field))
                    .map(|values| FieldStats::from_values(values))
                    .unwrap_or(FieldStats::Unavailable);
                fields.insert(metric_key(device, field), stats);
            }
        }

        Self {
            sample_count: samples.len(),
            fields,
        }
    }

    pub fn field(&self, key: &str) -> Option<&FieldStats> {
        self.fields.get(key)
    }

    pub fn available_fields(&self) -> usize {
        self.fields.values().filter(|stats| stats.is_available()).count()
    }
}
