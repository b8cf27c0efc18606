use std::collections::BTreeMap;

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

/// One numeric device metric. The order of `ALL` matches the nvidia-smi query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetricField {
    Temperature,
    Utilization,
    MemoryUtilization,
    Power,
    MemoryUsed,
    MemoryTotal,
    SmClock,
    MemoryClock,
}

impl MetricField {
    pub const ALL: [MetricField; 8] = [
        MetricField::Temperature,
        MetricField::Utilization,
        MetricField::MemoryUtilization,
        MetricField::Power,
        MetricField::MemoryUsed,
        MetricField::MemoryTotal,
        MetricField::SmClock,
        MetricField::MemoryClock,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            MetricField::Temperature => "temp",
            MetricField::Utilization => "util",
            MetricField::MemoryUtilization => "mem_util",
            MetricField::Power => "power",
            MetricField::MemoryUsed => "mem_used",
            MetricField::MemoryTotal => "mem_total",
            MetricField::SmClock => "sm_clock",
            MetricField::MemoryClock => "mem_clock",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.suffix() == suffix)
    }
}

/// Upper bound on device indices accepted from a persisted series.
const MAX_DEVICES: usize = 64;

/// Key used in the persisted series, e.g. `gpu0_mem_util`.
pub fn metric_key(device: usize, field: MetricField) -> String {
    format!("gpu{device}_{}", field.suffix())
}

pub fn parse_metric_key(key: &str) -> Option<(usize, MetricField)> {
    let rest = key.strip_prefix("gpu")?;
    let (index, suffix) = rest.split_once('_')?;
    if index.is_empty() || !index.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    Some((index.parse().ok()?, MetricField::from_suffix(suffix)?))
}

/// Metrics for a single device; absent fields were not exposed by the source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceMetrics {
    pub temperature_c: Option<f64>,
    pub utilization_pct: Option<f64>,
    pub memory_utilization_pct: Option<f64>,
    pub power_w: Option<f64>,
    pub memory_used_mib: Option<f64>,
    pub memory_total_mib: Option<f64>,
    pub sm_clock_mhz: Option<f64>,
    pub memory_clock_mhz: Option<f64>,
}

impl DeviceMetrics {
    pub fn get(&self, field: MetricField) -> Option<f64> {
        match field {
            MetricField::Temperature => self.temperature_c,
            MetricField::Utilization => self.utilization_pct,
            MetricField::MemoryUtilization => self.memory_utilization_pct,
            MetricField::Power => self.power_w,
            MetricField::MemoryUsed => self.memory_used_mib,
            MetricField::MemoryTotal => self.memory_total_mib,
            MetricField::SmClock => self.sm_clock_mhz,
            MetricField::MemoryClock => self.memory_clock_mhz,
        }
    }

    pub fn set(&mut self, field: MetricField, value: Option<f64>) {
        let slot = match field {
            MetricField::Temperature => &mut self.temperature_c,
            MetricField::Utilization => &mut self.utilization_pct,
            MetricField::MemoryUtilization => &mut self.memory_utilization_pct,
            MetricField::Power => &mut self.power_w,
            MetricField::MemoryUsed => &mut self.memory_used_mib,
            MetricField::MemoryTotal => &mut self.memory_total_mib,
            MetricField::SmClock => &mut self.sm_clock_mhz,
            MetricField::MemoryClock => &mut self.memory_clock_mhz,
        };
        *slot = value;
    }

    pub fn is_empty(&self) -> bool {
        MetricField::ALL
            .into_iter()
            .all(|field| self.get(field).is_none())
    }
}

/// One timestamped snapshot. An error sample carries no device data.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub devices: Vec<DeviceMetrics>,
    pub error: Option<String>,
}

impl MetricSample {
    pub fn new(timestamp: f64, devices: Vec<DeviceMetrics>) -> Self {
        Self {
            timestamp,
            devices,
            error: None,
        }
    }

    pub fn error(timestamp: f64, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            devices: Vec::new(),
            error: Some(message.into()),
        }
    }

    pub fn now_timestamp() -> f64 {
        chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Flattened `(device, field, value)` triples for every present metric.
    pub fn values(&self) -> impl Iterator<Item = (usize, MetricField, f64)> + '_ {
        self.devices.iter().enumerate().flat_map(|(index, device)| {
            MetricField::ALL
                .into_iter()
                .filter_map(move |field| device.get(field).map(|value| (index, field, value)))
        })
    }
}

impl Serialize for MetricSample {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("timestamp", &self.timestamp)?;
        if let Some(error) = &self.error {
            map.serialize_entry("error", error)?;
        }
        for (index, field, value) in self.values() {
            map.serialize_entry(&metric_key(index, field), &value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MetricSample {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        let timestamp = raw
            .get("timestamp")
            .and_then(serde_json::Value::as_f64)
            .ok_or_else(|| <D::Error as de::Error>::missing_field("timestamp"))?;
        let error = raw
            .get("error")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);

        let mut devices: Vec<DeviceMetrics> = Vec::new();
        for (key, value) in &raw {
            let Some((index, field)) = parse_metric_key(key) else {
                continue;
            };
            if index >= MAX_DEVICES {
                continue;
            }
            if devices.len() <= index {
                devices.resize_with(index + 1, DeviceMetrics::default);
            }
            devices[index].set(field, value.as_f64());
        }

        Ok(Self {
            timestamp,
            devices,
            error,
        })
    }
}
