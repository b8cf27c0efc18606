use std::io::ErrorKind;
use std::process::Command;

use crate::provider::{MetricsProvider, MetricsSourceError};
use crate::sample::{DeviceMetrics, MetricField};

/// Query columns, in `MetricField::ALL` order.
pub const QUERY_FIELDS: &str = "temperature.gpu,utilization.gpu,utilization.memory,power.draw,memory.used,memory.total,clocks.sm,clocks.mem";

const SOURCE_NAME: &str = "nvidia-smi";

/// Primary metrics source: the NVIDIA management CLI in CSV query mode.
#[derive(Debug, Clone)]
pub struct NvidiaSmiProvider {
    binary: String,
}

impl NvidiaSmiProvider {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for NvidiaSmiProvider {
    fn default() -> Self {
        Self::new(SOURCE_NAME)
    }
}

impl MetricsProvider for NvidiaSmiProvider {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn sample(&mut self) -> Result<Vec<DeviceMetrics>, MetricsSourceError> {
        let output = Command::new(&self.binary)
            .arg(format!("--query-gpu={QUERY_FIELDS}"))
            .arg("--format=csv,noheader,nounits")
            .output()
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => MetricsSourceError::Unavailable {
                    source_name: SOURCE_NAME.to_string(),
                    reason: format!("'{}' not found", self.binary),
                },
                _ => MetricsSourceError::Io(err),
            })?;

        if !output.status.success() {
            return Err(MetricsSourceError::CommandFailed {
                command: self.binary.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_query_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parses `--format=csv,noheader,nounits` output, one line per device.
pub fn parse_query_output(text: &str) -> Result<Vec<DeviceMetrics>, MetricsSourceError> {
    let mut devices = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let columns: Vec<&str> = line.split(',').map(str::trim).collect();
        if columns.len() != MetricField::ALL.len() {
            return Err(parse_error(format!(
                "line {} has {} columns, expected {}",
                line_no + 1,
                columns.len(),
                MetricField::ALL.len()
            )));
        }

        let mut device = DeviceMetrics::default();
        for (field, raw) in MetricField::ALL.into_iter().zip(columns) {
            device.set(field, parse_value(raw).map_err(parse_error)?);
        }
        devices.push(device);
    }
    Ok(devices)
}

fn parse_value(raw: &str) -> Result<Option<f64>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('[') || trimmed.eq_ignore_ascii_case("N/A") {
        return Ok(None);
    }
    trimmed
        .parse::<f64>()
        .map(Some)
        .map_err(|_| format!("invalid value '{trimmed}'"))
}

fn parse_error(reason: String) -> MetricsSourceError {
    MetricsSourceError::Parse {
        source_name: SOURCE_NAME.to_string(),
        reason,
    }
}
