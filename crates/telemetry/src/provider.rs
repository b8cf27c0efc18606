use thiserror::Error;

use crate::sample::{DeviceMetrics, MetricSample};

/// Why one metrics source could not produce a reading this tick.
#[derive(Debug, Error)]
pub enum MetricsSourceError {
    #[error("{source_name} is not available: {reason}")]
    Unavailable { source_name: String, reason: String },

    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("failed to parse {source_name} output: {reason}")]
    Parse { source_name: String, reason: String },

    #[error("no devices reported by {0}")]
    NoDevices(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A source of device metrics, tried in order by the sampler.
pub trait MetricsProvider: Send {
    fn name(&self) -> &str;
    fn sample(&mut self) -> Result<Vec<DeviceMetrics>, MetricsSourceError>;
}

pub type BoxedProvider = Box<dyn MetricsProvider>;

/// Produces one sample from the first provider that succeeds. When every
/// provider fails the sample carries only an error marker.
pub fn sample_chain(providers: &mut [BoxedProvider], timestamp: f64) -> MetricSample {
    let mut failures = Vec::new();
    for provider in providers.iter_mut() {
        let outcome = provider.sample().and_then(|devices| {
            if devices.is_empty() {
                Err(MetricsSourceError::NoDevices(provider.name().to_string()))
            } else {
                Ok(devices)
            }
        });
        match outcome {
            Ok(devices) => return MetricSample::new(timestamp, devices),
            Err(err) => {
                tracing::debug!(provider = provider.name(), error = %err, "metrics source failed");
                failures.push(format!("{}: {err}", provider.name()));
            }
        }
    }

    if failures.is_empty() {
        MetricSample::error(timestamp, "no metrics providers configured")
    } else {
        MetricSample::error(timestamp, failures.join("; "))
    }
}
