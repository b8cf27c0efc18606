//! Hardware telemetry sampled alongside a render job.
//!
//! A [`TelemetrySampler`] runs on its own thread, asks an ordered list of
//! [`MetricsProvider`]s for device readings once per interval, persists the
//! growing series atomically after every tick, and produces a
//! [`MetricsSummary`] once stopped.

mod nvidia;
mod provider;
mod sample;
mod sampler;
mod store;
mod summary;
mod sysfs;

use std::path::PathBuf;

pub use nvidia::{parse_query_output, NvidiaSmiProvider, QUERY_FIELDS};
pub use provider::{sample_chain, BoxedProvider, MetricsProvider, MetricsSourceError};
pub use sample::{metric_key, parse_metric_key, DeviceMetrics, MetricField, MetricSample};
pub use sampler::{SamplerError, SamplerState, TelemetrySampler};
pub use store::{load_series, write_json_atomic, PersistError};
pub use summary::{FieldStats, MetricsSummary};
pub use sysfs::SysfsProvider;

/// The standard provider chain: nvidia-smi first, DRM sysfs second.
pub fn default_providers(nvidia_smi: &str, drm_root: impl Into<PathBuf>) -> Vec<BoxedProvider> {
    vec![
        Box::new(NvidiaSmiProvider::new(nvidia_smi)) as BoxedProvider,
        Box::new(SysfsProvider::new(drm_root)) as BoxedProvider,
    ]
}
