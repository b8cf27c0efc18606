use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use gpuctx::Provider;
use serde::{Deserialize, Serialize};

/// Device class a job asks for, and the storage namespace its outputs land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTier {
    Cpu,
    Gpu,
}

impl DeviceTier {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceTier::Cpu => "cpu",
            DeviceTier::Gpu => "gpu",
        }
    }

    /// Context provider to try first for this tier.
    pub fn preferred_provider(self) -> Provider {
        match self {
            DeviceTier::Cpu => Provider::Software,
            DeviceTier::Gpu => Provider::Hardware,
        }
    }

    /// Tier a successfully acquired provider actually delivers.
    pub fn from_provider(provider: Provider) -> Self {
        match provider {
            Provider::Hardware => DeviceTier::Gpu,
            Provider::Software => DeviceTier::Cpu,
        }
    }
}

impl fmt::Display for DeviceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceTier {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceTier::Cpu),
            "gpu" => Ok(DeviceTier::Gpu),
            other => Err(format!("unknown device tier '{other}' (expected cpu or gpu)")),
        }
    }
}

/// A submitted render: the script body, the scene to render from it, and the
/// device tier requested. Values are fixed once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderJob {
    script: String,
    scene: String,
    device: DeviceTier,
    timeout: Option<Duration>,
}

impl RenderJob {
    pub fn new(script: impl Into<String>, scene: impl Into<String>, device: DeviceTier) -> Self {
        Self {
            script: script.into(),
            scene: scene.into(),
            device,
            timeout: None,
        }
    }

    /// Overrides the configured runner timeout for this job.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn scene(&self) -> &str {
        &self.scene
    }

    pub fn device(&self) -> DeviceTier {
        self.device
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Identifier naming this job's working area and telemetry files,
    /// `<scene>-<UTC time to the millisecond>-<sequence>`.
    pub fn job_id(&self, submitted_at: chrono::DateTime<chrono::Utc>, sequence: u64) -> String {
        let scene: String = self
            .scene
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        let scene = if scene.is_empty() { "job".to_string() } else { scene };
        format!(
            "{scene}-{}-{sequence}",
            submitted_at.format("%Y%m%dT%H%M%S%3fZ")
        )
    }
}
