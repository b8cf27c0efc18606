use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::collector::Artifact;
use crate::job::DeviceTier;
use crate::runner::RunOutcome;

/// Device the job actually ran on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDevice {
    pub tier: DeviceTier,
    pub description: String,
    pub fallback_occurred: bool,
}

/// Where a job's telemetry ended up in storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryFiles {
    pub metrics_file: PathBuf,
    pub summary_file: Option<PathBuf>,
}

/// Final record of a submitted job. Built once when the job completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    device: DeviceTier,
    gpu_info: String,
    /// Seconds from spawn to exit.
    elapsed_time: f64,
    output_files: Vec<Artifact>,
    exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metrics_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary_file: Option<PathBuf>,
    scene: String,
    timed_out: bool,
    cold_start_time: f64,
    fallback_occurred: bool,
}

impl JobResult {
    pub fn aggregate(
        scene: &str,
        device: ResolvedDevice,
        outcome: &RunOutcome,
        output_files: Vec<Artifact>,
        telemetry: Option<TelemetryFiles>,
    ) -> Self {
        let (metrics_file, summary_file) = match telemetry {
            Some(files) => (Some(files.metrics_file), files.summary_file),
            None => (None, None),
        };
        Self {
            device: device.tier,
            gpu_info: device.description,
            elapsed_time: outcome.elapsed.as_secs_f64(),
            output_files,
            exit_code: outcome.exit_code,
            metrics_file,
            summary_file,
            scene: scene.to_string(),
            timed_out: outcome.timed_out,
            cold_start_time: outcome.cold_start.as_secs_f64(),
            fallback_occurred: device.fallback_occurred,
        }
    }

    pub fn device(&self) -> DeviceTier {
        self.device
    }

    pub fn gpu_info(&self) -> &str {
        &self.gpu_info
    }

    pub fn elapsed_time(&self) -> f64 {
        self.elapsed_time
    }

    pub fn output_files(&self) -> &[Artifact] {
        &self.output_files
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn metrics_file(&self) -> Option<&Path> {
        self.metrics_file.as_deref()
    }

    pub fn summary_file(&self) -> Option<&Path> {
        self.summary_file.as_deref()
    }

    pub fn scene(&self) -> &str {
        &self.scene
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn cold_start_time(&self) -> f64 {
        self.cold_start_time
    }

    pub fn fallback_occurred(&self) -> bool {
        self.fallback_occurred
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}
