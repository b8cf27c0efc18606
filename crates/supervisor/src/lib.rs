//! Supervision of one render job: resolve the device, run the render process
//! with telemetry sampling alongside, harvest its outputs into durable storage
//! and fold everything into a [`JobResult`].

mod collector;
mod job;
mod result;
mod runner;
mod storage;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use gpuctx::{ContextAcquirer, ContextError};
use jobconfig::{ConfigError, SupervisorConfig};
use telemetry::{BoxedProvider, TelemetrySampler};
use thiserror::Error;

pub use collector::{Artifact, ArtifactCollector};
pub use job::{DeviceTier, RenderJob};
pub use result::{JobResult, ResolvedDevice, TelemetryFiles};
pub use runner::{
    JobRunner, RunOutcome, RunnerError, VirtualDisplay, WorkArea, SPAWN_FAILURE_EXIT_CODE,
    TIMEOUT_EXIT_CODE,
};
pub use storage::{StorageError, StoredFile, VolumeStore};

/// Builds the metrics provider chain for each job's sampler.
pub type ProviderFactory = Box<dyn Fn() -> Vec<BoxedProvider> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

pub struct Supervisor {
    config: SupervisorConfig,
    acquirer: ContextAcquirer,
    providers: ProviderFactory,
    runner: JobRunner,
    collector: ArtifactCollector,
    store: VolumeStore,
    submissions: AtomicU64,
}

impl Supervisor {
    /// Supervisor with wgpu context providers and the nvidia-smi/sysfs
    /// metrics chain.
    pub fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        let nvidia_smi = config.telemetry.nvidia_smi.clone();
        let drm_root = config.telemetry.drm_root.clone();
        Self::with_parts(
            config,
            ContextAcquirer::wgpu(),
            Box::new(move || telemetry::default_providers(&nvidia_smi, drm_root.clone())),
        )
    }

    pub fn with_parts(
        config: SupervisorConfig,
        acquirer: ContextAcquirer,
        providers: ProviderFactory,
    ) -> Result<Self, SupervisorError> {
        config.validate()?;
        let runner = JobRunner::new(config.runner.clone(), config.display.clone());
        let collector = ArtifactCollector::from_config(&config);
        let store = VolumeStore::new(config.storage.root.clone());
        Ok(Self {
            config,
            acquirer,
            providers,
            runner,
            collector,
            store,
            submissions: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn store(&self) -> &VolumeStore {
        &self.store
    }

    /// Reads a stored artifact; `None` when it does not exist.
    pub fn fetch(&self, path: impl AsRef<Path>) -> Result<Option<Vec<u8>>, StorageError> {
        self.store.fetch(path)
    }

    pub fn submit(&self, job: RenderJob) -> Result<JobResult, SupervisorError> {
        let submitted_at = Utc::now();
        let sequence = self.submissions.fetch_add(1, Ordering::Relaxed);
        let device = self.resolve_device(&job)?;
        let tier = device.tier;
        self.store.prepare(tier)?;
        let job_id = job.job_id(submitted_at, sequence);
        tracing::info!(
            job_id = %job_id,
            scene = %job.scene(),
            requested = %job.device(),
            tier = %tier,
            device = %device.description,
            "submitting render job"
        );

        let area = self.runner.prepare(&job, &job_id)?;
        let mut sampler = self.start_telemetry(tier, &job_id);
        let outcome = self.runner.run(&job, &area);
        let telemetry = match sampler.as_mut() {
            Some(sampler) => Some(self.finish_telemetry(sampler, tier, &job_id)?),
            None => None,
        };

        let artifacts = self.collector.collect(area.path(), &self.store, tier)?;
        let area_path = area.path().to_path_buf();
        if let Err(err) = area.close() {
            tracing::warn!(
                area = %area_path.display(),
                error = %err,
                "failed to remove working area"
            );
        }

        let result = JobResult::aggregate(job.scene(), device, &outcome, artifacts, telemetry);
        tracing::info!(
            job_id = %job_id,
            exit_code = result.exit_code(),
            elapsed_s = result.elapsed_time(),
            artifacts = result.output_files().len(),
            "render job complete"
        );
        Ok(result)
    }

    fn resolve_device(&self, job: &RenderJob) -> Result<ResolvedDevice, ContextError> {
        let ctx = self.acquirer.acquire(job.device().preferred_provider())?;
        let device = ResolvedDevice {
            tier: DeviceTier::from_provider(ctx.provider()),
            description: ctx.describe(),
            fallback_occurred: ctx.fallback_occurred(),
        };
        if device.tier != job.device() {
            tracing::warn!(
                requested = %job.device(),
                actual = %device.tier,
                "job will run on a different device tier than requested"
            );
        }
        Ok(device)
    }

    fn start_telemetry(&self, tier: DeviceTier, job_id: &str) -> Option<TelemetrySampler> {
        if tier != DeviceTier::Gpu || !self.config.telemetry.enabled {
            return None;
        }
        let series_path = self
            .store
            .telemetry_dir(tier)
            .join(format!("{job_id}_metrics.json"));
        let mut sampler = TelemetrySampler::new((self.providers)(), series_path);
        match sampler.start(self.config.telemetry.interval) {
            Ok(()) => Some(sampler),
            Err(err) => {
                tracing::warn!(error = %err, "telemetry disabled for this job");
                None
            }
        }
    }

    fn finish_telemetry(
        &self,
        sampler: &mut TelemetrySampler,
        tier: DeviceTier,
        job_id: &str,
    ) -> Result<TelemetryFiles, StorageError> {
        if let Err(err) = sampler.stop(self.config.telemetry.stop_timeout) {
            tracing::warn!(error = %err, "failed to stop telemetry sampler");
        }

        let summary_file = match sampler.summarize() {
            Ok(summary) => {
                let path = self
                    .store
                    .telemetry_dir(tier)
                    .join(format!("{job_id}_summary.json"));
                self.store.write_json(&path, &summary)?;
                tracing::info!(
                    samples = summary.sample_count,
                    available = summary.available_fields(),
                    path = %path.display(),
                    "telemetry summary written"
                );
                Some(path)
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to summarize telemetry");
                None
            }
        };

        Ok(TelemetryFiles {
            metrics_file: sampler.series_path().to_path_buf(),
            summary_file,
        })
    }
}
