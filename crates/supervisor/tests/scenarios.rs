use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use gpuctx::{AdapterKind, AdapterProfile, ContextAcquirer, ContextProvider, ProvidedContext, Provider};
use jobconfig::SupervisorConfig;
use supervisor::{DeviceTier, RenderJob, Supervisor, SupervisorError, TIMEOUT_EXIT_CODE};
use telemetry::{
    load_series, BoxedProvider, DeviceMetrics, MetricsProvider, MetricsSourceError,
};
use tempfile::TempDir;

struct StaticContext {
    kind: Provider,
    available: bool,
}

impl ContextProvider for StaticContext {
    fn kind(&self) -> Provider {
        self.kind
    }

    fn create(&self) -> Result<ProvidedContext> {
        if !self.available {
            bail!("no {} adapter in test environment", self.kind);
        }
        let device_type = match self.kind {
            Provider::Hardware => AdapterKind::DiscreteGpu,
            Provider::Software => AdapterKind::Cpu,
        };
        Ok(ProvidedContext {
            adapter: AdapterProfile {
                name: format!("test {}", self.kind),
                backend: "Vulkan".into(),
                device_type,
                driver: String::new(),
            },
            handles: None,
        })
    }
}

fn acquirer(hardware: bool, software: bool) -> ContextAcquirer {
    ContextAcquirer::new(
        Box::new(StaticContext {
            kind: Provider::Hardware,
            available: hardware,
        }),
        Box::new(StaticContext {
            kind: Provider::Software,
            available: software,
        }),
    )
}

struct FixedMetrics;

impl MetricsProvider for FixedMetrics {
    fn name(&self) -> &str {
        "fixed"
    }

    fn sample(&mut self) -> Result<Vec<DeviceMetrics>, MetricsSourceError> {
        Ok(vec![DeviceMetrics {
            utilization_pct: Some(80.0),
            temperature_c: Some(60.0),
            ..DeviceMetrics::default()
        }])
    }
}

fn config(root: &Path) -> SupervisorConfig {
    let mut config = SupervisorConfig::default();
    config.storage.root = root.join("volume");
    config.runner.work_dir = root.join("work");
    config.runner.script_name = "scene.sh".into();
    config.runner.program = "sh".into();
    config.runner.args = vec!["{script}".into(), "{scene}".into()];
    config.runner.env.clear();
    config.display.enabled = false;
    config.telemetry.interval = Duration::from_millis(20);
    config.telemetry.stop_timeout = Duration::from_secs(5);
    config
}

fn supervisor(root: &Path, hardware: bool, software: bool) -> Supervisor {
    Supervisor::with_parts(
        config(root),
        acquirer(hardware, software),
        Box::new(|| vec![Box::new(FixedMetrics) as BoxedProvider]),
    )
    .unwrap()
}

const RENDER_SCRIPT: &str = r#"
out="videos/$1/1080p30"
mkdir -p "$out"
sleep 0.1
printf 'fake mp4 frames' > "$out/$1.mp4"
"#;

#[test]
fn gpu_job_produces_artifact_and_telemetry() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(dir.path(), true, true);

    let result = supervisor
        .submit(RenderJob::new(RENDER_SCRIPT, "Demo", DeviceTier::Gpu))
        .unwrap();

    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.device(), DeviceTier::Gpu);
    assert_eq!(result.gpu_info(), "test hardware (Vulkan)");
    assert!(!result.fallback_occurred());
    assert!(result.elapsed_time() > 0.0);

    let files = result.output_files();
    assert_eq!(files.len(), 1);
    assert!(files[0].relative_path.ends_with(".mp4"));
    assert!(files[0].size > 0);
    assert_eq!(
        files[0].storage_path,
        dir.path().join("volume/gpu/Demo.mp4")
    );

    let metrics_file = result.metrics_file().expect("metrics file");
    let summary_file = result.summary_file().expect("summary file");
    let summary: serde_json::Value =
        serde_json::from_slice(&fs::read(summary_file).unwrap()).unwrap();
    let sample_count = summary["sample_count"].as_u64().unwrap();
    assert!(sample_count >= 1);
    assert_eq!(load_series(metrics_file).unwrap().len() as u64, sample_count);
    assert_eq!(summary["gpu_metrics_summary"]["gpu0_util"]["max"], 80.0);
    assert_eq!(
        summary["gpu_metrics_summary"]["gpu0_power"]["min"],
        "unavailable"
    );

    let first = supervisor.fetch(&files[0].storage_path).unwrap();
    let second = supervisor.fetch(&files[0].storage_path).unwrap();
    assert_eq!(first.as_deref(), Some(&b"fake mp4 frames"[..]));
    assert_eq!(first, second);
}

#[test]
fn timed_out_job_is_killed_and_reported() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(dir.path(), true, true);
    let job = RenderJob::new("exec sleep 30", "Slow", DeviceTier::Gpu)
        .with_timeout(Duration::from_millis(300));

    let started = Instant::now();
    let result = supervisor.submit(job).unwrap();

    assert!(started.elapsed() < Duration::from_secs(15));
    assert!(result.timed_out());
    assert_eq!(result.exit_code(), TIMEOUT_EXIT_CODE);
    assert!(result.output_files().is_empty());
    assert!(result.summary_file().is_some());
}

#[test]
fn timeout_takes_down_processes_the_render_started() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(dir.path(), true, true);
    let marker = dir.path().join("late.txt");
    let script = format!(
        "sh -c 'sleep 1; echo late > {}'; echo finished",
        marker.display()
    );
    let job = RenderJob::new(script, "Slow", DeviceTier::Gpu)
        .with_timeout(Duration::from_millis(300));

    let started = Instant::now();
    let result = supervisor.submit(job).unwrap();

    assert!(result.timed_out());
    assert_eq!(result.exit_code(), TIMEOUT_EXIT_CODE);
    assert!(started.elapsed() < Duration::from_secs(4), "took {:?}", started.elapsed());
    std::thread::sleep(Duration::from_millis(1500));
    assert!(!marker.exists());
}

#[test]
fn consecutive_jobs_do_not_share_outputs() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(dir.path(), true, true);

    let first = supervisor
        .submit(RenderJob::new(RENDER_SCRIPT, "First", DeviceTier::Gpu))
        .unwrap();
    let second = supervisor
        .submit(RenderJob::new("exit 2", "First", DeviceTier::Gpu))
        .unwrap();

    let names: Vec<_> = first
        .output_files()
        .iter()
        .map(|artifact| artifact.relative_path.as_str())
        .collect();
    assert_eq!(names, ["First.mp4"]);
    assert_eq!(second.exit_code(), 2);
    assert!(second.output_files().is_empty());

    let first_metrics = first.metrics_file().expect("first metrics file");
    let second_metrics = second.metrics_file().expect("second metrics file");
    assert_ne!(first_metrics, second_metrics);
    assert!(first_metrics.is_file());
    assert!(second_metrics.is_file());
    assert_ne!(first.summary_file(), second.summary_file());

    assert_eq!(fs::read_dir(dir.path().join("work")).unwrap().count(), 0);
}

#[test]
fn hardware_failure_falls_back_to_cpu_tier() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(dir.path(), false, true);

    let result = supervisor
        .submit(RenderJob::new(RENDER_SCRIPT, "Demo", DeviceTier::Gpu))
        .unwrap();

    assert_eq!(result.device(), DeviceTier::Cpu);
    assert!(result.fallback_occurred());
    assert!(result.metrics_file().is_none());
    assert_eq!(
        result.output_files()[0].storage_path,
        dir.path().join("volume/cpu/Demo.mp4")
    );
}

#[test]
fn missing_graphics_context_is_fatal() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(dir.path(), false, false);

    let err = supervisor
        .submit(RenderJob::new(RENDER_SCRIPT, "Demo", DeviceTier::Gpu))
        .unwrap_err();
    assert!(matches!(err, SupervisorError::Context(_)));
    assert!(!dir.path().join("work").exists());
}

#[test]
fn failing_render_is_reported_not_raised() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(dir.path(), true, true);

    let result = supervisor
        .submit(RenderJob::new("echo broken >&2; exit 2", "Demo", DeviceTier::Cpu))
        .unwrap();

    assert_eq!(result.exit_code(), 2);
    assert!(result.output_files().is_empty());
    assert!(result.metrics_file().is_none());
}

#[test]
fn fetch_of_unknown_path_is_absent() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(dir.path(), true, true);
    assert_eq!(supervisor.fetch("gpu/never-rendered.mp4").unwrap(), None);
}
