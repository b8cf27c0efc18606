use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use gpuctx::{offscreen, ContextAcquirer, Provider};
use jobconfig::SupervisorConfig;
use supervisor::{JobResult, RenderJob, Supervisor, VolumeStore};
use tracing_subscriber::EnvFilter;

use crate::cli::{FetchArgs, GlobalArgs, ProbeArgs, RunArgs};
use crate::paths::AppPaths;

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

pub fn load_config(paths: &AppPaths, global: &GlobalArgs) -> Result<SupervisorConfig> {
    let mut config = match &global.config {
        Some(path) => SupervisorConfig::from_path(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            let path = paths.config_file();
            SupervisorConfig::load_or_default(&path)
                .with_context(|| format!("failed to load {}", path.display()))?
        }
    };
    if let Some(root) = &global.storage_root {
        config.storage.root = root.clone();
    }
    config.validate()?;
    Ok(config)
}

pub fn run_job(paths: &AppPaths, global: &GlobalArgs, args: RunArgs) -> Result<()> {
    let mut config = load_config(paths, global)?;
    if args.no_telemetry {
        config.telemetry.enabled = false;
    }
    let target_time = config.report.target_time;
    let extensions = config.normalized_extensions();

    let script = fs::read_to_string(&args.script)
        .with_context(|| format!("failed to read scene script {}", args.script.display()))?;
    let mut job = RenderJob::new(script, args.scene.as_str(), args.device);
    if let Some(timeout) = args.timeout {
        job = job.with_timeout(timeout);
    }

    let supervisor = Supervisor::new(config)?;
    tracing::info!(
        script = %args.script.display(),
        scene = %args.scene,
        device = %args.device,
        "submitting render job"
    );
    let result = supervisor.submit(job).context("render job failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    if !args.no_download {
        let download_dir = args
            .download_dir
            .clone()
            .unwrap_or_else(|| paths.downloads_dir().join(result.device().as_str()));
        download_artifacts(supervisor.store(), &result, &extensions, &download_dir)?;
    }

    let elapsed = result.elapsed_time();
    if elapsed <= target_time.as_secs_f64() {
        println!(
            "Finished in {elapsed:.2}s, within the {}s target",
            target_time.as_secs_f64()
        );
    } else {
        println!(
            "Took {elapsed:.2}s, over the {}s target",
            target_time.as_secs_f64()
        );
    }

    if result.timed_out() {
        bail!("render timed out after {elapsed:.2}s");
    }
    if result.exit_code() != 0 {
        bail!("render exited with code {}", result.exit_code());
    }
    Ok(())
}

fn print_result(result: &JobResult) {
    println!("Scene:        {}", result.scene());
    println!("Device:       {} ({})", result.device(), result.gpu_info());
    if result.fallback_occurred() {
        println!("              software fallback was used");
    }
    println!("Cold start:   {:.2}s", result.cold_start_time());
    println!("Render time:  {:.2}s", result.elapsed_time());
    println!("Exit code:    {}", result.exit_code());
    println!("Artifacts:    {}", result.output_files().len());
    for artifact in result.output_files() {
        println!(
            "  {:<40} {:>12} bytes  {}",
            artifact.relative_path,
            artifact.size,
            artifact.storage_path.display()
        );
    }
    if let Some(metrics) = result.metrics_file() {
        println!("Metrics:      {}", metrics.display());
    }
    if let Some(summary) = result.summary_file() {
        println!("Summary:      {}", summary.display());
    }
}

fn download_artifacts(
    store: &VolumeStore,
    result: &JobResult,
    extensions: &[String],
    download_dir: &Path,
) -> Result<()> {
    let wanted = result.output_files().iter().filter(|artifact| {
        Path::new(&artifact.relative_path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| extensions.iter().any(|known| known.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    });

    for artifact in wanted {
        match store.fetch(&artifact.storage_path)? {
            Some(bytes) => {
                let target = download_dir.join(&artifact.relative_path);
                write_download(&target, &bytes)?;
                println!("Downloaded {} -> {}", artifact.relative_path, target.display());
            }
            None => {
                tracing::warn!(
                    path = %artifact.storage_path.display(),
                    "artifact vanished from storage before download"
                );
            }
        }
    }
    Ok(())
}

fn write_download(target: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(target, bytes).with_context(|| format!("failed to write {}", target.display()))
}

pub fn fetch_file(paths: &AppPaths, global: &GlobalArgs, args: FetchArgs) -> Result<()> {
    let config = load_config(paths, global)?;
    let store = VolumeStore::new(config.storage.root);
    let Some(bytes) = store.fetch(&args.path)? else {
        bail!(
            "{} not found in storage at {}",
            args.path.display(),
            store.root().display()
        );
    };

    let file_name = args
        .path
        .file_name()
        .context("fetch path has no file name")?;
    let target = args.out.join(file_name);
    write_download(&target, &bytes)?;
    println!("{} ({} bytes)", target.display(), bytes.len());
    Ok(())
}

pub fn probe(paths: &AppPaths, args: ProbeArgs) -> Result<()> {
    let preferred = if args.software {
        Provider::Software
    } else {
        Provider::Hardware
    };
    let ctx = ContextAcquirer::wgpu().acquire(preferred)?;
    println!("Context:      {} via {}", ctx.describe(), ctx.provider());
    if ctx.fallback_occurred() {
        println!("              software fallback was used");
    }

    let image = offscreen::render_probe(&ctx, args.size, [0.1, 0.4, 0.8, 1.0])?;
    let out = args
        .out
        .unwrap_or_else(|| paths.probes_dir().join(format!("probe-{}.png", ctx.provider())));
    offscreen::save_png(&image, &out)?;
    println!("Probe frame:  {}", out.display());
    Ok(())
}

pub fn print_paths(paths: &AppPaths, global: &GlobalArgs) -> Result<()> {
    let config = load_config(paths, global)?;
    println!("Config dir:   {}", paths.config_dir().display());
    println!("Config file:  {}", paths.config_file().display());
    println!("Data dir:     {}", paths.data_dir().display());
    println!("Downloads:    {}", paths.downloads_dir().display());
    println!("Storage root: {}", config.storage.root.display());
    println!("Work dir:     {}", config.runner.work_dir.display());
    Ok(())
}
