use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use supervisor::DeviceTier;

#[derive(Parser, Debug)]
#[command(
    name = "rendervisor",
    author,
    version,
    about = "Supervised render jobs with GPU telemetry and durable artifacts"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Configuration file; defaults to `config.toml` in the config directory.
    #[arg(long, global = true, env = "RENDERVISOR_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override the durable storage root from the configuration.
    #[arg(long, global = true, env = "RENDERVISOR_STORAGE_ROOT", value_name = "DIR")]
    pub storage_root: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Submit a render script and wait for its result.
    Run(RunArgs),
    /// Retrieve one stored artifact.
    Fetch(FetchArgs),
    /// Render a diagnostic frame through the graphics context acquirer.
    Probe(ProbeArgs),
    /// Print the resolved directories.
    Paths,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Scene script to submit.
    #[arg(value_name = "SCRIPT")]
    pub script: PathBuf,

    /// Scene to render from the script.
    #[arg(long, value_name = "NAME")]
    pub scene: String,

    /// Device tier to request (`gpu` or `cpu`).
    #[arg(long, value_name = "TIER", default_value = "gpu")]
    pub device: DeviceTier,

    /// Kill the render after this long (e.g. `90s`, `30m`).
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Where downloaded artifacts are written; defaults to the data directory.
    #[arg(long, value_name = "DIR")]
    pub download_dir: Option<PathBuf>,

    /// Skip downloading artifacts after the job completes.
    #[arg(long)]
    pub no_download: bool,

    /// Disable telemetry sampling for this job.
    #[arg(long)]
    pub no_telemetry: bool,

    /// Print the full job result as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Stored path, absolute or relative to the storage root.
    #[arg(value_name = "PATH")]
    pub path: PathBuf,

    /// Directory the file is written into.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub out: PathBuf,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Skip the hardware adapter and go straight to the software rasterizer.
    #[arg(long)]
    pub software: bool,

    /// Write the probe frame to this PNG file.
    #[arg(long, value_name = "PATH")]
    pub out: Option<PathBuf>,

    /// Probe frame size.
    #[arg(long, value_name = "WIDTHxHEIGHT", default_value = "64x64", value_parser = parse_size)]
    pub size: (u32, u32),
}

pub fn parse() -> Cli {
    Cli::parse()
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }
    humantime::parse_duration(value).map_err(|err| format!("invalid duration '{value}': {err}"))
}

fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{value}'"))?;
    let width = width
        .trim()
        .parse::<u32>()
        .map_err(|err| format!("invalid width: {err}"))?;
    let height = height
        .trim()
        .parse::<u32>()
        .map_err(|err| format!("invalid height: {err}"))?;
    if width == 0 || height == 0 {
        return Err("size must be non-zero".into());
    }
    Ok((width, height))
}
