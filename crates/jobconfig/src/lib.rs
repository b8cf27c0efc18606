use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to read configuration at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub artifacts: ArtifactConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

/// Durable storage volume that outlives the job's working area.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
}

/// External render process invocation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Ephemeral working area the script is written into.
    pub work_dir: PathBuf,
    /// File name the submitted script is materialized as.
    pub script_name: String,
    pub program: String,
    /// Arguments; `{script}` and `{scene}` are substituted per job.
    pub args: Vec<String>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    /// Extra environment for the render process.
    pub env: BTreeMap<String, String>,
}

/// Virtual framebuffer started around the render process.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub enabled: bool,
    pub program: String,
    pub number: u32,
    /// Xvfb screen geometry, `WIDTHxHEIGHTxDEPTH`.
    pub screen: String,
    #[serde(deserialize_with = "deserialize_duration")]
    pub settle: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub stop_timeout: Duration,
    pub nvidia_smi: String,
    pub drm_root: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub extensions: Vec<String>,
    /// Directory the render is expected to write into, relative to `runner.work_dir`
    /// unless absolute.
    pub expected_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReportConfig {
    #[serde(deserialize_with = "deserialize_duration")]
    pub target_time: Duration,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_timeout() -> Duration {
    Duration::from_secs(1800)
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            storage: StorageConfig::default(),
            runner: RunnerConfig::default(),
            display: DisplayConfig::default(),
            telemetry: TelemetryConfig::default(),
            artifacts: ArtifactConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/root/output"),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert(
            "LD_LIBRARY_PATH".to_string(),
            "/usr/lib/x86_64-linux-gnu:/usr/lib/i386-linux-gnu".to_string(),
        );
        Self {
            work_dir: PathBuf::from("/root"),
            script_name: "scene.py".to_string(),
            program: "manimgl".to_string(),
            args: vec!["{script}".into(), "{scene}".into(), "-w".into()],
            timeout: default_timeout(),
            env,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "Xvfb".to_string(),
            number: 1,
            screen: "1920x1080x24".to_string(),
            settle: Duration::from_secs(2),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
            nvidia_smi: "nvidia-smi".to_string(),
            drm_root: PathBuf::from("/sys/class/drm"),
        }
    }
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["mp4".into(), "wav".into()],
            expected_dir: Some(PathBuf::from("videos")),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            target_time: Duration::from_secs(60),
        }
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs(v as u64))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Duration::try_from_secs_f64(v)
                .map_err(|err| E::custom(format!("invalid duration {v}: {err}")))
        }
    }

    deserializer.deserialize_any(Visitor)
}

impl SupervisorConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: SupervisorConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads `path` when it exists, otherwise falls back to the built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_path(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Artifact extensions lowercased and stripped of a leading dot.
    pub fn normalized_extensions(&self) -> Vec<String> {
        let mut extensions: Vec<String> = self
            .artifacts
            .extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        extensions.sort();
        extensions.dedup();
        extensions
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != CONFIG_VERSION {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected {CONFIG_VERSION}",
                self.version
            )));
        }

        if self.storage.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("storage.root must not be empty".into()));
        }

        if self.runner.program.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "runner.program must not be empty".into(),
            ));
        }

        if self.runner.script_name.trim().is_empty()
            || self.runner.script_name.contains(['/', '\\'])
        {
            return Err(ConfigError::Invalid(format!(
                "runner.script_name '{}' must be a plain file name",
                self.runner.script_name
            )));
        }

        if self.runner.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "runner.timeout must be greater than zero".into(),
            ));
        }

        if self.display.enabled {
            validate_screen(&self.display.screen)?;
        }

        if self.telemetry.enabled && self.telemetry.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "telemetry.interval must be greater than zero".into(),
            ));
        }

        if let Some(dir) = &self.artifacts.expected_dir {
            if dir.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "artifacts.expected_dir '{}' must be relative to the job working area",
                    dir.display()
                )));
            }
        }

        if self.normalized_extensions().is_empty() {
            return Err(ConfigError::Invalid(
                "artifacts.extensions must list at least one extension".into(),
            ));
        }

        Ok(())
    }
}

fn validate_screen(screen: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = screen.split('x').collect();
    let valid = parts.len() == 3
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.chars().all(|ch| ch.is_ascii_digit()));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "display.screen '{screen}' is invalid; expected WIDTHxHEIGHTxDEPTH"
        )))
    }
}
