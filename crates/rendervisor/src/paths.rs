use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use directories_next::ProjectDirs;

pub const ENV_CONFIG_DIR: &str = "RENDERVISOR_CONFIG_DIR";
pub const ENV_DATA_DIR: &str = "RENDERVISOR_DATA_DIR";

const QUALIFIER: &str = "org";
const ORGANISATION: &str = "Rendervisor";
const APPLICATION: &str = "rendervisor";

#[derive(Debug, Clone)]
pub struct AppPaths {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn discover() -> Result<Self> {
        // None without a home directory.
        let project_dirs = ProjectDirs::from(QUALIFIER, ORGANISATION, APPLICATION);
        let config_dir = resolve_dir(
            ENV_CONFIG_DIR,
            project_dirs.as_ref().map(ProjectDirs::config_dir),
        )
        .context("failed to resolve rendervisor config directory")?;
        let data_dir = resolve_dir(ENV_DATA_DIR, project_dirs.as_ref().map(ProjectDirs::data_dir))
            .context("failed to resolve rendervisor data directory")?;

        Ok(Self {
            config_dir,
            data_dir,
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    pub fn probes_dir(&self) -> PathBuf {
        self.data_dir.join("probes")
    }
}

fn resolve_dir(env_var: &str, default: Option<&Path>) -> Result<PathBuf> {
    if let Some(value) = env_override(env_var) {
        return Ok(value);
    }
    default
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("no user directories available and {env_var} is not set"))
}

fn env_override(name: &str) -> Option<PathBuf> {
    match env::var_os(name) {
        Some(value) if !value.is_empty() => Some(PathBuf::from(value)),
        _ => None,
    }
}
