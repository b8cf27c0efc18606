use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::sample::MetricSample;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode telemetry: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to decode telemetry at {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Replaces `path` with the JSON encoding of `value`. The content is written to
/// a sibling temp file and renamed into place, so readers never observe a
/// partially written document.
pub fn write_json_atomic<T>(path: &Path, value: &T) -> Result<(), PersistError>
where
    T: Serialize + ?Sized,
{
    let encoded = serde_json::to_vec_pretty(value)?;
    let write_err = |source: std::io::Error| PersistError::Write {
        path: path.to_path_buf(),
        source,
    };

    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(write_err)?;

    let mut temp = NamedTempFile::new_in(dir).map_err(write_err)?;
    temp.write_all(&encoded).map_err(write_err)?;
    temp.flush().map_err(write_err)?;
    temp.as_file_mut().sync_all().map_err(write_err)?;
    temp.into_temp_path()
        .persist(path)
        .map_err(|err| write_err(err.error))
}

/// Loads a persisted series; a missing file is an empty series.
pub fn load_series(path: &Path) -> Result<Vec<MetricSample>, PersistError> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(PersistError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&contents).map_err(|source| PersistError::Decode {
        path: path.to_path_buf(),
        source,
    })
}
