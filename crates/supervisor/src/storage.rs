use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use telemetry::{write_json_atomic, PersistError};
use thiserror::Error;

use crate::job::DeviceTier;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("durable storage unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl StorageError {
    fn unavailable(path: &Path, source: std::io::Error) -> Self {
        StorageError::Unavailable {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A file copied into the volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    pub size: u64,
}

/// Durable volume that outlives a job's working area. Outputs are laid out as
/// `<root>/<tier>/<file>` and telemetry under `<root>/<tier>/telemetry/`.
#[derive(Debug, Clone)]
pub struct VolumeStore {
    root: PathBuf,
}

impl VolumeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tier_dir(&self, tier: DeviceTier) -> PathBuf {
        self.root.join(tier.as_str())
    }

    pub fn telemetry_dir(&self, tier: DeviceTier) -> PathBuf {
        self.tier_dir(tier).join("telemetry")
    }

    /// Creates the tier namespace if needed.
    pub fn prepare(&self, tier: DeviceTier) -> Result<PathBuf, StorageError> {
        let dir = self.tier_dir(tier);
        fs::create_dir_all(&dir).map_err(|err| StorageError::unavailable(&dir, err))?;
        Ok(dir)
    }

    /// Copies `source` into the tier namespace under `file_name`, replacing any
    /// earlier copy. The reported size is read back from the stored copy.
    pub fn store_file(
        &self,
        source: &Path,
        tier: DeviceTier,
        file_name: &str,
    ) -> Result<StoredFile, StorageError> {
        let dir = self.prepare(tier)?;
        let destination = dir.join(file_name);
        fs::copy(source, &destination)
            .map_err(|err| StorageError::unavailable(&destination, err))?;
        let size = fs::metadata(&destination)
            .map_err(|err| StorageError::unavailable(&destination, err))?
            .len();
        tracing::debug!(
            source = %source.display(),
            destination = %destination.display(),
            size,
            "stored artifact"
        );
        Ok(StoredFile {
            path: destination,
            size,
        })
    }

    /// Atomically writes `value` as JSON to `path` inside the volume.
    pub fn write_json<T>(&self, path: &Path, value: &T) -> Result<(), StorageError>
    where
        T: Serialize + ?Sized,
    {
        write_json_atomic(path, value)?;
        Ok(())
    }

    /// Reads a stored file. Relative paths resolve against the volume root and
    /// absolute paths must point inside it. Anything missing, not a regular
    /// file, or outside the volume is `None`; only real I/O failures are errors.
    pub fn fetch(&self, path: impl AsRef<Path>) -> Result<Option<Vec<u8>>, StorageError> {
        let requested = path.as_ref();
        if requested.as_os_str().is_empty() {
            return Ok(None);
        }
        let candidate = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            if requested
                .components()
                .any(|component| matches!(component, Component::ParentDir))
            {
                return Ok(None);
            }
            self.root.join(requested)
        };

        let root = match fs::canonicalize(&self.root) {
            Ok(root) => root,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageError::unavailable(&self.root, err)),
        };
        let resolved = match fs::canonicalize(&candidate) {
            Ok(resolved) => resolved,
            Err(err) if is_absent(&err) => return Ok(None),
            Err(err) => return Err(StorageError::unavailable(&candidate, err)),
        };
        if !resolved.starts_with(&root) {
            tracing::warn!(path = %requested.display(), "refusing to fetch outside durable storage");
            return Ok(None);
        }

        match fs::metadata(&resolved) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Ok(None),
            Err(err) if is_absent(&err) => return Ok(None),
            Err(err) => return Err(StorageError::unavailable(&resolved, err)),
        }
        match fs::read(&resolved) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if is_absent(&err) => Ok(None),
            Err(err) => Err(StorageError::unavailable(&resolved, err)),
        }
    }
}

fn is_absent(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with_file(contents: &[u8]) -> (TempDir, VolumeStore, StoredFile) {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("render.mp4");
        fs::write(&source, contents).unwrap();
        let store = VolumeStore::new(dir.path().join("volume"));
        let stored = store.store_file(&source, DeviceTier::Gpu, "render.mp4").unwrap();
        (dir, store, stored)
    }

    #[test]
    fn stores_under_tier_namespace() {
        let (_dir, store, stored) = store_with_file(b"frames");
        assert_eq!(stored.path, store.root().join("gpu").join("render.mp4"));
        assert_eq!(stored.size, 6);
    }

    #[test]
    fn fetch_is_idempotent() {
        let (_dir, store, stored) = store_with_file(b"frames");
        let first = store.fetch(&stored.path).unwrap();
        let second = store.fetch(&stored.path).unwrap();
        assert_eq!(first.as_deref(), Some(&b"frames"[..]));
        assert_eq!(first, second);
        assert_eq!(store.fetch("gpu/render.mp4").unwrap(), first);
    }

    #[test]
    fn missing_paths_are_absent() {
        let (_dir, store, _) = store_with_file(b"frames");
        assert_eq!(store.fetch("gpu/missing.mp4").unwrap(), None);
        assert_eq!(store.fetch("gpu/render.mp4/nested").unwrap(), None);
        assert_eq!(store.fetch("").unwrap(), None);
    }

    #[test]
    fn directories_are_absent() {
        let (_dir, store, _) = store_with_file(b"frames");
        assert_eq!(store.fetch("gpu").unwrap(), None);
    }

    #[test]
    fn paths_outside_the_volume_are_absent() {
        let (dir, store, _) = store_with_file(b"frames");
        let outside = dir.path().join("render.mp4");
        assert_eq!(store.fetch(&outside).unwrap(), None);
        assert_eq!(store.fetch("../render.mp4").unwrap(), None);
    }

    #[test]
    fn missing_volume_is_absent() {
        let dir = TempDir::new().unwrap();
        let store = VolumeStore::new(dir.path().join("never-created"));
        assert_eq!(store.fetch("gpu/render.mp4").unwrap(), None);
    }
}
