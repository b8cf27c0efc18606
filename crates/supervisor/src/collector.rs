use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use jobconfig::SupervisorConfig;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::job::DeviceTier;
use crate::storage::{StorageError, VolumeStore};

/// One output file copied into durable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Path relative to the tier namespace in storage.
    #[serde(rename = "path")]
    pub relative_path: String,
    pub size: u64,
    #[serde(rename = "full_path")]
    pub storage_path: PathBuf,
}

/// Finds a job's outputs in the working area and moves them to storage.
#[derive(Debug, Clone)]
pub struct ArtifactCollector {
    extensions: Vec<String>,
    expected_dir: Option<PathBuf>,
    excluded: Vec<PathBuf>,
}

impl ArtifactCollector {
    pub fn new<I, S>(extensions: I, expected_dir: Option<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extensions = extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        Self {
            extensions,
            expected_dir,
            excluded: Vec::new(),
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(
            config.normalized_extensions(),
            config.artifacts.expected_dir.clone(),
        )
        .excluding(&config.storage.root)
    }

    /// Skips `dir` during the working-tree scan, typically the storage root
    /// when it lives inside the working area.
    pub fn excluding(mut self, dir: impl Into<PathBuf>) -> Self {
        self.excluded.push(dir.into());
        self
    }

    fn is_recognized(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|known| *known == ext)
            })
            .unwrap_or(false)
    }

    fn has_recognized_file(&self, dir: &Path) -> bool {
        let Ok(entries) = fs::read_dir(dir) else {
            return false;
        };
        entries.filter_map(Result::ok).any(|entry| {
            let path = entry.path();
            self.is_recognized(&path) && path.is_file()
        })
    }

    /// Resolves the directory holding the job's outputs. The expected directory,
    /// relative to `working_tree`, wins when it directly holds a recognized file; otherwise the first match
    /// of a sorted scan of the working tree decides.
    pub fn locate(&self, working_tree: &Path) -> Option<PathBuf> {
        if let Some(expected) = &self.expected_dir {
            let expected = working_tree.join(expected);
            if self.has_recognized_file(&expected) {
                return Some(expected);
            }
            tracing::debug!(
                expected = %expected.display(),
                "expected output directory holds no artifacts; scanning working tree"
            );
        }

        let excluded: Vec<PathBuf> = self
            .excluded
            .iter()
            .filter_map(|dir| fs::canonicalize(dir).ok())
            .collect();
        let mut candidates: Vec<PathBuf> = Vec::new();
        let walker = WalkDir::new(working_tree)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                !entry.file_type().is_dir()
                    || excluded.is_empty()
                    || fs::canonicalize(entry.path())
                        .map(|path| !excluded.contains(&path))
                        .unwrap_or(true)
            });
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::debug!(error = %err, "skipping unreadable path during artifact scan");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.is_recognized(entry.path()) {
                continue;
            }
            if let Some(parent) = entry.path().parent() {
                if !candidates.iter().any(|dir| dir == parent) {
                    candidates.push(parent.to_path_buf());
                }
            }
        }

        if candidates.len() > 1 {
            let listed: Vec<String> = candidates
                .iter()
                .map(|dir| dir.display().to_string())
                .collect();
            tracing::warn!(
                chosen = %candidates[0].display(),
                candidates = %listed.join(", "),
                "artifacts found in several directories; using the first"
            );
        }
        candidates.into_iter().next()
    }

    /// Copies every recognized file of the resolved output directory into
    /// `store` under `tier`. Files reachable through several names are stored
    /// once. Returns the artifacts sorted by relative path.
    pub fn collect(
        &self,
        working_tree: &Path,
        store: &VolumeStore,
        tier: DeviceTier,
    ) -> Result<Vec<Artifact>, StorageError> {
        let Some(dir) = self.locate(working_tree) else {
            tracing::warn!(
                working_tree = %working_tree.display(),
                extensions = ?self.extensions,
                "ArtifactNotFound: no output files produced"
            );
            return Ok(Vec::new());
        };

        let mut entries: Vec<PathBuf> = match fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .collect(),
            Err(err) => {
                tracing::warn!(dir = %dir.display(), error = %err, "failed to list output directory");
                return Ok(Vec::new());
            }
        };
        entries.sort();

        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut artifacts = Vec::new();
        for path in entries {
            if !self.is_recognized(&path) || !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let canonical = match fs::canonicalize(&path) {
                Ok(canonical) => canonical,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to resolve output file");
                    continue;
                }
            };
            if !seen.insert(canonical.clone()) {
                tracing::debug!(path = %path.display(), "skipping duplicate output file");
                continue;
            }

            let stored = store.store_file(&canonical, tier, file_name)?;
            artifacts.push(Artifact {
                relative_path: file_name.to_string(),
                size: stored.size,
                storage_path: stored.path,
            });
        }

        artifacts.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        tracing::info!(
            dir = %dir.display(),
            count = artifacts.len(),
            "collected artifacts"
        );
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn collector() -> ArtifactCollector {
        ArtifactCollector::new(["mp4", ".WAV"], Some(PathBuf::from("videos")))
    }

    #[test]
    fn expected_dir_is_authoritative() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("work");
        write(&work.join("videos/Demo.mp4"), b"expected");
        write(&work.join("aaa/stray.mp4"), b"stray");

        let located = collector().locate(&work).unwrap();
        assert_eq!(located, work.join("videos"));
    }

    #[test]
    fn scan_uses_first_match_in_sorted_order() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("work");
        write(&work.join("videos/Demo/1080p30/Demo.mp4"), b"frames");
        write(&work.join("zz/other.mp4"), b"other");
        write(&work.join("notes.txt"), b"ignored");

        let located = collector().locate(&work).unwrap();
        assert_eq!(located, work.join("videos/Demo/1080p30"));
    }

    #[test]
    fn collects_recognized_files_case_insensitively() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("work");
        write(&work.join("videos/Demo.mp4"), b"frames");
        write(&work.join("videos/Demo.WAV"), b"audio!");
        write(&work.join("videos/Demo.log"), b"nope");
        let store = VolumeStore::new(dir.path().join("volume"));

        let artifacts = collector().collect(&work, &store, DeviceTier::Gpu).unwrap();
        let names: Vec<_> = artifacts.iter().map(|a| a.relative_path.as_str()).collect();
        assert_eq!(names, ["Demo.WAV", "Demo.mp4"]);
        assert_eq!(artifacts[1].size, 6);
        assert_eq!(
            artifacts[1].storage_path,
            dir.path().join("volume/gpu/Demo.mp4")
        );
        assert!(artifacts[1].storage_path.is_file());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_duplicates_are_stored_once() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("work");
        let target = work.join("videos/Demo.mp4");
        write(&target, b"frames");
        std::os::unix::fs::symlink(&target, work.join("videos/Latest.mp4")).unwrap();
        let store = VolumeStore::new(dir.path().join("volume"));

        let artifacts = collector().collect(&work, &store, DeviceTier::Gpu).unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].relative_path, "Demo.mp4");
    }

    #[test]
    fn storage_root_inside_working_tree_is_not_scanned() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().to_path_buf();
        let volume = work.join("aaa-volume");
        write(&volume.join("gpu/old.mp4"), b"previous run");
        write(&work.join("render/out.mp4"), b"fresh");

        let collector = ArtifactCollector::new(["mp4"], None).excluding(&volume);
        assert_eq!(collector.locate(&work).unwrap(), work.join("render"));
    }

    #[test]
    fn no_outputs_yields_empty_manifest() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("work");
        write(&work.join("scene.py"), b"print()");
        let store = VolumeStore::new(dir.path().join("volume"));

        let artifacts = collector().collect(&work, &store, DeviceTier::Cpu).unwrap();
        assert!(artifacts.is_empty());
    }

    #[test]
    fn artifact_serializes_with_manifest_keys() {
        let artifact = Artifact {
            relative_path: "Demo.mp4".into(),
            size: 12,
            storage_path: PathBuf::from("/root/output/gpu/Demo.mp4"),
        };
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["path"], "Demo.mp4");
        assert_eq!(json["size"], 12);
        assert_eq!(json["full_path"], "/root/output/gpu/Demo.mp4");
    }
}
