//! Staging of bundled artifacts into private local storage.
//!
//! Every `stage` call re-copies from the bundle, so a local copy left over
//! from an older bundle never outlives the bundle it came from.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("bundled artifact not found: {0}")]
    Missing(String),
    #[error("invalid artifact name {0:?}")]
    InvalidName(String),
    #[error("I/O error on {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("staged copy of {name} does not match the bundle ({expected} != {actual})")]
    Mismatch {
        name: String,
        expected: String,
        actual: String,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Copies named artifacts from a bundle directory into a local directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    bundle_dir: PathBuf,
    local_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(bundle_dir: impl Into<PathBuf>, local_dir: impl Into<PathBuf>) -> Self {
        Self {
            bundle_dir: bundle_dir.into(),
            local_dir: local_dir.into(),
        }
    }

    /// Copy `name` from the bundle, verify it, and return the local path.
    pub fn stage(&self, name: &str) -> Result<PathBuf, ArtifactError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(ArtifactError::InvalidName(name.to_string()));
        }

        let source = self.bundle_dir.join(name);
        if !source.is_file() {
            return Err(ArtifactError::Missing(source.display().to_string()));
        }

        std::fs::create_dir_all(&self.local_dir).map_err(io_err(&self.local_dir))?;

        let dest = self.local_dir.join(name);
        let partial = self.local_dir.join(format!(".{name}.partial"));

        let digest = match install(name, &source, &partial, &dest) {
            Ok(digest) => digest,
            Err(e) => {
                let _ = std::fs::remove_file(&partial);
                return Err(e);
            }
        };

        tracing::info!(
            name,
            path = %dest.display(),
            sha256 = %digest,
            "staged artifact"
        );

        Ok(dest)
    }

    /// Stage several artifacts, stopping at the first failure.
    pub fn stage_all(&self, names: &[&str]) -> Result<Vec<PathBuf>, ArtifactError> {
        names.iter().map(|name| self.stage(name)).collect()
    }
}

/// Copy `source` to `partial`, verify it, and rename it over `dest`.
fn install(name: &str, source: &Path, partial: &Path, dest: &Path) -> Result<String, ArtifactError> {
    std::fs::copy(source, partial).map_err(io_err(partial))?;

    let expected = file_digest(source)?;
    let actual = file_digest(partial)?;
    if expected != actual {
        return Err(ArtifactError::Mismatch {
            name: name.to_string(),
            expected,
            actual,
        });
    }

    std::fs::rename(partial, dest).map_err(io_err(dest))?;
    Ok(expected)
}

/// Lowercase hex SHA-256 of a file's contents.
pub fn file_digest(path: &Path) -> Result<String, ArtifactError> {
    let mut file = File::open(path).map_err(io_err(path))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(io_err(path))?;
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ArtifactStore) {
        let root = tempfile::tempdir().unwrap();
        let bundle = root.path().join("bundle");
        std::fs::create_dir_all(&bundle).unwrap();
        let store = ArtifactStore::new(bundle, root.path().join("local"));
        (root, store)
    }

    #[test]
    fn test_stage_copies_into_local_dir() {
        let (root, store) = store();
        std::fs::write(root.path().join("bundle/age_net.onnx"), b"graph bytes").unwrap();

        let path = store.stage("age_net.onnx").unwrap();
        assert_eq!(path, root.path().join("local/age_net.onnx"));
        assert_eq!(std::fs::read(&path).unwrap(), b"graph bytes");
        assert!(!root.path().join("local/.age_net.onnx.partial").exists());
    }

    #[test]
    fn test_stage_overwrites_stale_copy() {
        let (root, store) = store();
        std::fs::create_dir_all(root.path().join("local")).unwrap();
        std::fs::write(root.path().join("local/cascade.xml"), b"old").unwrap();
        std::fs::write(root.path().join("bundle/cascade.xml"), b"new cascade").unwrap();

        let path = store.stage("cascade.xml").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"new cascade");
    }

    #[test]
    fn test_stage_failure_removes_partial() {
        let (root, store) = store();
        std::fs::write(root.path().join("bundle/age_net.onnx"), b"graph bytes").unwrap();
        // A non-empty directory in the way makes the final rename fail.
        std::fs::create_dir_all(root.path().join("local/age_net.onnx/keep")).unwrap();

        assert!(matches!(store.stage("age_net.onnx"), Err(ArtifactError::Io { .. })));
        assert!(!root.path().join("local/.age_net.onnx.partial").exists());
    }

    #[test]
    fn test_stage_missing_source() {
        let (_root, store) = store();
        assert!(matches!(store.stage("age_net.onnx"), Err(ArtifactError::Missing(_))));
    }

    #[test]
    fn test_stage_rejects_paths() {
        let (_root, store) = store();
        for name in ["", "..", "../etc/passwd", "dir/file"] {
            assert!(matches!(store.stage(name), Err(ArtifactError::InvalidName(_))));
        }
    }

    #[test]
    fn test_stage_all_stops_at_first_missing() {
        let (root, store) = store();
        std::fs::write(root.path().join("bundle/a"), b"a").unwrap();
        let result = store.stage_all(&["a", "b"]);
        assert!(matches!(result, Err(ArtifactError::Missing(p)) if p.ends_with("b")));
    }

    #[test]
    fn test_file_digest_known_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_digest(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
