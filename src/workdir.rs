use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};

/// The directory that holds the CLI binary, its archive and the runtime transcript.
///
/// Only one relay may use a working directory at a time. `prepare` takes an
/// exclusive lock that is held until the `WorkDir` is dropped.
#[derive(Debug)]
pub struct WorkDir {
    root: PathBuf,
    _lock: File,
}

/// Errors that can occur while preparing the working directory.
#[derive(Debug)]
pub enum WorkdirError {
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Another relay holds the lock.
    Locked { path: PathBuf },
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for WorkdirError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkdirError::Create { path, source } => {
                write!(
                    f,
                    "failed to create working directory {}: {}",
                    path.display(),
                    source
                )
            }
            WorkdirError::Locked { path } => {
                write!(
                    f,
                    "working directory {} is in use by another relay",
                    path.display()
                )
            }
            WorkdirError::Lock { path, source } => {
                write!(f, "failed to lock {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for WorkdirError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkdirError::Create { source, .. } => Some(source),
            WorkdirError::Locked { .. } => None,
            WorkdirError::Lock { source, .. } => Some(source),
        }
    }
}

impl WorkDir {
    pub const LOCK_FILE: &'static str = ".tunnel-relay.lock";

    /// Create (if needed), canonicalize and lock the working directory.
    pub fn prepare(path: &Path) -> Result<Self, WorkdirError> {
        std::fs::create_dir_all(path).map_err(|e| WorkdirError::Create {
            path: path.to_path_buf(),
            source: e,
        })?;
        let root = path.canonicalize().map_err(|e| WorkdirError::Create {
            path: path.to_path_buf(),
            source: e,
        })?;

        let lock_path = root.join(Self::LOCK_FILE);
        let lock = File::create(&lock_path).map_err(|e| WorkdirError::Lock {
            path: lock_path.clone(),
            source: e,
        })?;
        lock.try_lock_exclusive().map_err(|e| {
            if e.kind() == fs2::lock_contended_error().kind() {
                WorkdirError::Locked { path: root.clone() }
            } else {
                WorkdirError::Lock {
                    path: lock_path.clone(),
                    source: e,
                }
            }
        })?;

        tracing::info!(path = %root.display(), "working directory ready");
        Ok(Self { root, _lock: lock })
    }

    /// The canonical directory path.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/work");
        let workdir = WorkDir::prepare(&target).unwrap();
        assert!(target.is_dir());
        assert!(workdir.root().is_absolute());
        assert!(workdir.root().join(WorkDir::LOCK_FILE).exists());
    }

    #[test]
    fn test_prepare_canonicalizes_relative_components() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("work")).unwrap();
        let workdir = WorkDir::prepare(&dir.path().join("work/../work")).unwrap();
        assert_eq!(
            workdir.root(),
            dir.path().join("work").canonicalize().unwrap()
        );
    }

    #[test]
    fn test_second_prepare_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let first = WorkDir::prepare(dir.path()).unwrap();
        let err = WorkDir::prepare(dir.path()).unwrap_err();
        assert!(matches!(err, WorkdirError::Locked { .. }));
        assert!(err.to_string().contains("in use"));

        drop(first);
        WorkDir::prepare(dir.path()).unwrap();
    }

    #[test]
    fn test_prepare_fails_when_path_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, "x").unwrap();
        let err = WorkDir::prepare(&file).unwrap_err();
        assert!(matches!(err, WorkdirError::Create { .. }));
    }
}
