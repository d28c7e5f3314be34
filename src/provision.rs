/// Binary provisioning: make sure the login-capable CLI is installed in the
/// working directory, downloading and unpacking its tarball when missing.
use crate::config::ProvisionConfig;
use async_trait::async_trait;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

/// Errors that can occur while provisioning the CLI.
#[derive(Debug)]
pub enum ProvisionError {
    /// The HTTP request failed or returned a non-success status.
    Download {
        url: String,
        source: reqwest::Error,
    },
    /// Local filesystem failure.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The archive contains an entry that would land outside the install dir.
    UnsafeEntry { entry: PathBuf },
    /// Extraction finished but the executable is not there.
    MissingExecutable { path: PathBuf },
}

impl std::fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisionError::Download { url, source } => {
                write!(f, "failed to download {url}: {source}")
            }
            ProvisionError::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
            ProvisionError::UnsafeEntry { entry } => {
                write!(f, "path traversal attempt in archive: {}", entry.display())
            }
            ProvisionError::MissingExecutable { path } => {
                write!(
                    f,
                    "archive did not contain the expected executable: {}",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for ProvisionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProvisionError::Download { source, .. } => Some(source),
            ProvisionError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ProvisionError + '_ {
    move |source| ProvisionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Ensures the login executable exists, returning its path.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn ensure(&self, install_dir: &Path) -> Result<PathBuf, ProvisionError>;
}

/// Downloads the CLI tarball over HTTPS and unpacks it.
pub struct CliProvisioner {
    download_url: String,
    archive_name: String,
    executable_name: String,
}

impl CliProvisioner {
    pub fn new(config: &ProvisionConfig) -> Self {
        Self {
            download_url: config.download_url.clone(),
            archive_name: config.archive_name.clone(),
            executable_name: config.executable_name.clone(),
        }
    }

    /// Stream the archive into a temp file next to `dest`, then rename it into place.
    async fn download(&self, dest: &Path) -> Result<(), ProvisionError> {
        let download_err = |source| ProvisionError::Download {
            url: self.download_url.clone(),
            source,
        };

        tracing::info!(url = %self.download_url, dest = %dest.display(), "downloading CLI archive");
        let mut response = reqwest::get(self.download_url.as_str())
            .await
            .and_then(|r| r.error_for_status())
            .map_err(download_err)?;

        let dir = dest.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err(dir))?;
        let mut bytes = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(download_err)? {
            tmp.write_all(&chunk).map_err(io_err(dest))?;
            bytes += chunk.len() as u64;
        }
        tmp.as_file().sync_all().map_err(io_err(dest))?;
        tmp.persist(dest).map_err(|e| ProvisionError::Io {
            path: dest.to_path_buf(),
            source: e.error,
        })?;

        tracing::debug!(bytes, "download complete");
        Ok(())
    }
}

#[async_trait]
impl Provisioner for CliProvisioner {
    async fn ensure(&self, install_dir: &Path) -> Result<PathBuf, ProvisionError> {
        let executable = install_dir.join(&self.executable_name);
        if executable.is_file() {
            tracing::info!(path = %executable.display(), "CLI already installed");
            make_executable(&executable)?;
            return Ok(executable);
        }

        let archive = install_dir.join(&self.archive_name);
        if archive.is_file() {
            tracing::info!(path = %archive.display(), "CLI archive already downloaded");
        } else {
            self.download(&archive).await?;
        }

        let (archive_path, dir) = (archive.clone(), install_dir.to_path_buf());
        tokio::task::spawn_blocking(move || extract_tar_gz(&archive_path, &dir))
            .await
            .map_err(|e| ProvisionError::Io {
                path: archive.clone(),
                source: std::io::Error::other(e),
            })??;

        if !executable.is_file() {
            return Err(ProvisionError::MissingExecutable { path: executable });
        }
        make_executable(&executable)?;
        tracing::info!(path = %executable.display(), "CLI installed");
        Ok(executable)
    }
}

/// Unpack a `.tar.gz` into `dest`, rejecting absolute or `..` entries.
///
/// Every entry is checked before anything is written, so a rejected archive
/// leaves `dest` untouched.
pub fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<(), ProvisionError> {
    tracing::info!(archive = %archive.display(), dest = %dest.display(), "extracting CLI archive");

    let mut checked = 0usize;
    let mut tarball = open_tar_gz(archive)?;
    for entry in tarball.entries().map_err(io_err(archive))? {
        let entry = entry.map_err(io_err(archive))?;
        let path = entry.path().map_err(io_err(archive))?;
        let escapes = path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
        if escapes {
            return Err(ProvisionError::UnsafeEntry {
                entry: path.into_owned(),
            });
        }
        checked += 1;
    }
    tracing::debug!(entries = checked, "archive entries checked");

    std::fs::create_dir_all(dest).map_err(io_err(dest))?;
    let mut tarball = open_tar_gz(archive)?;
    for entry in tarball.entries().map_err(io_err(archive))? {
        let mut entry = entry.map_err(io_err(archive))?;
        let path = entry.path().map_err(io_err(archive))?.into_owned();
        entry.unpack_in(dest).map_err(io_err(&dest.join(&path)))?;
    }
    Ok(())
}

type TarGz = tar::Archive<flate2::read::GzDecoder<std::fs::File>>;

fn open_tar_gz(archive: &Path) -> Result<TarGz, ProvisionError> {
    let file = std::fs::File::open(archive).map_err(io_err(archive))?;
    Ok(tar::Archive::new(flate2::read::GzDecoder::new(file)))
}

fn make_executable(path: &Path) -> Result<(), ProvisionError> {
    let mut perms = std::fs::metadata(path).map_err(io_err(path))?.permissions();
    if perms.mode() & 0o111 != 0o111 {
        perms.set_mode(perms.mode() | 0o755);
        std::fs::set_permissions(path, perms).map_err(io_err(path))?;
    }
    Ok(())
}
