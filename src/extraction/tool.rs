//! External archive tool abstraction and the 7-Zip CLI implementation

use crate::config::ToolsConfig;
use crate::error::{Error, ExtractionError, Result};
use crate::types::ArchiveFormat;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Binary names searched for on PATH, in order
const SEVENZIP_BINARIES: &[&str] = &["7z", "7zz", "7za"];

/// Name 7-Zip gives the member it decompresses from an installer's gzip'd `Payload`
const INSTALLER_INNER_PAYLOAD: &str = "Payload~";

/// Unpacks archives on behalf of the [`StagedExtractor`](super::StagedExtractor)
///
/// The extractor owns memoization, locking and atomic placement; a tool only
/// has to produce files inside the directory it is given.
#[async_trait]
pub trait ArchiveTool: Send + Sync {
    /// Unwrap one level of `archive` into `out_dir`, returning the inner payload file
    ///
    /// The returned path must lie inside `out_dir`.
    async fn unwrap_payload(
        &self,
        archive: &Path,
        format: ArchiveFormat,
        out_dir: &Path,
    ) -> Result<PathBuf>;

    /// Extract every entry of `archive` into `out_dir`, preserving directory structure
    async fn extract_all(&self, archive: &Path, out_dir: &Path) -> Result<()>;

    /// Name of this implementation (for logging)
    fn name(&self) -> &'static str;
}

/// [`ArchiveTool`] backed by an external `7z` binary
///
/// Subprocesses are killed if the extraction future is dropped, so a cancelled
/// job does not leave 7-Zip running in the background.
pub struct CliArchiveTool {
    binary_path: PathBuf,
}

impl CliArchiveTool {
    /// Create a tool with an explicit binary path
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Attempt to find a 7-Zip binary in PATH
    pub fn from_path() -> Option<Self> {
        SEVENZIP_BINARIES
            .iter()
            .find_map(|name| which::which(name).ok())
            .map(Self::new)
    }

    /// Resolve the binary from configuration (explicit path first, then PATH if allowed)
    pub fn from_config(config: &ToolsConfig) -> Option<Self> {
        if let Some(path) = &config.sevenzip_path {
            return Some(Self::new(path.clone()));
        }
        if config.search_path {
            return Self::from_path();
        }
        None
    }

    /// Path of the binary this tool runs
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    async fn run(&self, archive: &Path, out_dir: &Path, members: &[&str]) -> Result<()> {
        let mut out_arg = std::ffi::OsString::from("-o");
        out_arg.push(out_dir);

        debug!(binary = ?self.binary_path, ?archive, ?out_dir, ?members, "running 7z");
        let output = Command::new(&self.binary_path)
            .arg("x")
            .arg("-y")
            .arg("-bd")
            .arg(out_arg)
            .arg(archive)
            .args(members)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::ExternalTool(format!("Failed to execute 7z: {}", e)))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no diagnostic output")
            .trim()
            .to_string();
        Err(ExtractionError::ExtractionFailed {
            archive: archive.to_path_buf(),
            reason: format!("7z exited with {}: {}", output.status, reason),
        }
        .into())
    }
}

#[async_trait]
impl ArchiveTool for CliArchiveTool {
    async fn unwrap_payload(
        &self,
        archive: &Path,
        format: ArchiveFormat,
        out_dir: &Path,
    ) -> Result<PathBuf> {
        match format {
            ArchiveFormat::Installer => {
                // xar container -> gzip'd Payload -> decompressed payload archive
                let xar_dir = out_dir.join("xar");
                tokio::fs::create_dir_all(&xar_dir).await?;
                self.run(archive, &xar_dir, &["Payload"]).await?;
                self.run(&xar_dir.join("Payload"), out_dir, &[]).await?;
                tokio::fs::remove_dir_all(&xar_dir).await?;

                let inner = out_dir.join(INSTALLER_INNER_PAYLOAD);
                if tokio::fs::try_exists(&inner).await? {
                    Ok(inner)
                } else {
                    single_file_in(archive, out_dir).await
                }
            }
            ArchiveFormat::CompressedTar => {
                self.run(archive, out_dir, &[]).await?;
                single_file_in(archive, out_dir).await
            }
            ArchiveFormat::SelfExtracting => Ok(archive.to_path_buf()),
        }
    }

    async fn extract_all(&self, archive: &Path, out_dir: &Path) -> Result<()> {
        self.run(archive, out_dir, &[]).await
    }

    fn name(&self) -> &'static str {
        "cli-7z"
    }
}

/// The only regular file directly inside `dir`
async fn single_file_in(archive: &Path, dir: &Path) -> Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }

    match files.len() {
        1 => Ok(files.remove(0)),
        n => Err(ExtractionError::ExtractionFailed {
            archive: archive.to_path_buf(),
            reason: format!("expected exactly one inner payload, found {}", n),
        }
        .into()),
    }
}

/// Stand-in used when no archive tool is available
///
/// Every operation fails with [`Error::NotSupported`], so runs whose jobs never
/// extract anything still work on machines without 7-Zip.
pub struct UnavailableArchiveTool;

#[async_trait]
impl ArchiveTool for UnavailableArchiveTool {
    async fn unwrap_payload(
        &self,
        _archive: &Path,
        _format: ArchiveFormat,
        _out_dir: &Path,
    ) -> Result<PathBuf> {
        Err(Error::NotSupported(
            "no 7z binary configured or found in PATH".to_string(),
        ))
    }

    async fn extract_all(&self, _archive: &Path, _out_dir: &Path) -> Result<()> {
        Err(Error::NotSupported(
            "no 7z binary configured or found in PATH".to_string(),
        ))
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}
