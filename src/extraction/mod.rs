//! Staged archive extraction
//!
//! Installer containers wrap the content that matters in an inner payload archive.
//! Extraction therefore happens in two stages:
//! 1. [`StagedExtractor::extract_first_stage`] unwraps one container level and caches
//!    the inner payload next to the outer archive (`<archive>.payload`). The cache
//!    survives across runs; a present payload file means the unwrap is done.
//! 2. [`StagedExtractor::extract_filtered`] copies the paths matching a set of glob
//!    patterns out of the payload into a destination directory.

mod filter;
mod tool;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use filter::PathFilter;
pub use tool::{ArchiveTool, CliArchiveTool, UnavailableArchiveTool};

use crate::error::{Error, ExtractionError, Result};
use crate::types::{ArchiveFormat, Asset};
use crate::utils::relative_slash_path;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

/// Suffix of the cached inner payload next to its outer archive
pub const PAYLOAD_SUFFIX: &str = ".payload";

/// Detect an archive's container format from its file name
///
/// Returns `None` for anything outside the closed set of recognized formats.
pub fn detect_archive_format(path: &Path) -> Option<ArchiveFormat> {
    let name = path.file_name()?.to_str()?.to_lowercase();

    if name.ends_with(".pkg") {
        Some(ArchiveFormat::Installer)
    } else if name.ends_with(".exe") {
        Some(ArchiveFormat::SelfExtracting)
    } else if [".tar.gz", ".tgz", ".tar.xz", ".txz", ".tar.bz2", ".tbz2"]
        .iter()
        .any(|ext| name.ends_with(ext))
    {
        Some(ArchiveFormat::CompressedTar)
    } else {
        None
    }
}

/// Path the inner payload of `archive` is cached at
pub fn payload_path(archive: &Path) -> PathBuf {
    let mut name = archive
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PAYLOAD_SUFFIX);
    archive.with_file_name(name)
}

/// Two-stage extractor shared by every job of a run (and across runs)
pub struct StagedExtractor {
    tool: Arc<dyn ArchiveTool>,
    /// One lock per outer archive so concurrent first-stage requests unwrap once
    unwraps: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl StagedExtractor {
    /// Create an extractor that delegates unpacking to `tool`
    pub fn new(tool: Arc<dyn ArchiveTool>) -> Self {
        Self {
            tool,
            unwraps: Mutex::new(HashMap::new()),
        }
    }

    /// Unwrap one level of `archive`, detecting its format from the file name
    pub async fn extract_first_stage(&self, archive: &Path) -> Result<PathBuf> {
        let format = detect_archive_format(archive).ok_or_else(|| {
            Error::from(ExtractionError::UnrecognizedFormat {
                archive: archive.to_path_buf(),
            })
        })?;
        self.extract_first_stage_as(archive, format).await
    }

    /// Unwrap one level of a downloaded asset
    ///
    /// The format declared on the asset's spec wins over the file name.
    pub async fn extract_asset_first_stage(&self, asset: &Asset) -> Result<PathBuf> {
        match asset.spec.format {
            Some(format) => self.extract_first_stage_as(&asset.destination, format).await,
            None => self.extract_first_stage(&asset.destination).await,
        }
    }

    /// Unwrap one level of `archive` using a declared format
    ///
    /// Self-extracting executables are read directly, so their payload is the
    /// archive itself. For other formats the payload is produced at most once:
    /// concurrent callers wait for the first, and later callers (including later
    /// runs) find it on disk.
    pub async fn extract_first_stage_as(
        &self,
        archive: &Path,
        format: ArchiveFormat,
    ) -> Result<PathBuf> {
        if format == ArchiveFormat::SelfExtracting {
            return Ok(archive.to_path_buf());
        }

        let payload = payload_path(archive);
        if tokio::fs::try_exists(&payload).await? {
            debug!(?archive, ?payload, "payload already unwrapped");
            return Ok(payload);
        }

        let lock = self.unwrap_lock(archive);
        let _guard = lock.lock().await;

        // another caller may have finished while we waited
        if tokio::fs::try_exists(&payload).await? {
            debug!(?archive, ?payload, "payload unwrapped by concurrent caller");
            return Ok(payload);
        }

        let mut partial_name = payload
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        partial_name.push(".partial");
        let partial_dir = payload.with_file_name(partial_name);

        if tokio::fs::try_exists(&partial_dir).await? {
            tokio::fs::remove_dir_all(&partial_dir).await?;
        }
        tokio::fs::create_dir_all(&partial_dir).await?;

        info!(?archive, ?format, tool = self.tool.name(), "unwrapping first stage");
        let result = self.tool.unwrap_payload(archive, format, &partial_dir).await;
        let produced = match result {
            Ok(path) if path.starts_with(&partial_dir) && path.is_file() => path,
            Ok(path) => {
                remove_dir_logged(&partial_dir).await;
                return Err(ExtractionError::MissingPayload {
                    archive: archive.to_path_buf(),
                    expected: path.display().to_string(),
                }
                .into());
            }
            Err(e) => {
                remove_dir_logged(&partial_dir).await;
                return Err(e);
            }
        };

        tokio::fs::rename(&produced, &payload).await?;
        remove_dir_logged(&partial_dir).await;

        info!(?archive, ?payload, "first stage complete");
        Ok(payload)
    }

    /// Copy the entries of `payload` matching `patterns` into `dest_dir`
    ///
    /// With `flatten`, every matched file lands directly in `dest_dir` (later
    /// matches with the same file name replace earlier ones); otherwise the
    /// payload-relative directory structure is kept. Returns the written paths.
    pub async fn extract_filtered<S: AsRef<str>>(
        &self,
        payload: &Path,
        dest_dir: &Path,
        patterns: &[S],
        flatten: bool,
    ) -> Result<Vec<PathBuf>> {
        let filter = PathFilter::new(patterns)?;
        tokio::fs::create_dir_all(dest_dir).await?;

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(dest_dir)?;

        debug!(?payload, ?dest_dir, flatten, tool = self.tool.name(), "extracting payload");
        self.tool.extract_all(payload, staging.path()).await?;

        let staging_path = staging.path().to_path_buf();
        let dest = dest_dir.to_path_buf();
        let archive = payload.to_path_buf();
        let written = spawn_blocking(move || move_matches(&staging_path, &dest, &filter, flatten))
            .await
            .map_err(|e| {
                Error::from(ExtractionError::ExtractionFailed {
                    archive,
                    reason: format!("extraction task panicked: {}", e),
                })
            })??;

        staging.close()?;

        if written.is_empty() {
            warn!(?payload, "no payload entries matched the requested patterns");
        } else {
            info!(?payload, ?dest_dir, files = written.len(), "filtered extraction complete");
        }
        Ok(written)
    }

    fn unwrap_lock(&self, archive: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .unwraps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(archive.to_path_buf()).or_default())
    }
}

/// Move every staged file matching `filter` into `dest`
fn move_matches(
    staging: &Path,
    dest: &Path,
    filter: &PathFilter,
    flatten: bool,
) -> Result<Vec<PathBuf>> {
    // collect first so the tree is not mutated while it is being walked
    let mut matched = Vec::new();
    for entry in walkdir::WalkDir::new(staging).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            Error::Io(std::io::Error::other(format!(
                "failed to walk staging directory: {}",
                e
            )))
        })?;
        if entry.file_type().is_dir() {
            continue;
        }

        let Some(relative) = relative_slash_path(staging, entry.path()) else {
            continue;
        };
        if filter.matches(&relative) {
            matched.push((entry.into_path(), relative));
        }
    }

    let mut written: Vec<PathBuf> = Vec::with_capacity(matched.len());
    for (source, relative) in matched {
        let target = match (flatten, source.file_name()) {
            (true, Some(name)) => dest.join(name),
            _ => dest.join(&relative),
        };
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if flatten && written.contains(&target) {
            warn!(?target, source = %relative, "flattened entry replaces an earlier match");
            written.retain(|p| p != &target);
        }
        std::fs::rename(&source, &target)?;
        written.push(target);
    }

    Ok(written)
}

async fn remove_dir_logged(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        warn!(error = %e, ?dir, "failed to remove partial unwrap directory");
    }
}
