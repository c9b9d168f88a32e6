//! Per-run scratch directories
//!
//! One root per run, named after the build target, with a fresh subdirectory
//! for every job invocation. The root is removed when the run ends; dropping a
//! [`ScratchRoot`] without calling [`ScratchRoot::remove`] still removes it.

use crate::error::{Error, Result};
use crate::utils::sanitize_component;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Scratch root of one run
#[derive(Debug)]
pub struct ScratchRoot {
    dir: TempDir,
    allocated: usize,
}

impl ScratchRoot {
    /// Create a root for `identity` under `parent`
    pub async fn create(parent: &Path, identity: &str) -> Result<Self> {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create scratch directory '{}': {}",
                    parent.display(),
                    e
                ),
            ))
        })?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", sanitize_component(identity)))
            .tempdir_in(parent)?;
        debug!(root = ?dir.path(), "scratch root created");

        Ok(Self { dir, allocated: 0 })
    }

    /// Path of the root
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Reserve a new subdirectory path for an invocation of `job`
    ///
    /// Every call yields a distinct path. The directory itself is created by
    /// the invocation, so it is fresh and owned by that invocation alone.
    pub fn allocate(&mut self, job: &str) -> PathBuf {
        self.allocated += 1;
        self.dir
            .path()
            .join(format!("{:04}-{}", self.allocated, sanitize_component(job)))
    }

    /// Remove the root and everything below it
    pub async fn remove(self) -> Result<()> {
        let root = self.dir.path().to_path_buf();
        tokio::task::spawn_blocking(move || self.dir.close())
            .await
            .map_err(|e| Error::Other(format!("scratch cleanup task failed: {}", e)))??;
        debug!(?root, "scratch root removed");
        Ok(())
    }
}
