//! Job interface consumed by the planner and dispatcher
//!
//! A job declares which assets it needs for a given build target and how it
//! wants to be invoked once they are on disk. What it computes is its own
//! business: the engine only hands it a scratch directory, the ready assets
//! and a cancellation token.

use crate::error::Result;
use crate::extraction::StagedExtractor;
use crate::types::{Asset, AssetSpec, BuildTarget, DispatchMode};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a job requires from a particular build target
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Needs {
    /// The job runs against these assets, in this order
    ///
    /// An empty list means the job does not apply to the target.
    Assets(Vec<AssetSpec>),
    /// The prerequisites do not exist for this target; the job is left out
    Unavailable(String),
    /// The prerequisites exist but contradict each other; planning fails
    Contradiction(String),
}

impl Needs {
    /// The job does not apply to this target
    pub fn none() -> Self {
        Needs::Assets(Vec::new())
    }
}

/// One unit of extraction work
///
/// # Examples
///
/// ```no_run
/// use async_trait::async_trait;
/// use release_miner::job::{Job, JobInvocation, Needs};
/// use release_miner::types::{AssetSpec, BuildTarget, DispatchMode};
/// use release_miner::Result;
///
/// struct Release(String);
///
/// impl BuildTarget for Release {
///     fn identity(&self) -> String {
///         self.0.clone()
///     }
/// }
///
/// struct ManagedLibraries;
///
/// #[async_trait]
/// impl Job<Release> for ManagedLibraries {
///     fn name(&self) -> &str {
///         "managed-libraries"
///     }
///
///     fn mode(&self) -> DispatchMode {
///         DispatchMode::Incremental
///     }
///
///     fn needs(&self, target: &Release) -> Needs {
///         let url = format!("https://download.example.com/{}/Editor.tar.xz", target.0);
///         match url.parse() {
///             Ok(locator) => Needs::Assets(vec![AssetSpec::new(locator, "Editor.tar.xz")]),
///             Err(e) => Needs::Unavailable(e.to_string()),
///         }
///     }
///
///     async fn execute(&self, invocation: JobInvocation<Release>) -> Result<()> {
///         let asset = &invocation.assets[0];
///         let payload = invocation.extractor.extract_asset_first_stage(asset).await?;
///         invocation
///             .extractor
///             .extract_filtered(&payload, invocation.scratch_dir.as_path(), &["**/*.dll"], true)
///             .await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Job<T: BuildTarget>: Send + Sync {
    /// Name used in logs, events and errors
    fn name(&self) -> &str;

    /// How the job is invoked as its assets become ready
    fn mode(&self) -> DispatchMode;

    /// Assets this job needs for `target`
    fn needs(&self, target: &T) -> Needs;

    /// Run the job body
    ///
    /// In [`DispatchMode::Incremental`] the invocation always carries exactly
    /// one asset. Bodies should watch `invocation.cancel` and return early
    /// once it fires.
    async fn execute(&self, invocation: JobInvocation<T>) -> Result<()>;
}

/// Everything a job body receives for one invocation
pub struct JobInvocation<T> {
    /// The build target being mined
    pub target: Arc<T>,
    /// Freshly created directory owned by this invocation alone
    pub scratch_dir: PathBuf,
    /// Ready assets, in need-set order
    pub assets: Vec<Asset>,
    /// Run-wide cancellation scope
    pub cancel: CancellationToken,
    /// Shared staged extractor
    pub extractor: Arc<StagedExtractor>,
}

impl<T> JobInvocation<T> {
    /// Local paths of the assets, parallel to [`assets`](Self::assets)
    pub fn local_paths(&self) -> Vec<&Path> {
        self.assets.iter().map(|a| a.destination.as_path()).collect()
    }

    /// Whether the run has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
