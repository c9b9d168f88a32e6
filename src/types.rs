//! Core types for release-miner

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

/// Position of an asset in a plan's asset list
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetIndex(pub usize);

impl AssetIndex {
    /// Get the inner position
    pub fn get(&self) -> usize {
        self.0
    }
}

impl From<usize> for AssetIndex {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

impl std::fmt::Display for AssetIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the thing being mined (one release for one platform, for example)
///
/// The engine never inspects a target beyond its identity, which names the
/// run's scratch root. Everything else is passed through to jobs untouched.
pub trait BuildTarget: Send + Sync + 'static {
    /// Stable, human-readable identity of this target
    fn identity(&self) -> String;
}

/// Outer container format of a downloaded archive
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    /// Installer package whose real content sits in an inner `Payload` archive (.pkg)
    Installer,
    /// Self-extracting executable readable directly as an archive (.exe)
    SelfExtracting,
    /// Compressed tarball (.tar.gz, .tgz, .tar.xz, .txz, .tar.bz2)
    CompressedTar,
}

/// What a job asks the planner for: one remote file and what it is expected to be
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSpec {
    /// Where to fetch it from
    pub locator: Url,
    /// File name under the download directory
    pub file_name: String,
    /// Version the job expects this file to carry, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Declared container format, if the job knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ArchiveFormat>,
    /// Expected SHA-256 of the file (lowercase hex)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl AssetSpec {
    /// Create a spec with only a locator and file name
    pub fn new(locator: Url, file_name: impl Into<String>) -> Self {
        Self {
            locator,
            file_name: file_name.into(),
            version: None,
            format: None,
            sha256: None,
        }
    }

    /// Set the expected version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set the declared archive format
    pub fn with_format(mut self, format: ArchiveFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Set the expected SHA-256 digest
    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into().to_lowercase());
        self
    }
}

/// One remotely fetchable unit of a plan
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Position in the plan's asset list
    pub index: AssetIndex,
    /// Where the downloaded file lives once ready
    pub destination: PathBuf,
    /// Locator and metadata as requested by the jobs that need it
    pub spec: AssetSpec,
}

impl Asset {
    /// Source locator
    pub fn locator(&self) -> &Url {
        &self.spec.locator
    }
}

/// How a job is invoked as its assets become ready
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Invoked exactly once, with every needed asset, after all of them are ready
    Batch,
    /// Invoked once per needed asset, as soon as that asset is ready
    Incremental,
}

/// Transfer state of an asset within a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetState {
    /// Not yet started
    Pending,
    /// Transfer in flight (possibly waiting for a permit)
    Downloading,
    /// Waiting out the backoff before re-issuing a transfer
    Retrying,
    /// On disk at its destination
    Ready,
    /// Failed fatally
    Failed,
}

impl AssetState {
    /// Whether no further transitions can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, AssetState::Ready | AssetState::Failed)
    }
}

/// Event emitted during a mining run
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Planning finished and transfers are about to start
    RunStarted {
        /// Identity of the build target
        target: String,
        /// Number of assets in the plan
        assets: usize,
        /// Number of jobs in the plan
        jobs: usize,
    },

    /// A job was left out of the plan because its prerequisites are unavailable
    JobSkipped {
        /// Job name
        job: String,
        /// Why it was left out
        reason: String,
    },

    /// A transfer for an asset was issued
    AssetDownloading {
        /// Asset position
        asset: AssetIndex,
        /// Attempt number, starting at 1
        attempt: u32,
    },

    /// An asset reached its destination
    AssetReady {
        /// Asset position
        asset: AssetIndex,
        /// True when the file was already present and no transfer happened
        skipped: bool,
    },

    /// A transient failure was observed and the transfer will be re-issued
    AssetRetrying {
        /// Asset position
        asset: AssetIndex,
        /// Retry number, starting at 1
        retry: u32,
        /// Delay before the transfer is re-issued, in milliseconds
        delay_ms: u64,
        /// Error message
        error: String,
    },

    /// An asset failed fatally
    AssetFailed {
        /// Asset position
        asset: AssetIndex,
        /// Error message
        error: String,
    },

    /// A job invocation was launched
    JobStarted {
        /// Job name
        job: String,
        /// Assets passed to this invocation
        assets: Vec<AssetIndex>,
    },

    /// A job invocation finished
    JobFinished {
        /// Job name
        job: String,
        /// Assets passed to this invocation
        assets: Vec<AssetIndex>,
        /// Error message if the invocation failed
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Every transfer and job finished successfully
    RunCompleted {
        /// Number of job invocations
        invocations: usize,
    },

    /// The run was aborted
    RunAborted {
        /// Originating error, or None when aborted by cancellation
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// One job invocation performed during a run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    /// Job name
    pub job: String,
    /// Assets passed, in need-set order
    pub assets: Vec<AssetIndex>,
}

/// Summary of a completed run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    /// Identity of the build target
    pub target: String,
    /// Number of assets in the plan
    pub assets: usize,
    /// Assets fetched over the network
    pub downloaded: usize,
    /// Assets already present at their destination
    pub skipped: usize,
    /// Transient failures that led to a re-issued transfer
    pub retries: u32,
    /// Every job invocation, in launch order
    pub invocations: Vec<Invocation>,
    /// When planning finished
    pub started_at: DateTime<Utc>,
    /// When the last task finished
    pub finished_at: DateTime<Utc>,
}
