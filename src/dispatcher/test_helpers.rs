//! Shared test helpers: scripted fetchers, recording jobs, and engine setup.

use crate::config::Config;
use crate::dispatcher::Engine;
use crate::error::{Error, Result, TransferError};
use crate::extraction::UnavailableArchiveTool;
use crate::job::{Job, JobInvocation, Needs};
use crate::transfer::{Fetcher, TransferOutcome};
use crate::types::{Asset, AssetSpec, BuildTarget, DispatchMode};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Build target with a fixed identity
#[derive(Clone, Debug)]
pub(crate) struct TestTarget(pub(crate) &'static str);

impl Default for TestTarget {
    fn default() -> Self {
        Self("2022.3.1f1-linux")
    }
}

impl BuildTarget for TestTarget {
    fn identity(&self) -> String {
        self.0.to_string()
    }
}

/// Spec for an asset whose file name is `name`
pub(crate) fn asset_spec(name: &str) -> AssetSpec {
    AssetSpec::new(
        Url::parse(&format!("https://assets.test/{name}")).unwrap(),
        name,
    )
}

/// Config pointing every directory into `temp`, with short delays
pub(crate) fn test_config(temp: &TempDir) -> Config {
    let mut config = Config::default();
    config.transfer.download_dir = temp.path().join("downloads");
    config.scratch.root = temp.path().join("scratch");
    config.retry.initial_delay = Duration::from_millis(20);
    config.dispatch.abort_grace = Duration::from_secs(5);
    config
}

/// Engine wired to `fetcher` and no archive tool
pub(crate) fn test_engine(config: Config, fetcher: Arc<ScriptedFetcher>) -> Engine {
    Engine::with_services(config, fetcher, Arc::new(UnavailableArchiveTool)).unwrap()
}

/// Entries left in the scratch parent directory
pub(crate) fn scratch_entries(temp: &TempDir) -> usize {
    match std::fs::read_dir(temp.path().join("scratch")) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

/// One scripted response of a [`ScriptedFetcher`]
pub(crate) enum Step {
    /// Write the file and succeed
    Succeed,
    /// Succeed after a delay (cancellable)
    SucceedAfter(Duration),
    /// Succeed once notified (cancellable)
    WaitFor(Arc<Notify>),
    /// Fail with an I/O error wrapping a connection reset
    ConnectionReset,
    /// Fail with a non-retryable HTTP status
    Fatal,
    /// Fail fatally after a delay (cancellable)
    FatalAfter(Duration),
    /// Never finish until cancelled
    Hang,
    /// Never finish, ignoring cancellation
    HangIgnoringCancel,
}

/// [`Fetcher`] driven by per-file scripts
///
/// Mirrors the real transfer's re-entry behavior: an existing destination is
/// reported as already present without consuming a step. An exhausted script
/// succeeds.
#[derive(Default)]
pub(crate) struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<HashMap<String, usize>>,
    cancelled: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append steps to the script of `file_name`
    pub(crate) fn script(&self, file_name: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(file_name.to_string())
            .or_default()
            .extend(steps);
    }

    /// Number of fetches for `file_name`
    pub(crate) fn calls(&self, file_name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(file_name)
            .copied()
            .unwrap_or(0)
    }

    /// Files whose fetch observed cancellation
    pub(crate) fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    fn next_step(&self, file_name: &str) -> Step {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(file_name)
            .and_then(|s| s.pop_front())
            .unwrap_or(Step::Succeed)
    }

    fn note_cancelled(&self, file_name: &str) -> Error {
        self.cancelled.lock().unwrap().push(file_name.to_string());
        Error::Cancelled
    }

    async fn write(asset: &Asset) -> Result<TransferOutcome> {
        if let Some(parent) = asset.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = asset.spec.file_name.as_bytes();
        tokio::fs::write(&asset.destination, body).await?;
        Ok(TransferOutcome::Downloaded {
            bytes: body.len() as u64,
        })
    }

    fn fatal(asset: &Asset) -> Error {
        TransferError::HttpStatus {
            url: asset.locator().to_string(),
            status: 500,
        }
        .into()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, asset: &Asset, cancel: &CancellationToken) -> Result<TransferOutcome> {
        let name = asset.spec.file_name.as_str();
        *self.calls.lock().unwrap().entry(name.to_string()).or_default() += 1;

        if asset.destination.exists() {
            return Ok(TransferOutcome::AlreadyPresent);
        }

        match self.next_step(name) {
            Step::Succeed => Self::write(asset).await,
            Step::SucceedAfter(delay) => tokio::select! {
                _ = cancel.cancelled() => Err(self.note_cancelled(name)),
                _ = tokio::time::sleep(delay) => Self::write(asset).await,
            },
            Step::WaitFor(notify) => tokio::select! {
                _ = cancel.cancelled() => Err(self.note_cancelled(name)),
                _ = notify.notified() => Self::write(asset).await,
            },
            Step::ConnectionReset => Err(Error::Io(std::io::Error::other(
                std::io::Error::from(std::io::ErrorKind::ConnectionReset),
            ))),
            Step::Fatal => Err(Self::fatal(asset)),
            Step::FatalAfter(delay) => tokio::select! {
                _ = cancel.cancelled() => Err(self.note_cancelled(name)),
                _ = tokio::time::sleep(delay) => Err(Self::fatal(asset)),
            },
            Step::Hang => {
                cancel.cancelled().await;
                Err(self.note_cancelled(name))
            }
            Step::HangIgnoringCancel => std::future::pending().await,
        }
    }
}

/// What a [`RecordingJob`] body does
#[derive(Clone)]
pub(crate) enum Behavior {
    Succeed,
    Fail,
    Panic,
    /// Block until the run is cancelled, then report cancellation
    WaitForCancel,
    /// Notify before succeeding
    Notify(Arc<Notify>),
}

/// One observed invocation
#[derive(Clone, Debug)]
pub(crate) struct Invoked {
    pub(crate) job: String,
    pub(crate) files: Vec<String>,
    pub(crate) scratch_dir: PathBuf,
    /// Scratch directory existed and was empty at entry
    pub(crate) scratch_fresh: bool,
    /// Every asset's local path existed at entry
    pub(crate) assets_present: bool,
    pub(crate) at: Instant,
}

/// Job that records its invocations
pub(crate) struct RecordingJob {
    name: String,
    mode: DispatchMode,
    needs: Needs,
    behavior: Behavior,
    log: Arc<Mutex<Vec<Invoked>>>,
}

impl RecordingJob {
    pub(crate) fn new(name: &str, mode: DispatchMode, specs: Vec<AssetSpec>) -> Self {
        Self {
            name: name.to_string(),
            mode,
            needs: Needs::Assets(specs),
            behavior: Behavior::Succeed,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn with_needs(mut self, needs: Needs) -> Self {
        self.needs = needs;
        self
    }

    pub(crate) fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Share one invocation log between several jobs
    pub(crate) fn with_log(mut self, log: Arc<Mutex<Vec<Invoked>>>) -> Self {
        self.log = log;
        self
    }

    pub(crate) fn log(&self) -> Arc<Mutex<Vec<Invoked>>> {
        Arc::clone(&self.log)
    }

    pub(crate) fn into_job<T: BuildTarget>(self) -> Arc<dyn Job<T>> {
        Arc::new(self)
    }
}

#[async_trait]
impl<T: BuildTarget> Job<T> for RecordingJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> DispatchMode {
        self.mode
    }

    fn needs(&self, _target: &T) -> Needs {
        self.needs.clone()
    }

    async fn execute(&self, invocation: JobInvocation<T>) -> Result<()> {
        let scratch_fresh = std::fs::read_dir(&invocation.scratch_dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        self.log.lock().unwrap().push(Invoked {
            job: self.name.clone(),
            files: invocation
                .assets
                .iter()
                .map(|a| a.spec.file_name.clone())
                .collect(),
            scratch_dir: invocation.scratch_dir.clone(),
            scratch_fresh,
            assets_present: invocation.local_paths().iter().all(|p| p.exists()),
            at: Instant::now(),
        });

        // leave something behind so scratch cleanup has work to do
        tokio::fs::write(invocation.scratch_dir.join("output.txt"), &self.name).await?;

        match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail => Err(Error::Other(format!("{} could not repackage", self.name))),
            Behavior::Panic => panic!("{} hit an impossible layout", self.name),
            Behavior::WaitForCancel => {
                invocation.cancel.cancelled().await;
                Err(Error::Cancelled)
            }
            Behavior::Notify(notify) => {
                notify.notify_one();
                Ok(())
            }
        }
    }
}
