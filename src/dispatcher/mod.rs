//! Dependency-gated acquisition and dispatch
//!
//! [`Engine::run`] plans a run, starts every transfer at once (the transfer
//! permit pool is what limits parallelism), and reacts to each transfer as it
//! reaches a terminal state:
//! - success marks the asset ready and launches every job invocation that
//!   became due, each in its own scratch subdirectory
//! - a connection reset is retried after the configured backoff
//! - anything else cancels the run, waits for all tasks to unwind and returns
//!   the originating error
//!
//! The dispatch loop is the only place that mutates the ledger or decides what
//! to launch next. It never detaches tasks: when `run` returns, nothing the run
//! started is still executing, and the scratch root is gone.

mod ledger;
mod scratch;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

pub use scratch::ScratchRoot;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::extraction::{ArchiveTool, CliArchiveTool, StagedExtractor, UnavailableArchiveTool};
use crate::job::{Job, JobInvocation};
use crate::planner::{Plan, Planner};
use crate::retry::{Backoff, IsRetryable};
use crate::transfer::{Fetcher, HttpTransfer, TransferOutcome};
use crate::types::{AssetIndex, BuildTarget, Event, Invocation, RunReport};
use chrono::Utc;
use futures::FutureExt;
use ledger::Ledger;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Mining engine (cloneable - all fields are Arc-wrapped)
///
/// One engine can serve many runs, sequentially or concurrently; runs share
/// the transfer permit pool and the staged extractor.
#[derive(Clone)]
pub struct Engine {
    config: Arc<Config>,
    fetcher: Arc<dyn Fetcher>,
    extractor: Arc<StagedExtractor>,
    event_tx: broadcast::Sender<Event>,
}

impl Engine {
    /// Create an engine with the HTTP transfer service and the 7-Zip CLI tool
    ///
    /// Without a usable 7z binary the engine still runs; extraction then fails
    /// with [`Error::NotSupported`].
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let fetcher = Arc::new(HttpTransfer::new(&config.transfer)?);

        let tool: Arc<dyn ArchiveTool> = match CliArchiveTool::from_config(&config.tools) {
            Some(tool) => Arc::new(tool),
            None => Arc::new(UnavailableArchiveTool),
        };
        info!(
            archive_tool = tool.name(),
            transfer_slots = config.transfer.max_concurrent_transfers,
            "Engine initialized"
        );

        Self::with_services(config, fetcher, tool)
    }

    /// Create an engine with caller-supplied transfer and archive implementations
    pub fn with_services(
        config: Config,
        fetcher: Arc<dyn Fetcher>,
        tool: Arc<dyn ArchiveTool>,
    ) -> Result<Self> {
        config.validate()?;
        let (event_tx, _rx) = broadcast::channel(config.dispatch.event_capacity);

        Ok(Self {
            config: Arc::new(config),
            fetcher,
            extractor: Arc::new(StagedExtractor::new(tool)),
            event_tx,
        })
    }

    /// Subscribe to run events
    ///
    /// Each subscriber receives every event emitted after it subscribed. A
    /// subscriber that falls more than `dispatch.event_capacity` events behind
    /// receives `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// The staged extractor handed to every job invocation
    pub fn extractor(&self) -> Arc<StagedExtractor> {
        Arc::clone(&self.extractor)
    }

    /// Plan and execute one run of `jobs` for `target`
    ///
    /// `cancel` links the run to an outside cancellation signal; the run
    /// derives its own scope from it, so a fatal error inside the run never
    /// cancels the caller's token.
    ///
    /// Returns [`Error::Plan`] without downloading anything if the plan is
    /// contradictory, [`Error::Cancelled`] if `cancel` fired, and otherwise
    /// the first fatal error of the run.
    pub async fn run<T: BuildTarget>(
        &self,
        target: Arc<T>,
        jobs: &[Arc<dyn Job<T>>],
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let identity = target.identity();
        let planner = Planner::new(self.config.download_dir().clone());

        let plan = match planner.plan(target.as_ref(), jobs) {
            Ok(plan) => plan,
            Err(e) => {
                error!(
                    build_target = %identity,
                    error = %e,
                    "planning failed, nothing will be downloaded"
                );
                self.emit_event(Event::RunAborted {
                    error: Some(e.to_string()),
                });
                return Err(e.into());
            }
        };
        for skipped in &plan.skipped {
            self.emit_event(Event::JobSkipped {
                job: skipped.job.clone(),
                reason: skipped.reason.clone(),
            });
        }

        let scratch = ScratchRoot::create(&self.config.scratch.root, &identity).await?;
        let started_at = Utc::now();
        self.emit_event(Event::RunStarted {
            target: identity.clone(),
            assets: plan.assets.len(),
            jobs: plan.jobs.len(),
        });
        info!(
            build_target = %identity,
            assets = plan.assets.len(),
            jobs = plan.jobs.len(),
            "run started"
        );

        let mut dispatch = Dispatch::new(self, target, plan, scratch, cancel.child_token());
        let outcome = dispatch.drive().await;
        let Dispatch {
            scratch,
            ledger,
            plan,
            tally,
            ..
        } = dispatch;

        // every task has finished by now, so nothing still uses the scratch tree
        if let Err(e) = scratch.remove().await {
            warn!(build_target = %identity, error = %e, "failed to remove scratch root");
        }

        match outcome {
            Ok(()) => {
                info!(
                    build_target = %identity,
                    invocations = tally.invocations.len(),
                    downloaded = tally.downloaded,
                    skipped = tally.skipped,
                    "run completed"
                );
                self.emit_event(Event::RunCompleted {
                    invocations: tally.invocations.len(),
                });
                Ok(RunReport {
                    target: identity,
                    assets: plan.assets.len(),
                    downloaded: tally.downloaded,
                    skipped: tally.skipped,
                    retries: ledger.total_retries(),
                    invocations: tally.invocations,
                    started_at,
                    finished_at: Utc::now(),
                })
            }
            Err(e) if e.is_cancelled() => {
                info!(build_target = %identity, "run cancelled");
                self.emit_event(Event::RunAborted { error: None });
                Err(e)
            }
            Err(e) => {
                error!(
                    build_target = %identity,
                    error = %e,
                    code = e.error_code(),
                    "run aborted"
                );
                self.emit_event(Event::RunAborted {
                    error: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    /// Emit an event to all subscribers
    ///
    /// With no subscribers the event is dropped.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}

/// How a transfer task ended
enum TransferExit {
    /// The fetch returned
    Finished(AssetIndex, Result<TransferOutcome>),
    /// The backoff before a retry elapsed
    RetryDue(AssetIndex),
}

/// How a job task ended
struct JobExit {
    job: String,
    assets: Vec<AssetIndex>,
    result: Result<()>,
}

/// Counters reported at the end of a run
#[derive(Default)]
struct Tally {
    downloaded: usize,
    skipped: usize,
    invocations: Vec<Invocation>,
}

/// State of one run's dispatch loop
struct Dispatch<'e, T: BuildTarget> {
    engine: &'e Engine,
    backoff: Backoff,
    target: Arc<T>,
    plan: Plan<T>,
    ledger: Ledger,
    scratch: ScratchRoot,
    cancel: CancellationToken,
    transfers: JoinSet<TransferExit>,
    jobs: JoinSet<JobExit>,
    tally: Tally,
}

impl<'e, T: BuildTarget> Dispatch<'e, T> {
    fn new(
        engine: &'e Engine,
        target: Arc<T>,
        plan: Plan<T>,
        scratch: ScratchRoot,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            backoff: Backoff::new(engine.config.retry.clone()),
            target,
            ledger: Ledger::new(&plan),
            plan,
            scratch,
            cancel,
            transfers: JoinSet::new(),
            jobs: JoinSet::new(),
            tally: Tally::default(),
        }
    }

    /// Run the loop until every task is done or the run aborts
    async fn drive(&mut self) -> Result<()> {
        for position in 0..self.plan.assets.len() {
            self.spawn_transfer(AssetIndex(position));
        }

        loop {
            if self.transfers.is_empty() && self.jobs.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return self.abort(Error::Cancelled).await;
                }
                Some(joined) = self.transfers.join_next(), if !self.transfers.is_empty() => {
                    if let Err(e) = self.on_transfer(joined) {
                        return self.abort(e).await;
                    }
                }
                Some(joined) = self.jobs.join_next(), if !self.jobs.is_empty() => {
                    if let Err(e) = self.on_job(joined) {
                        return self.abort(e).await;
                    }
                }
            }
        }

        if !self.ledger.all_ready() {
            return Err(Error::Other(
                "dispatch finished with assets that never became ready".to_string(),
            ));
        }
        Ok(())
    }

    fn spawn_transfer(&mut self, index: AssetIndex) {
        let attempt = self.ledger.start_transfer(index);
        self.engine
            .emit_event(Event::AssetDownloading { asset: index, attempt });

        let fetcher = Arc::clone(&self.engine.fetcher);
        let asset = self.plan.assets[index.get()].clone();
        let cancel = self.cancel.clone();
        debug!(asset = %index, attempt, url = %asset.locator(), "issuing transfer");

        self.transfers.spawn(async move {
            let result = fetcher.fetch(&asset, &cancel).await;
            TransferExit::Finished(index, result)
        });
    }

    fn schedule_retry(&mut self, index: AssetIndex, delay: Duration) {
        let cancel = self.cancel.clone();
        self.transfers.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => TransferExit::Finished(index, Err(Error::Cancelled)),
                _ = tokio::time::sleep(delay) => TransferExit::RetryDue(index),
            }
        });
    }

    fn on_transfer(&mut self, joined: std::result::Result<TransferExit, JoinError>) -> Result<()> {
        let exit = joined
            .map_err(|e| Error::Other(format!("transfer task failed: {}", e)))?;

        match exit {
            TransferExit::RetryDue(index) => {
                self.spawn_transfer(index);
                Ok(())
            }
            TransferExit::Finished(index, Ok(outcome)) => {
                self.on_ready(index, outcome);
                Ok(())
            }
            TransferExit::Finished(index, Err(e)) => self.on_transfer_error(index, e),
        }
    }

    fn on_ready(&mut self, index: AssetIndex, outcome: TransferOutcome) {
        let Some(due) = self.ledger.mark_ready(index) else {
            warn!(asset = %index, "asset reported ready twice, ignoring");
            return;
        };

        let skipped = outcome == TransferOutcome::AlreadyPresent;
        if skipped {
            self.tally.skipped += 1;
        } else {
            self.tally.downloaded += 1;
        }
        self.engine
            .emit_event(Event::AssetReady { asset: index, skipped });

        for firing in due {
            self.spawn_job(firing.job, firing.assets);
        }
    }

    fn on_transfer_error(&mut self, index: AssetIndex, e: Error) -> Result<()> {
        if e.is_cancelled() && self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let retries = self.ledger.retries(index);
        if e.is_retryable() {
            if self.backoff.allows(retries) {
                let retry = self.ledger.mark_retrying(index);
                let delay = self.backoff.delay(retry);
                warn!(
                    asset = %index,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient transfer failure, retrying"
                );
                self.engine.emit_event(Event::AssetRetrying {
                    asset: index,
                    retry,
                    delay_ms: delay.as_millis() as u64,
                    error: e.to_string(),
                });
                self.schedule_retry(index, delay);
                return Ok(());
            }
            warn!(asset = %index, retries, "retry limit reached");
        }

        error!(asset = %index, error = %e, "transfer failed");
        self.ledger.mark_failed(index);
        self.engine.emit_event(Event::AssetFailed {
            asset: index,
            error: e.to_string(),
        });
        Err(e)
    }

    fn spawn_job(&mut self, position: usize, assets: Vec<AssetIndex>) {
        let job = Arc::clone(&self.plan.jobs[position].job);
        let name = job.name().to_string();
        let scratch_dir = self.scratch.allocate(&name);

        info!(job = %name, assets = ?assets, scratch = ?scratch_dir, "launching job");
        self.engine.emit_event(Event::JobStarted {
            job: name.clone(),
            assets: assets.clone(),
        });
        self.tally.invocations.push(Invocation {
            job: name.clone(),
            assets: assets.clone(),
        });

        let invocation = JobInvocation {
            target: Arc::clone(&self.target),
            scratch_dir,
            assets: assets
                .iter()
                .map(|i| self.plan.assets[i.get()].clone())
                .collect(),
            cancel: self.cancel.clone(),
            extractor: Arc::clone(&self.engine.extractor),
        };

        self.jobs.spawn(async move {
            let result = run_job(job.as_ref(), invocation).await;
            JobExit {
                job: name,
                assets,
                result,
            }
        });
    }

    fn on_job(&mut self, joined: std::result::Result<JobExit, JoinError>) -> Result<()> {
        let exit = joined.map_err(|e| Error::Other(format!("job task failed: {}", e)))?;
        self.report_job(&exit);

        match exit.result {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() && self.cancel.is_cancelled() => Err(Error::Cancelled),
            Err(e) => Err(Error::job(exit.job, e)),
        }
    }

    fn report_job(&self, exit: &JobExit) {
        match &exit.result {
            Ok(()) => info!(job = %exit.job, assets = ?exit.assets, "job finished"),
            Err(e) if e.is_cancelled() => debug!(job = %exit.job, "job observed cancellation"),
            Err(e) => error!(job = %exit.job, error = %e, "job failed"),
        }
        self.engine.emit_event(Event::JobFinished {
            job: exit.job.clone(),
            assets: exit.assets.clone(),
            error: exit.result.as_ref().err().map(|e| e.to_string()),
        });
    }

    /// Cancel the run, wait for every task to unwind, and return `error`
    async fn abort(&mut self, error: Error) -> Result<()> {
        self.cancel.cancel();
        self.unwind().await;
        Err(error)
    }

    /// Await all outstanding tasks, aborting stragglers after the grace period
    async fn unwind(&mut self) {
        let grace = self.engine.config.dispatch.abort_grace;
        debug!(
            transfers = self.transfers.len(),
            jobs = self.jobs.len(),
            ?grace,
            "unwinding"
        );

        let drained = tokio::time::timeout(grace, async {
            while self.transfers.join_next().await.is_some() {}
            while let Some(joined) = self.jobs.join_next().await {
                if let Ok(exit) = joined {
                    self.report_job(&exit);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                transfers = self.transfers.len(),
                jobs = self.jobs.len(),
                "tasks did not unwind within the grace period, aborting them"
            );
            self.transfers.abort_all();
            self.jobs.abort_all();
            while self.transfers.join_next().await.is_some() {}
            while self.jobs.join_next().await.is_some() {}
        }
    }
}

/// Create the invocation's scratch directory and run the body, containing panics
async fn run_job<T: BuildTarget>(job: &dyn Job<T>, invocation: JobInvocation<T>) -> Result<()> {
    tokio::fs::create_dir(&invocation.scratch_dir).await?;

    match AssertUnwindSafe(job.execute(invocation)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(Error::Other(format!("job panicked: {}", message)))
        }
    }
}
