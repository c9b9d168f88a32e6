//! # release-miner
//!
//! Dependency-gated acquisition and dispatch engine for mining large,
//! versioned software releases.
//!
//! ## Design Philosophy
//!
//! release-miner is designed to be:
//! - **Declarative** - Jobs state which remote assets they need; the engine works out the rest
//! - **Download-once** - Assets shared by several jobs are fetched a single time
//! - **Eager** - A job fires the moment its assets are on disk, not when the whole plan is
//! - **Leak-free** - Every run cleans up its scratch space and awaits every task it started
//!
//! ## Quick Start
//!
//! ```no_run
//! use async_trait::async_trait;
//! use release_miner::{Config, Engine, Job, JobInvocation, Needs, Result};
//! use release_miner::types::{AssetSpec, BuildTarget, DispatchMode};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Release(&'static str);
//!
//! impl BuildTarget for Release {
//!     fn identity(&self) -> String {
//!         self.0.to_string()
//!     }
//! }
//!
//! struct Docs;
//!
//! #[async_trait]
//! impl Job<Release> for Docs {
//!     fn name(&self) -> &str {
//!         "docs"
//!     }
//!
//!     fn mode(&self) -> DispatchMode {
//!         DispatchMode::Batch
//!     }
//!
//!     fn needs(&self, target: &Release) -> Needs {
//!         let url = format!("https://download.example.com/{}/Docs.pkg", target.0);
//!         match url.parse() {
//!             Ok(locator) => Needs::Assets(vec![AssetSpec::new(locator, "Docs.pkg")]),
//!             Err(e) => Needs::Unavailable(e.to_string()),
//!         }
//!     }
//!
//!     async fn execute(&self, invocation: JobInvocation<Release>) -> Result<()> {
//!         println!("docs ready at {:?}", invocation.local_paths());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new(Config::default())?;
//!
//!     // Subscribe to events
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let jobs: Vec<Arc<dyn Job<Release>>> = vec![Arc::new(Docs)];
//!     let report = engine
//!         .run(Arc::new(Release("2022.3.1f1")), &jobs, &CancellationToken::new())
//!         .await?;
//!     println!("{} invocations", report.invocations.len());
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Run engine: dispatch loop, ledger and scratch lifecycle
pub mod dispatcher;
/// Error types
pub mod error;
/// Staged archive extraction
pub mod extraction;
/// Job interface
pub mod job;
/// Download planning
pub mod planner;
/// Transient failure classification and backoff
pub mod retry;
/// Bounded transfer service
pub mod transfer;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use dispatcher::{Engine, ScratchRoot};
pub use error::{Error, ExtractionError, PlanError, Result, TransferError};
pub use extraction::{ArchiveTool, CliArchiveTool, PathFilter, StagedExtractor};
pub use job::{Job, JobInvocation, Needs};
pub use planner::{Plan, PlannedJob, Planner};
pub use transfer::{Fetcher, HttpTransfer, TransferOutcome};
pub use types::{
    ArchiveFormat, Asset, AssetIndex, AssetSpec, BuildTarget, DispatchMode, Event, RunReport,
};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Helper function to run the engine with graceful signal handling.
///
/// Runs `jobs` for `target` and cancels the run when a termination signal
/// arrives. The run then unwinds as it would for any other cancellation and
/// this function returns [`Error::Cancelled`].
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use release_miner::{Config, Engine, Job, run_with_shutdown};
/// # use release_miner::types::BuildTarget;
/// # struct Release;
/// # impl BuildTarget for Release { fn identity(&self) -> String { "r".into() } }
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = Engine::new(Config::default())?;
///     let jobs: Vec<Arc<dyn Job<Release>>> = Vec::new();
///
///     // Run with automatic signal handling
///     let report = run_with_shutdown(&engine, Arc::new(Release), &jobs).await?;
///     println!("{} assets", report.assets);
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown<T: BuildTarget>(
    engine: &Engine,
    target: Arc<T>,
    jobs: &[Arc<dyn Job<T>>],
) -> Result<RunReport> {
    let cancel = CancellationToken::new();
    let run = engine.run(target, jobs, &cancel);
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => return result,
        signal = shutdown_signal() => {
            tracing::info!(signal, "shutdown requested, cancelling run");
            cancel.cancel();
        }
    }

    run.await
}

/// Resolve once the process is asked to stop, yielding the signal's name
///
/// If no handler can be registered this never resolves, so a broken signal
/// setup cannot cancel a run by itself.
#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{Signal, SignalKind, signal};

    fn listen(kind: SignalKind, name: &'static str) -> Option<Signal> {
        signal(kind)
            .map_err(|e| {
                tracing::warn!(error = %e, signal = name, "could not register signal handler");
            })
            .ok()
    }

    async fn received(signal: Option<Signal>) {
        match signal {
            Some(mut s) => {
                s.recv().await;
            }
            None => std::future::pending().await,
        }
    }

    let sigterm = listen(SignalKind::terminate(), "SIGTERM");
    let sigint = listen(SignalKind::interrupt(), "SIGINT");
    if sigterm.is_none() && sigint.is_none() {
        tracing::error!("no signal handlers registered, falling back to ctrl_c");
        return ctrl_c().await;
    }

    tokio::select! {
        _ = received(sigterm) => "SIGTERM",
        _ = received(sigint) => "SIGINT",
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    "Ctrl+C"
}
