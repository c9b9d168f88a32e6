//! Per-run dispatch ledger
//!
//! Owned by the dispatch loop and only mutated from it, so it needs no locking.

use crate::planner::Plan;
use crate::types::{AssetIndex, AssetState, BuildTarget, DispatchMode};

/// A job invocation the ledger decided is due
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Firing {
    /// Position of the job in the plan
    pub(crate) job: usize,
    /// Assets to pass, in need-set order
    pub(crate) assets: Vec<AssetIndex>,
}

/// Dispatch state of one planned job
#[derive(Clone, Debug)]
enum JobSlot {
    /// Fires once per asset; nothing to track
    Incremental,
    /// Fires once when `remaining` reaches zero
    Batch {
        needs: Vec<AssetIndex>,
        remaining: usize,
        fired: bool,
    },
}

pub(crate) struct Ledger {
    states: Vec<AssetState>,
    /// Transfers issued per asset
    attempts: Vec<u32>,
    /// Retries scheduled per asset
    retries: Vec<u32>,
    /// Jobs (by plan position) needing each asset
    dependents: Vec<Vec<usize>>,
    jobs: Vec<JobSlot>,
}

impl Ledger {
    pub(crate) fn new<T: BuildTarget>(plan: &Plan<T>) -> Self {
        let asset_count = plan.assets.len();
        let mut dependents = vec![Vec::new(); asset_count];
        let mut jobs = Vec::with_capacity(plan.jobs.len());

        for (position, planned) in plan.jobs.iter().enumerate() {
            for index in &planned.needs {
                dependents[index.get()].push(position);
            }
            jobs.push(match planned.mode() {
                DispatchMode::Incremental => JobSlot::Incremental,
                DispatchMode::Batch => JobSlot::Batch {
                    needs: planned.needs.clone(),
                    remaining: planned.needs.len(),
                    fired: false,
                },
            });
        }

        Self {
            states: vec![AssetState::Pending; asset_count],
            attempts: vec![0; asset_count],
            retries: vec![0; asset_count],
            dependents,
            jobs,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self, asset: AssetIndex) -> AssetState {
        self.states[asset.get()]
    }

    /// Record that a transfer was issued; returns its attempt number (1-based)
    pub(crate) fn start_transfer(&mut self, asset: AssetIndex) -> u32 {
        let i = asset.get();
        self.states[i] = AssetState::Downloading;
        self.attempts[i] += 1;
        self.attempts[i]
    }

    /// Record a scheduled retry; returns the retry number (1-based)
    pub(crate) fn mark_retrying(&mut self, asset: AssetIndex) -> u32 {
        let i = asset.get();
        self.states[i] = AssetState::Retrying;
        self.retries[i] += 1;
        self.retries[i]
    }

    pub(crate) fn mark_failed(&mut self, asset: AssetIndex) {
        self.states[asset.get()] = AssetState::Failed;
    }

    /// Retries scheduled so far for `asset`
    pub(crate) fn retries(&self, asset: AssetIndex) -> u32 {
        self.retries[asset.get()]
    }

    /// Retries scheduled across all assets
    pub(crate) fn total_retries(&self) -> u32 {
        self.retries.iter().sum()
    }

    /// Mark `asset` ready and return the invocations that became due, in plan order
    ///
    /// Returns `None` if the asset was already ready; an asset never triggers
    /// dispatch twice.
    pub(crate) fn mark_ready(&mut self, asset: AssetIndex) -> Option<Vec<Firing>> {
        let i = asset.get();
        if self.states[i] == AssetState::Ready {
            return None;
        }
        self.states[i] = AssetState::Ready;

        let mut due = Vec::new();
        for &position in &self.dependents[i] {
            match &mut self.jobs[position] {
                JobSlot::Incremental => due.push(Firing {
                    job: position,
                    assets: vec![asset],
                }),
                JobSlot::Batch {
                    needs,
                    remaining,
                    fired,
                } => {
                    *remaining = remaining.saturating_sub(1);
                    if *remaining == 0 && !*fired {
                        *fired = true;
                        due.push(Firing {
                            job: position,
                            assets: needs.clone(),
                        });
                    }
                }
            }
        }
        Some(due)
    }

    pub(crate) fn all_ready(&self) -> bool {
        self.states.iter().all(|s| *s == AssetState::Ready)
    }
}
