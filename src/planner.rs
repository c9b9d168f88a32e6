//! Planner: turns a build target and candidate jobs into a download plan
//!
//! Assets are deduplicated by locator so that two jobs needing the same remote
//! file share one [`Asset`] (and one download). Jobs whose prerequisites do not
//! exist for the target are left out; prerequisites that contradict each other
//! fail the whole plan before anything is downloaded.

use crate::error::PlanError;
use crate::job::{Job, Needs};
use crate::types::{Asset, AssetIndex, AssetSpec, BuildTarget, DispatchMode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// A job that made it into the plan, with the assets it needs
pub struct PlannedJob<T: BuildTarget> {
    /// The job itself
    pub job: Arc<dyn Job<T>>,
    /// Needed assets, in the order the job declared them (no duplicates)
    pub needs: Vec<AssetIndex>,
}

impl<T: BuildTarget> PlannedJob<T> {
    /// Job name
    pub fn name(&self) -> &str {
        self.job.name()
    }

    /// Job dispatch mode
    pub fn mode(&self) -> DispatchMode {
        self.job.mode()
    }
}

/// A job left out of the plan
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedJob {
    /// Job name
    pub job: String,
    /// Why it was left out
    pub reason: String,
}

/// The planner's output
///
/// Every index in a job's need-set refers to an entry of `assets`.
pub struct Plan<T: BuildTarget> {
    /// Deduplicated assets; `assets[i].index == AssetIndex(i)`
    pub assets: Vec<Asset>,
    /// Jobs to dispatch
    pub jobs: Vec<PlannedJob<T>>,
    /// Jobs left out because their prerequisites are unavailable
    pub skipped: Vec<SkippedJob>,
}

impl<T: BuildTarget> Plan<T> {
    /// Look up an asset by index
    pub fn asset(&self, index: AssetIndex) -> Option<&Asset> {
        self.assets.get(index.get())
    }
}

/// Builds plans against a download directory
#[derive(Clone, Debug)]
pub struct Planner {
    download_dir: PathBuf,
}

impl Planner {
    /// Create a planner placing assets under `download_dir`
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
        }
    }

    /// Directory assets are placed in
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Plan a run of `jobs` for `target`
    ///
    /// Returns an error if any job's prerequisites are contradictory; in that
    /// case nothing may be downloaded or dispatched.
    pub fn plan<T: BuildTarget>(
        &self,
        target: &T,
        jobs: &[Arc<dyn Job<T>>],
    ) -> Result<Plan<T>, PlanError> {
        let mut builder = AssetTable::new(&self.download_dir);
        let mut planned = Vec::new();
        let mut skipped = Vec::new();

        for job in jobs {
            let name = job.name();
            let specs = match job.needs(target) {
                Needs::Assets(specs) if specs.is_empty() => {
                    info!(job = name, "job does not apply to this target, skipping");
                    skipped.push(SkippedJob {
                        job: name.to_string(),
                        reason: "no assets needed for this target".to_string(),
                    });
                    continue;
                }
                Needs::Assets(specs) => specs,
                Needs::Unavailable(reason) => {
                    info!(job = name, reason = %reason, "prerequisites unavailable, skipping job");
                    skipped.push(SkippedJob {
                        job: name.to_string(),
                        reason,
                    });
                    continue;
                }
                Needs::Contradiction(reason) => {
                    warn!(job = name, reason = %reason, "job reported contradictory prerequisites");
                    return Err(PlanError::Contradiction {
                        job: name.to_string(),
                        reason,
                    });
                }
            };

            let mut needs: Vec<AssetIndex> = Vec::with_capacity(specs.len());
            for spec in specs {
                let index = builder.intern(name, spec)?;
                if needs.contains(&index) {
                    debug!(job = name, asset = %index, "asset listed twice by the same job");
                    continue;
                }
                needs.push(index);
            }

            debug!(job = name, mode = ?job.mode(), assets = ?needs, "job planned");
            planned.push(PlannedJob {
                job: Arc::clone(job),
                needs,
            });
        }

        let assets = builder.into_assets();
        info!(
            build_target = %target.identity(),
            assets = assets.len(),
            jobs = planned.len(),
            skipped = skipped.len(),
            "plan ready"
        );

        Ok(Plan {
            assets,
            jobs: planned,
            skipped,
        })
    }
}

/// Deduplicating asset table used while planning
struct AssetTable<'a> {
    download_dir: &'a Path,
    assets: Vec<Asset>,
    by_locator: HashMap<Url, AssetIndex>,
    by_file_name: HashMap<String, AssetIndex>,
}

impl<'a> AssetTable<'a> {
    fn new(download_dir: &'a Path) -> Self {
        Self {
            download_dir,
            assets: Vec::new(),
            by_locator: HashMap::new(),
            by_file_name: HashMap::new(),
        }
    }

    /// Index of the asset for `spec`, adding it if it is new
    fn intern(&mut self, job: &str, spec: AssetSpec) -> Result<AssetIndex, PlanError> {
        let contradiction = |reason: String| PlanError::Contradiction {
            job: job.to_string(),
            reason,
        };

        if !is_plain_file_name(&spec.file_name) {
            return Err(contradiction(format!(
                "'{}' is not a plain file name",
                spec.file_name
            )));
        }

        if let Some(&index) = self.by_locator.get(&spec.locator) {
            let existing = &mut self.assets[index.get()].spec;
            if existing.file_name != spec.file_name {
                return Err(contradiction(format!(
                    "{} requested as both '{}' and '{}'",
                    spec.locator, existing.file_name, spec.file_name
                )));
            }
            merge_field(&mut existing.version, spec.version, "version", &spec.locator)
                .map_err(&contradiction)?;
            merge_field(&mut existing.sha256, spec.sha256, "sha256", &spec.locator)
                .map_err(&contradiction)?;
            merge_field(&mut existing.format, spec.format, "format", &spec.locator)
                .map_err(&contradiction)?;
            return Ok(index);
        }

        if let Some(&index) = self.by_file_name.get(&spec.file_name) {
            return Err(contradiction(format!(
                "'{}' would be downloaded from both {} and {}",
                spec.file_name,
                self.assets[index.get()].spec.locator,
                spec.locator
            )));
        }

        let index = AssetIndex(self.assets.len());
        self.by_locator.insert(spec.locator.clone(), index);
        self.by_file_name.insert(spec.file_name.clone(), index);
        self.assets.push(Asset {
            index,
            destination: self.download_dir.join(&spec.file_name),
            spec,
        });
        Ok(index)
    }

    fn into_assets(self) -> Vec<Asset> {
        self.assets
    }
}

/// Fill in `existing` from `incoming`; two different declared values contradict
fn merge_field<V: PartialEq + std::fmt::Debug>(
    existing: &mut Option<V>,
    incoming: Option<V>,
    field: &str,
    locator: &Url,
) -> Result<(), String> {
    match (existing.as_ref(), incoming) {
        (Some(a), Some(b)) if *a != b => Err(format!(
            "conflicting {} for {}: {:?} vs {:?}",
            field, locator, a, b
        )),
        (None, Some(b)) => {
            *existing = Some(b);
            Ok(())
        }
        _ => Ok(()),
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.ends_with(crate::utils::PARTIAL_SUFFIX)
        && !name.ends_with(crate::extraction::PAYLOAD_SUFFIX)
}
