use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::task;
use tokio_util::sync::CancellationToken;

use super::classifier::Classifier;
use super::executor::Executor;
use super::grouper::DedupGrouper;
use super::hasher::ContentHasher;
use super::planner::{CleanupPlanner, PlanInputs};
use super::progress::{ProgressCallback, ProgressSnapshot, ProgressStage, ProgressTracker};
use super::report::{Reporter, RunResult};
use super::types::{Classification, CleanupPlan, DuplicateGroup};
use super::walker::{PathWalker, WalkOutput};
use crate::config::{CleanupConfig, CompiledConfig};
use crate::error::{ConfigError, EngineError, EntryError, EntryErrorKind, SetupError, Stage};

/// Runs the scan, classify, dedup and cleanup pipeline for one root at a time.
///
/// Planning and execution are separate steps: [`CleanupEngine::plan`] never
/// mutates the filesystem, and [`CleanupEngine::execute`] only touches files
/// listed in the plan it is given.
pub struct CleanupEngine {
    config: CompiledConfig,
    callback: Option<ProgressCallback>,
}

/// A plan awaiting approval, together with the partial run summary.
pub struct PlannedRun {
    plan: CleanupPlan,
    groups: Vec<DuplicateGroup>,
    reporter: Reporter,
    progress: ProgressTracker,
    cancelled: bool,
}

impl PlannedRun {
    pub fn plan(&self) -> &CleanupPlan {
        &self.plan
    }

    pub fn groups(&self) -> &[DuplicateGroup] {
        &self.groups
    }

    pub fn run_id(&self) -> &str {
        self.reporter.run_id()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// Finish without executing anything.
    pub fn into_result(self) -> RunResult {
        self.progress.set_stage(ProgressStage::Done);
        let mut reporter = self.reporter;
        if self.cancelled {
            reporter.mark_cancelled();
        }
        reporter.finish()
    }
}

impl CleanupEngine {
    pub fn new(config: &CleanupConfig) -> Result<Self, EngineError> {
        Ok(Self::from_compiled(config.compile()?))
    }

    pub fn from_compiled(config: CompiledConfig) -> Self {
        Self {
            config,
            callback: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn config(&self) -> &CompiledConfig {
        &self.config
    }

    /// Plan and, unless this is a dry run, execute.
    pub async fn run(
        &self,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<RunResult, EngineError> {
        let planned = self.plan(root, cancel).await?;
        Ok(self.execute(planned, cancel).await)
    }

    pub async fn plan(
        &self,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<PlannedRun, EngineError> {
        let root = resolve_root(root)?;
        self.check_staging(&root)?;

        let settings = self.config.settings();
        let progress = ProgressTracker::new(self.callback.clone());
        let mut reporter = Reporter::start(&root, settings.dry_run);
        log::info!("Run {} scanning {}", reporter.run_id(), root.display());

        progress.set_stage(ProgressStage::Walking);
        let walk = self.walk(&root, &progress, cancel).await;
        let mut cancelled = walk.cancelled;
        log::info!(
            "Walk finished: {} files, {} errors",
            walk.entries.len(),
            walk.errors.len()
        );
        reporter.record_walk(walk.entries.len(), walk.errors);

        let classifier = Classifier::new(&self.config);
        let mut inputs = PlanInputs::default();
        let mut candidates = Vec::new();
        for entry in walk.entries {
            let classification = classifier.classify(&entry);
            reporter.record_classification(&classification);
            match classification {
                Classification::Temporary(reason) => inputs.temporaries.push((entry, reason)),
                Classification::DuplicateCandidate => candidates.push(entry),
                Classification::Ignored(reason) => inputs.ignored.push((entry, reason)),
            }
        }

        let grouper = DedupGrouper::new(settings.keep_strategy);
        let mut groups = Vec::new();
        if !cancelled {
            progress.set_stage(ProgressStage::Hashing);
            let outcome = ContentHasher::new(&self.config)
                .with_progress(progress.clone())
                .hash_candidates(candidates, cancel)
                .await;
            cancelled |= outcome.cancelled;

            groups = grouper.group(outcome.fingerprinted.iter().cloned());
            let grouped: HashSet<&Path> = groups
                .iter()
                .flat_map(|g| g.members.iter().map(|m| m.path.as_path()))
                .collect();
            // Fully hashed but without a twin.
            let lonely: Vec<_> = outcome
                .fingerprinted
                .iter()
                .filter(|(entry, _)| !grouped.contains(entry.path.as_path()))
                .map(|(entry, _)| entry.clone())
                .collect();

            inputs.unique = outcome.unique;
            inputs.unique.extend(lonely);
            inputs.hard_links = outcome.hard_links;
            for (entry, err) in outcome.failed {
                inputs.unreadable.push(entry);
                reporter.record_errors([err]);
            }
        }
        inputs.groups = groups.clone();

        progress.set_stage(ProgressStage::Planning);
        let plan = CleanupPlanner::new(&grouper).plan(&root, inputs);
        reporter.record_plan(&plan);

        Ok(PlannedRun {
            plan,
            groups,
            reporter,
            progress,
            cancelled,
        })
    }

    /// Apply an approved plan. Dry runs and cancelled plans return without touching anything.
    pub async fn execute(&self, planned: PlannedRun, cancel: &CancellationToken) -> RunResult {
        if planned.cancelled || cancel.is_cancelled() {
            log::info!("Run {} cancelled before execution", planned.run_id());
            let mut planned = planned;
            planned.cancelled = true;
            return planned.into_result();
        }
        if self.config.settings().dry_run {
            log::info!(
                "Dry run {}: {} files would be removed",
                planned.run_id(),
                planned.plan.delete_count()
            );
            return planned.into_result();
        }

        let PlannedRun {
            plan,
            mut reporter,
            progress,
            ..
        } = planned;
        progress.set_stage(ProgressStage::Executing);
        let report = Executor::new(&self.config)
            .with_progress(progress.clone())
            .execute(&plan, cancel)
            .await;
        reporter.record_execution(report);
        progress.set_stage(ProgressStage::Done);

        let result = reporter.finish();
        log::info!(
            "Run {} finished: {} removed, {} bytes freed, {} errors",
            result.run_id,
            result.files_deleted,
            result.bytes_freed,
            result.errors.len()
        );
        result
    }

    async fn walk(
        &self,
        root: &Path,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> WalkOutput {
        let config = self.config.clone();
        let owned_root = root.to_path_buf();
        let progress = progress.clone();
        let token = cancel.clone();
        let job = task::spawn_blocking(move || {
            PathWalker::new(&owned_root, &config)
                .with_progress(progress)
                .collect(&token)
        });
        match job.await {
            Ok(output) => output,
            Err(err) => {
                log::warn!("Walk task failed for {}: {}", root.display(), err);
                WalkOutput {
                    errors: vec![EntryError::new(
                        root,
                        Stage::Walk,
                        EntryErrorKind::Io,
                        err.to_string(),
                    )],
                    ..WalkOutput::default()
                }
            }
        }
    }

    fn check_staging(&self, root: &Path) -> Result<(), ConfigError> {
        if let Some(staging) = self.config.staging_root() {
            let resolved = fs::canonicalize(staging).unwrap_or_else(|_| staging.to_path_buf());
            if resolved == root {
                return Err(ConfigError::StagingIsRoot(resolved));
            }
        }
        Ok(())
    }
}

/// Canonicalise the root and confirm it is a readable directory.
fn resolve_root(root: &Path) -> Result<PathBuf, SetupError> {
    let canonical = fs::canonicalize(root).map_err(|err| setup_error(root, err))?;
    let metadata = fs::metadata(&canonical).map_err(|err| setup_error(root, err))?;
    if !metadata.is_dir() {
        return Err(SetupError::RootNotDirectory(root.to_path_buf()));
    }
    fs::read_dir(&canonical).map_err(|err| setup_error(root, err))?;
    Ok(canonical)
}

fn setup_error(root: &Path, err: std::io::Error) -> SetupError {
    match err.kind() {
        ErrorKind::NotFound => SetupError::RootNotFound(root.to_path_buf()),
        ErrorKind::PermissionDenied => SetupError::RootPermissionDenied(root.to_path_buf()),
        _ => SetupError::RootUnreadable {
            path: root.to_path_buf(),
            source: err,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeletionMode;
    use crate::error::ErrorKind as RunErrorKind;
    use tempfile::TempDir;

    fn permanent() -> CleanupConfig {
        CleanupConfig {
            deletion_mode: DeletionMode::Permanent,
            ..CleanupConfig::default()
        }
    }

    #[tokio::test]
    async fn missing_root_is_a_setup_error() {
        let dir = TempDir::new().unwrap();
        let engine = CleanupEngine::new(&permanent()).unwrap();
        let err = engine
            .run(&dir.path().join("nope"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), RunErrorKind::RootNotFound);
    }

    #[tokio::test]
    async fn file_root_is_not_a_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("file"), b"x").unwrap();
        let engine = CleanupEngine::new(&permanent()).unwrap();
        let err = engine
            .run(&dir.path().join("file"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), RunErrorKind::RootNotDirectory);
    }

    #[tokio::test]
    async fn staging_at_root_is_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = CleanupEngine::new(&CleanupConfig {
            staging_root: Some(dir.path().to_path_buf()),
            ..CleanupConfig::default()
        })
        .unwrap();
        let err = engine
            .plan(dir.path(), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), RunErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn plan_does_not_touch_the_filesystem() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.tmp"), b"0123456789").unwrap();
        let engine = CleanupEngine::new(&permanent()).unwrap();
        let planned = engine.plan(dir.path(), &CancellationToken::new()).await.unwrap();
        assert_eq!(planned.plan().delete_count(), 1);
        assert!(dir.path().join("a.tmp").exists());

        let result = engine.execute(planned, &CancellationToken::new()).await;
        assert_eq!(result.files_deleted, 1);
        assert!(!dir.path().join("a.tmp").exists());
    }
}
