pub mod classifier;
mod engine;
pub mod executor;
pub mod grouper;
pub mod hasher;
pub mod planner;
pub mod progress;
pub mod report;
pub mod types;
pub mod walker;


pub use classifier::Classifier;
pub use engine::{CleanupEngine, PlannedRun};
pub use executor::{ExecutionReport, Executor, RemovedFile};
pub use grouper::DedupGrouper;
pub use hasher::{ContentHasher, HashOutcome};
pub use planner::{CleanupPlanner, PlanInputs};
pub use progress::{ProgressCallback, ProgressSnapshot, ProgressStage, ProgressTracker};
pub use report::{Reporter, RunEnvelope, RunResult};
pub use types::{
    CleanupAction, CleanupPlan, Classification, DeleteReason, DuplicateGroup, FileEntry, FileId,
    Fingerprint, IgnoreReason, SkipReason, TempReason,
};
pub use walker::{PathWalker, WalkOutput};
