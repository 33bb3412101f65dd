pub mod config;
pub mod error;
mod file_cleaner;
pub mod ops;

pub use config::{
    load_temp_rules, CleanupConfig, CompiledConfig, DeletionMode, HardLinkPolicy, KeepStrategy,
    TempPattern, TempRules,
};
pub use error::{
    ConfigError, EngineError, EntryError, EntryErrorKind, ErrorKind, SetupError, Stage,
};
pub use file_cleaner::{
    classifier, executor, grouper, hasher, planner, progress, report, types, walker,
};
pub use file_cleaner::{
    CleanupAction, CleanupEngine, CleanupPlan, Classification, Classifier, ContentHasher,
    DedupGrouper, DuplicateGroup, ExecutionReport, Executor, FileEntry, Fingerprint, PathWalker,
    PlannedRun, ProgressCallback, ProgressSnapshot, ProgressStage, RemovedFile, RunEnvelope,
    RunResult,
};
pub use ops::{RunRegistry, RunTicket};
