use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal failures. Only these abort a run; everything per-file is an [`EntryError`].
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("setup error: {0}")]
    Setup(#[from] SetupError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Setup(SetupError::RootNotFound(_)) => ErrorKind::RootNotFound,
            EngineError::Setup(SetupError::RootNotDirectory(_)) => ErrorKind::RootNotDirectory,
            EngineError::Setup(SetupError::RootPermissionDenied(_)) => ErrorKind::PermissionDenied,
            EngineError::Setup(SetupError::RootUnreadable { .. }) => ErrorKind::RootUnreadable,
            EngineError::Config(_) => ErrorKind::InvalidConfig,
        }
    }
}

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("root path does not exist: {}", .0.display())]
    RootNotFound(PathBuf),

    #[error("root path is not a directory: {}", .0.display())]
    RootNotDirectory(PathBuf),

    #[error("no read permission on root: {}", .0.display())]
    RootPermissionDenied(PathBuf),

    #[error("cannot read root {}: {source}", path.display())]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid glob pattern '{pattern}': {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("min_size ({min}) is greater than max_size ({max})")]
    InvalidSize { min: u64, max: u64 },

    #[error("worker pool size must be at least 1")]
    ZeroWorkers,

    #[error("io_timeout_ms must be greater than zero")]
    ZeroTimeout,

    #[error("partial_hash_bytes must be greater than zero")]
    ZeroPartialWindow,

    #[error("staging root must not be the scan root: {}", .0.display())]
    StagingIsRoot(PathBuf),

    #[error("staging root could not be determined; set staging_root explicitly")]
    NoStagingRoot,

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read configuration {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Fixed set of error kinds surfaced to calling layers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RootNotFound,
    RootNotDirectory,
    PermissionDenied,
    RootUnreadable,
    InvalidConfig,
}

/// Which pipeline stage produced an [`EntryError`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Walk,
    Hash,
    Execute,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Walk => "walk",
            Stage::Hash => "hash",
            Stage::Execute => "execute",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryErrorKind {
    PermissionDenied,
    NotFound,
    /// File changed between scan and action (size, mtime or type).
    Changed,
    /// The single attempt did not finish in time. The blocking thread cannot be
    /// stopped, so an execute-stage timeout may still have removed the file.
    TimedOut,
    SymlinkCycle,
    Io,
}

/// Non-fatal, per-file failure. Accumulated in the run result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryError {
    pub path: PathBuf,
    pub stage: Stage,
    pub kind: EntryErrorKind,
    pub message: String,
}

impl EntryError {
    pub fn new(
        path: impl Into<PathBuf>,
        stage: Stage,
        kind: EntryErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            stage,
            kind,
            message: message.into(),
        }
    }

    pub fn from_io(path: &Path, stage: Stage, err: &io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::PermissionDenied => EntryErrorKind::PermissionDenied,
            io::ErrorKind::NotFound => EntryErrorKind::NotFound,
            io::ErrorKind::TimedOut => EntryErrorKind::TimedOut,
            _ => EntryErrorKind::Io,
        };
        Self::new(path, stage, kind, err.to_string())
    }

    pub fn timed_out(path: &Path, stage: Stage) -> Self {
        Self::new(path, stage, EntryErrorKind::TimedOut, "operation timed out")
    }

    pub fn changed(path: &Path, message: impl Into<String>) -> Self {
        Self::new(path, Stage::Execute, EntryErrorKind::Changed, message)
    }
}

impl fmt::Display for EntryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.stage, self.path.display(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_entry_kinds() {
        let path = Path::new("/tmp/x");
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        let missing = io::Error::new(io::ErrorKind::NotFound, "gone");
        let other = io::Error::new(io::ErrorKind::Other, "boom");

        assert_eq!(
            EntryError::from_io(path, Stage::Hash, &denied).kind,
            EntryErrorKind::PermissionDenied
        );
        assert_eq!(
            EntryError::from_io(path, Stage::Walk, &missing).kind,
            EntryErrorKind::NotFound
        );
        assert_eq!(
            EntryError::from_io(path, Stage::Execute, &other).kind,
            EntryErrorKind::Io
        );
    }

    #[test]
    fn engine_error_kinds_are_stable() {
        let err: EngineError = SetupError::RootNotFound(PathBuf::from("/missing")).into();
        assert_eq!(err.kind(), ErrorKind::RootNotFound);

        let err: EngineError = ConfigError::ZeroWorkers.into();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }
}
