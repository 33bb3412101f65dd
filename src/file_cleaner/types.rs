use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Device + inode pair (or the platform's closest equivalent).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId {
    pub dev: u64,
    pub ino: u64,
}

impl FileId {
    #[cfg(unix)]
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(FileId {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    #[cfg(not(unix))]
    pub fn from_metadata(_metadata: &std::fs::Metadata) -> Option<Self> {
        None
    }
}

/// Snapshot of one regular file taken during the walk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    /// Path relative to the scan root.
    pub relative: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
    pub id: Option<FileId>,
    pub links: u64,
}

impl FileEntry {
    pub fn from_metadata(path: PathBuf, relative: PathBuf, metadata: &std::fs::Metadata) -> Self {
        FileEntry {
            path,
            relative,
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            id: FileId::from_metadata(metadata),
            links: link_count(metadata),
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

#[cfg(unix)]
fn link_count(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.nlink()
}

#[cfg(not(unix))]
fn link_count(_metadata: &std::fs::Metadata) -> u64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "rule", content = "value", rename_all = "snake_case")]
pub enum TempReason {
    Extension(String),
    Pattern(String),
}

impl fmt::Display for TempReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TempReason::Extension(ext) => write!(f, "extension:{}", ext),
            TempReason::Pattern(label) => write!(f, "pattern:{}", label),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", content = "value", rename_all = "snake_case")]
pub enum IgnoreReason {
    TooSmall,
    TooLarge,
    ExcludedPath(String),
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::TooSmall => f.write_str("too-small"),
            IgnoreReason::TooLarge => f.write_str("too-large"),
            IgnoreReason::ExcludedPath(pattern) => write!(f, "excluded-path:{}", pattern),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum Classification {
    Temporary(TempReason),
    DuplicateCandidate,
    Ignored(IgnoreReason),
}

/// Content identity: equal size and equal SHA-256 digest are treated as equal bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint {
    pub size: u64,
    pub digest: [u8; 32],
}

impl Fingerprint {
    pub fn hex(&self) -> String {
        self.digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.size, self.hex())
    }
}

/// Files sharing one fingerprint. `members[0]` is the file to keep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub fingerprint: Fingerprint,
    pub members: Vec<FileEntry>,
}

impl DuplicateGroup {
    pub fn keep(&self) -> &FileEntry {
        &self.members[0]
    }

    pub fn duplicates(&self) -> &[FileEntry] {
        &self.members[1..]
    }

    pub fn reclaimable_bytes(&self) -> u64 {
        self.fingerprint.size * self.duplicates().len() as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DeleteReason {
    Temporary(TempReason),
    DuplicateOf(PathBuf),
}

impl fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeleteReason::Temporary(_) => f.write_str("temporary"),
            DeleteReason::DuplicateOf(kept) => write!(f, "duplicate-of:{}", kept.display()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    KeptOriginal,
    UniqueContent,
    Ignored(IgnoreReason),
    HardLinkOf(PathBuf),
    Unreadable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::KeptOriginal => f.write_str("kept-original"),
            SkipReason::UniqueContent => f.write_str("unique-content"),
            SkipReason::Ignored(reason) => write!(f, "ignored:{}", reason),
            SkipReason::HardLinkOf(path) => write!(f, "hard-link-of:{}", path.display()),
            SkipReason::Unreadable => f.write_str("unreadable"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CleanupAction {
    Delete { entry: FileEntry, reason: DeleteReason },
    Skip { entry: FileEntry, reason: SkipReason },
}

impl CleanupAction {
    pub fn entry(&self) -> &FileEntry {
        match self {
            CleanupAction::Delete { entry, .. } | CleanupAction::Skip { entry, .. } => entry,
        }
    }

    pub fn path(&self) -> &Path {
        &self.entry().path
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, CleanupAction::Delete { .. })
    }

    pub fn reason_label(&self) -> String {
        match self {
            CleanupAction::Delete { reason, .. } => reason.to_string(),
            CleanupAction::Skip { reason, .. } => reason.to_string(),
        }
    }
}

/// Ordered, deterministic list of actions. Nothing outside it is ever touched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanupPlan {
    pub root: PathBuf,
    pub actions: Vec<CleanupAction>,
}

impl CleanupPlan {
    pub fn deletions(&self) -> impl Iterator<Item = &CleanupAction> {
        self.actions.iter().filter(|a| a.is_delete())
    }

    pub fn delete_count(&self) -> usize {
        self.deletions().count()
    }

    /// Storage the plan releases. A multi-link inode counts once, and only when
    /// every one of its links is planned for deletion.
    pub fn bytes_to_free(&self) -> u64 {
        let mut ledger = ReclaimLedger::default();
        self.deletions().map(|a| ledger.release(a.entry())).sum()
    }

    pub fn action_for(&self, path: &Path) -> Option<&CleanupAction> {
        self.actions.iter().find(|a| a.path() == path)
    }
}

/// Counts removed links per inode so shared storage is only credited when its
/// last link goes.
#[derive(Debug, Default)]
pub struct ReclaimLedger {
    removed: HashMap<FileId, u64>,
}

impl ReclaimLedger {
    /// Bytes released by removing `entry`, given the links removed before it.
    pub fn release(&mut self, entry: &FileEntry) -> u64 {
        match entry.id {
            Some(id) if entry.links > 1 => {
                let gone = self.removed.entry(id).or_insert(0);
                *gone += 1;
                if *gone == entry.links {
                    entry.size
                } else {
                    0
                }
            }
            _ => entry.size,
        }
    }
}
