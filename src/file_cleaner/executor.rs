use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::task;
use tokio_util::sync::CancellationToken;

use super::progress::ProgressTracker;
use super::types::{CleanupAction, CleanupPlan, DeleteReason, FileEntry, ReclaimLedger};
use crate::config::{CompiledConfig, DeletionMode};
use crate::error::{EntryError, EntryErrorKind, Stage};

/// One file the executor actually removed from the scan tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemovedFile {
    pub path: PathBuf,
    pub size: u64,
    pub reason: String,
    /// Where the file now lives when running in staged mode.
    pub staged_to: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub removed: Vec<RemovedFile>,
    /// Storage released; a hard-linked inode counts once its last link is gone.
    pub freed: u64,
    /// A `TimedOut` error here means the outcome is unknown: the blocking job keeps
    /// running and may still have removed the file.
    pub errors: Vec<EntryError>,
    pub cancelled: bool,
}

impl ExecutionReport {
    pub fn bytes_freed(&self) -> u64 {
        self.freed
    }
}

/// Applies an approved plan, one deletion at a time, in plan order.
pub struct Executor {
    mode: DeletionMode,
    staging_root: Option<PathBuf>,
    io_timeout: Duration,
    progress: ProgressTracker,
}

impl Executor {
    pub fn new(config: &CompiledConfig) -> Self {
        Self {
            mode: config.settings().deletion_mode,
            staging_root: config.staging_root().map(Path::to_path_buf),
            io_timeout: config.io_timeout(),
            progress: ProgressTracker::default(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    pub async fn execute(&self, plan: &CleanupPlan, cancel: &CancellationToken) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        let mut ledger = ReclaimLedger::default();

        for action in &plan.actions {
            let CleanupAction::Delete { entry, reason } = action else {
                continue;
            };
            if cancel.is_cancelled() {
                log::info!("Cleanup cancelled; {} files removed so far", report.removed.len());
                report.cancelled = true;
                break;
            }

            match self.apply(entry, reason).await {
                Ok(staged_to) => {
                    log::debug!("Removed {} ({})", entry.path.display(), reason);
                    self.progress.file_processed(entry.size);
                    report.freed += ledger.release(entry);
                    report.removed.push(RemovedFile {
                        path: entry.path.clone(),
                        size: entry.size,
                        reason: reason.to_string(),
                        staged_to,
                    });
                }
                Err(err) => {
                    log::warn!("Skipping {}: {}", entry.path.display(), err.message);
                    self.progress.file_processed(0);
                    report.errors.push(err);
                }
            }
        }

        log::info!(
            "Executed plan: {} removed ({} bytes), {} errors",
            report.removed.len(),
            report.bytes_freed(),
            report.errors.len()
        );
        report
    }

    /// Single attempt on the blocking pool. A timed-out attempt is reported and not retried;
    /// its thread cannot be stopped, so the file may still be removed after the report.
    async fn apply(
        &self,
        entry: &FileEntry,
        reason: &DeleteReason,
    ) -> Result<Option<PathBuf>, EntryError> {
        // Joining an absolute path would replace the staging root entirely.
        if entry.relative.is_absolute() || entry.relative.as_os_str().is_empty() {
            return Err(EntryError::new(
                &entry.path,
                Stage::Execute,
                EntryErrorKind::Io,
                format!("path is not inside the scan root: {}", entry.relative.display()),
            ));
        }
        let target = match self.mode {
            DeletionMode::Permanent => Target::Remove,
            DeletionMode::Staged => match &self.staging_root {
                Some(root) => Target::Stage(root.join(&entry.relative)),
                None => {
                    return Err(EntryError::new(
                        &entry.path,
                        Stage::Execute,
                        EntryErrorKind::Io,
                        "no staging root configured",
                    ))
                }
            },
        };
        let kept = match reason {
            DeleteReason::DuplicateOf(kept) => Some(kept.clone()),
            DeleteReason::Temporary(_) => None,
        };
        let owned = entry.clone();

        let job = task::spawn_blocking(move || {
            revalidate(&owned)?;
            if let Some(kept) = kept {
                verify_kept_original(&owned, &kept)?;
            }
            match target {
                Target::Remove => fs::remove_file(&owned.path)
                    .map(|_| None)
                    .map_err(|e| EntryError::from_io(&owned.path, Stage::Execute, &e)),
                Target::Stage(dest) => stage_file(&owned.path, &dest)
                    .map(Some)
                    .map_err(|e| EntryError::from_io(&owned.path, Stage::Execute, &e)),
            }
        });

        match tokio::time::timeout(self.io_timeout, job).await {
            Err(_) => Err(EntryError::timed_out(&entry.path, Stage::Execute)),
            Ok(Err(join_err)) => Err(EntryError::new(
                &entry.path,
                Stage::Execute,
                EntryErrorKind::Io,
                join_err.to_string(),
            )),
            Ok(Ok(result)) => result,
        }
    }
}

enum Target {
    Remove,
    Stage(PathBuf),
}

/// The file must still be the regular file the walk saw: same size, same mtime.
fn revalidate(entry: &FileEntry) -> Result<(), EntryError> {
    let metadata = fs::symlink_metadata(&entry.path)
        .map_err(|e| EntryError::from_io(&entry.path, Stage::Execute, &e))?;
    if !metadata.is_file() {
        return Err(EntryError::changed(&entry.path, "no longer a regular file"));
    }
    if metadata.len() != entry.size {
        return Err(EntryError::changed(
            &entry.path,
            format!("size changed since scan ({} -> {} bytes)", entry.size, metadata.len()),
        ));
    }
    if let Ok(modified) = metadata.modified() {
        if modified != entry.modified {
            return Err(EntryError::changed(&entry.path, "modified since scan"));
        }
    }
    Ok(())
}

/// Never remove a copy unless the original it duplicates is still in place.
fn verify_kept_original(entry: &FileEntry, kept: &Path) -> Result<(), EntryError> {
    match fs::symlink_metadata(kept) {
        Ok(md) if md.is_file() && md.len() == entry.size => Ok(()),
        Ok(_) => Err(EntryError::changed(
            &entry.path,
            format!("kept original {} changed since scan", kept.display()),
        )),
        Err(err) => Err(EntryError::changed(
            &entry.path,
            format!("kept original {} unavailable: {}", kept.display(), err),
        )),
    }
}

/// Move `path` under the staging root, preserving its relative location.
fn stage_file(path: &Path, dest: &Path) -> io::Result<PathBuf> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let target = unique_target(dest);

    match fs::rename(path, &target) {
        Ok(()) => Ok(target),
        Err(err) if is_cross_device(&err) => {
            log::debug!(
                "Rename across devices for {}; copying instead",
                path.display()
            );
            let copied = fs::copy(path, &target)?;
            let expected = fs::metadata(path)?.len();
            if copied != expected {
                let _ = fs::remove_file(&target);
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("short copy to staging ({} of {} bytes)", copied, expected),
                ));
            }
            if let Err(err) = fs::remove_file(path) {
                // Leave exactly one copy behind.
                let _ = fs::remove_file(&target);
                return Err(err);
            }
            Ok(target)
        }
        Err(err) => Err(err),
    }
}

fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EXDEV)
}

/// Appends ` (<timestamp>-<n>)` before the extension until the name is free.
fn unique_target(dest: &Path) -> PathBuf {
    if !dest.exists() {
        return dest.to_path_buf();
    }
    let parent = dest.parent().unwrap_or_else(|| Path::new(""));
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let (base, ext) = split_name_ext(&name);
    let ts = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let mut counter = 1u32;
    loop {
        let candidate = if ext.is_empty() {
            format!("{} ({}-{})", base, ts, counter)
        } else {
            format!("{} ({}-{}).{}", base, ts, counter, ext)
        };
        let target = parent.join(candidate);
        if !target.exists() {
            return target;
        }
        counter += 1;
    }
}

fn split_name_ext(name: &str) -> (String, String) {
    match name.rfind('.') {
        // A leading dot marks a hidden file, not an extension.
        Some(idx) if idx > 0 => {
            let (base, ext) = name.split_at(idx);
            (base.to_string(), ext.trim_start_matches('.').to_string())
        }
        _ => (name.to_string(), String::new()),
    }
}
