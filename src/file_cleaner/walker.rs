// src/file_cleaner/walker.rs

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashSet;
#[cfg(feature = "parallel-scan")]
use rayon::prelude::*;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::progress::ProgressTracker;
use super::types::{FileEntry, FileId};
use crate::config::CompiledConfig;
use crate::error::{EntryError, EntryErrorKind, Stage};

#[derive(Debug, Default)]
pub struct WalkOutput {
    pub entries: Vec<FileEntry>,
    pub errors: Vec<EntryError>,
    pub cancelled: bool,
}

/// Enumerates regular files under a root. Excluded directories are pruned, never descended.
pub struct PathWalker<'a> {
    root: PathBuf,
    config: &'a CompiledConfig,
    /// Staging directory, if it lives inside the root, is never walked.
    staging: Option<PathBuf>,
    progress: ProgressTracker,
}

impl<'a> PathWalker<'a> {
    pub fn new(root: &Path, config: &'a CompiledConfig) -> Self {
        let staging = config
            .staging_root()
            .map(|s| fs::canonicalize(s).unwrap_or_else(|_| s.to_path_buf()));
        Self {
            root: root.to_path_buf(),
            config,
            staging,
            progress: ProgressTracker::default(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazy walk of the whole tree. Every call starts over.
    pub fn iter(&self) -> WalkIter<'_> {
        let visited = Arc::new(DashSet::new());
        self.iter_from(&self.root, self.config.settings().max_depth, visited)
    }

    fn iter_from(
        &self,
        start: &Path,
        max_depth: Option<usize>,
        visited: Arc<DashSet<FileId>>,
    ) -> WalkIter<'_> {
        let mut walker = WalkDir::new(start).follow_links(self.config.settings().follow_symlinks);
        if let Some(max) = max_depth {
            walker = walker.max_depth(max);
        }
        WalkIter {
            walker: self,
            inner: walker.into_iter(),
            visited,
        }
    }

    /// Drain the walk into memory, honouring cancellation between entries.
    pub fn collect(&self, cancel: &CancellationToken) -> WalkOutput {
        #[cfg(feature = "parallel-scan")]
        {
            let settings = self.config.settings();
            if !settings.follow_symlinks && settings.workers > 1 {
                return self.collect_parallel(cancel);
            }
        }
        let mut out = WalkOutput::default();
        drain_into(self.iter(), cancel, &mut out);
        out.entries.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    /// Fan the top-level subdirectories out over a bounded rayon pool. Without symlink
    /// following no directory is reachable twice, so the resulting set of files does not
    /// depend on the worker count.
    #[cfg(feature = "parallel-scan")]
    fn collect_parallel(&self, cancel: &CancellationToken) -> WalkOutput {
        let workers = self.config.settings().workers;
        let pool = match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
            Ok(pool) => pool,
            Err(err) => {
                log::debug!("Falling back to serial walk: {}", err);
                let mut out = WalkOutput::default();
                drain_into(self.iter(), cancel, &mut out);
                out.entries.sort_by(|a, b| a.path.cmp(&b.path));
                return out;
            }
        };

        // Depth-1 entries are walked here; directories among them become subtree jobs.
        let mut out = WalkOutput::default();
        let mut subtrees = Vec::new();
        let visited = Arc::new(DashSet::new());
        let top_depth = self.config.settings().max_depth.map_or(1, |d| d.min(1));
        let mut top = self.iter_from(&self.root, Some(top_depth), visited.clone());
        while let Some(next) = top.next_with_dirs() {
            if cancel.is_cancelled() {
                out.cancelled = true;
                return out;
            }
            match next {
                Ok(Visit::File(entry)) => out.entries.push(entry),
                Ok(Visit::Dir(path)) => subtrees.push(path),
                Err(err) => out.errors.push(err),
            }
        }
        // Subtree roots sit at depth 1 of the overall walk.
        let subtree_depth = self.config.settings().max_depth.map(|d| d.saturating_sub(1));
        if subtree_depth == Some(0) {
            subtrees.clear();
        }

        let partials: Vec<WalkOutput> = pool.install(|| {
            subtrees
                .par_iter()
                .map(|dir| {
                    let mut part = WalkOutput::default();
                    drain_into(
                        self.iter_from(dir, subtree_depth, visited.clone()),
                        cancel,
                        &mut part,
                    );
                    part
                })
                .collect()
        });

        for part in partials {
            out.entries.extend(part.entries);
            out.errors.extend(part.errors);
            out.cancelled |= part.cancelled;
        }
        out.entries.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    fn relative<'p>(&self, path: &'p Path) -> &'p Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }

    fn is_staging(&self, path: &Path) -> bool {
        self.staging
            .as_ref()
            .map_or(false, |staging| path.starts_with(staging))
    }
}

fn drain_into(iter: WalkIter<'_>, cancel: &CancellationToken, out: &mut WalkOutput) {
    for item in iter {
        if cancel.is_cancelled() {
            out.cancelled = true;
            break;
        }
        match item {
            Ok(entry) => out.entries.push(entry),
            Err(err) => {
                log::debug!("Walk error: {}", err);
                out.errors.push(err);
            }
        }
    }
}

enum Visit {
    File(FileEntry),
    Dir(PathBuf),
}

pub struct WalkIter<'w> {
    walker: &'w PathWalker<'w>,
    inner: walkdir::IntoIter,
    visited: Arc<DashSet<FileId>>,
}

impl<'w> WalkIter<'w> {
    /// Like `next`, but also reports directories that were entered (not pruned).
    fn next_with_dirs(&mut self) -> Option<Result<Visit, EntryError>> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(err) => return Some(Err(walk_error(&self.walker.root, err))),
            };
            let path = entry.path();
            let relative = self.walker.relative(path);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                if entry.depth() == 0 {
                    if let Ok(md) = entry.metadata() {
                        if let Some(id) = FileId::from_metadata(&md) {
                            self.visited.insert(id);
                        }
                    }
                    continue;
                }
                if self.walker.config.exclude.is_match(relative) || self.walker.is_staging(path) {
                    self.inner.skip_current_dir();
                    continue;
                }
                if self.walker.config.settings().follow_symlinks {
                    match entry.metadata() {
                        Ok(md) => {
                            if let Some(id) = FileId::from_metadata(&md) {
                                if !self.visited.insert(id) {
                                    self.inner.skip_current_dir();
                                    return Some(Err(EntryError::new(
                                        path,
                                        Stage::Walk,
                                        EntryErrorKind::SymlinkCycle,
                                        "directory already visited through another path",
                                    )));
                                }
                            }
                        }
                        Err(err) => {
                            self.inner.skip_current_dir();
                            return Some(Err(walk_error(&self.walker.root, err)));
                        }
                    }
                }
                return Some(Ok(Visit::Dir(path.to_path_buf())));
            }

            // Symlinked files are never yielded, even when directory links are followed.
            if entry.path_is_symlink() || !file_type.is_file() {
                continue;
            }
            if self.walker.config.exclude.is_match(relative) {
                continue;
            }

            // Single attempt: a stat failure is reported, never retried.
            let metadata = match entry.metadata() {
                Ok(md) => md,
                Err(err) => return Some(Err(walk_error(&self.walker.root, err))),
            };
            self.walker.progress.file_scanned();
            return Some(Ok(Visit::File(FileEntry::from_metadata(
                path.to_path_buf(),
                relative.to_path_buf(),
                &metadata,
            ))));
        }
    }
}

impl<'w> Iterator for WalkIter<'w> {
    type Item = Result<FileEntry, EntryError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.next_with_dirs()? {
                Ok(Visit::File(entry)) => return Some(Ok(entry)),
                Ok(Visit::Dir(_)) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

fn walk_error(root: &Path, err: walkdir::Error) -> EntryError {
    let path = err.path().unwrap_or(root).to_path_buf();
    if err.loop_ancestor().is_some() {
        return EntryError::new(
            path,
            Stage::Walk,
            EntryErrorKind::SymlinkCycle,
            "symlink loop detected",
        );
    }
    match err.io_error() {
        Some(io_err) => EntryError::from_io(&path, Stage::Walk, io_err),
        None => EntryError::new(path, Stage::Walk, EntryErrorKind::Io, err.to_string()),
    }
}
