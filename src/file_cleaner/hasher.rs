use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tokio::task;
use tokio_util::sync::CancellationToken;
use xxhash_rust::xxh3::Xxh3;

use super::progress::ProgressTracker;
use super::types::{FileEntry, FileId, Fingerprint};
use crate::config::{CompiledConfig, HardLinkPolicy};
use crate::error::{EntryError, EntryErrorKind, Stage};

const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Result of running the staged hashing strategy over a set of candidates.
#[derive(Debug, Default)]
pub struct HashOutcome {
    /// Files whose full digest was computed (or inherited from a hard-linked representative).
    pub fingerprinted: Vec<(FileEntry, Fingerprint)>,
    /// Ruled out cheaply: unique size or unique partial hash.
    pub unique: Vec<FileEntry>,
    /// Extra links to an inode already represented elsewhere, with the representative path.
    pub hard_links: Vec<(FileEntry, PathBuf)>,
    /// Files that could not be read; they never reach grouping.
    pub failed: Vec<(FileEntry, EntryError)>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy)]
struct Partial {
    quick: u64,
    /// Present when the whole file fit inside the prefix window.
    full: Option<[u8; 32]>,
}

/// Computes fingerprints cheaply: size buckets, then xxh3 over prefix/suffix,
/// then streamed SHA-256 only where the cheaper stages collide.
///
/// SHA-256 digest equality is treated as byte equality. A collision is not
/// considered a practical risk for this tool.
pub struct ContentHasher {
    workers: usize,
    io_timeout: Duration,
    window: usize,
    suffix: bool,
    hard_links: HardLinkPolicy,
    progress: ProgressTracker,
}

impl ContentHasher {
    pub fn new(config: &CompiledConfig) -> Self {
        let settings = config.settings();
        Self {
            workers: settings.workers.max(1),
            io_timeout: config.io_timeout(),
            window: settings.partial_hash_bytes.max(1),
            suffix: settings.hash_suffix,
            hard_links: settings.hard_links,
            progress: ProgressTracker::default(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    /// Full fingerprint of a single file, bypassing the cheap pre-filters.
    pub async fn fingerprint(&self, entry: &FileEntry) -> Result<Fingerprint, EntryError> {
        let size = entry.size;
        let progress = self.progress.clone();
        let digest = run_blocking(&entry.path, self.io_timeout, move |path| {
            full_digest(path, size, &progress)
        })
        .await?;
        Ok(Fingerprint { size, digest })
    }

    pub async fn hash_candidates(
        &self,
        candidates: Vec<FileEntry>,
        cancel: &CancellationToken,
    ) -> HashOutcome {
        let mut outcome = HashOutcome::default();

        let (representatives, mut aliases) = self.collapse_hard_links(candidates, &mut outcome);
        let has_aliases = |entry: &FileEntry| {
            entry
                .id
                .map_or(false, |id| aliases.contains_key(&id))
        };

        // Stage 1: distinct sizes cannot be duplicates.
        let mut by_size: HashMap<u64, Vec<FileEntry>> = HashMap::new();
        for entry in representatives {
            by_size.entry(entry.size).or_default().push(entry);
        }
        let mut to_partial = Vec::new();
        for (_, files) in by_size {
            if files.len() < 2 && !files.iter().any(|f| has_aliases(f)) {
                outcome.unique.extend(files);
            } else {
                to_partial.extend(files);
            }
        }

        // Stage 2: cheap prefix/suffix hash.
        let window = self.window;
        let suffix = self.suffix;
        let progress = self.progress.clone();
        let (partials, cancelled) = self
            .run_bounded(to_partial, cancel, move |path: &Path, size: u64| {
                partial_digest(path, size, window, suffix, &progress)
            })
            .await;
        outcome.cancelled |= cancelled;

        let mut by_partial: HashMap<(u64, u64), Vec<(FileEntry, Partial)>> = HashMap::new();
        for (entry, result) in partials {
            self.progress.file_hashed();
            match result {
                Ok(partial) => by_partial
                    .entry((entry.size, partial.quick))
                    .or_default()
                    .push((entry, partial)),
                Err(err) => {
                    log::debug!("Partial hash failed for {}: {}", entry.path.display(), err);
                    outcome.failed.push((entry, err));
                }
            }
        }

        // Stage 3: full hash only where partial hashes collide.
        let mut to_full = Vec::new();
        for (_, files) in by_partial {
            if files.len() < 2 && !files.iter().any(|(f, _)| has_aliases(f)) {
                outcome.unique.extend(files.into_iter().map(|(f, _)| f));
                continue;
            }
            for (entry, partial) in files {
                match partial.full {
                    Some(digest) => {
                        let fingerprint = Fingerprint {
                            size: entry.size,
                            digest,
                        };
                        outcome.fingerprinted.push((entry, fingerprint));
                    }
                    None => to_full.push(entry),
                }
            }
        }

        if !outcome.cancelled {
            let progress = self.progress.clone();
            let (fulls, cancelled) = self
                .run_bounded(to_full, cancel, move |path: &Path, size: u64| {
                    full_digest(path, size, &progress)
                })
                .await;
            outcome.cancelled |= cancelled;
            for (entry, result) in fulls {
                match result {
                    Ok(digest) => {
                        let fingerprint = Fingerprint {
                            size: entry.size,
                            digest,
                        };
                        outcome.fingerprinted.push((entry, fingerprint));
                    }
                    Err(err) => {
                        log::debug!("Full hash failed for {}: {}", entry.path.display(), err);
                        outcome.failed.push((entry, err));
                    }
                }
            }
        }

        // Links inherit their representative's fingerprint without any I/O.
        let mut inherited = Vec::new();
        for (entry, fingerprint) in &outcome.fingerprinted {
            if let Some((_, links)) = entry.id.and_then(|id| aliases.remove(&id)) {
                for link in links {
                    inherited.push((link, *fingerprint));
                }
            }
        }
        outcome.fingerprinted.extend(inherited);
        // Representatives that were ruled out or failed leave their links as plain skips.
        for (_, (rep, links)) in aliases {
            for link in links {
                outcome.hard_links.push((link, rep.clone()));
            }
        }

        log::info!(
            "Hashing finished: {} fingerprinted, {} unique, {} failed",
            outcome.fingerprinted.len(),
            outcome.unique.len(),
            outcome.failed.len()
        );
        outcome
    }

    /// Picks the lexicographically smallest path per inode as representative.
    fn collapse_hard_links(
        &self,
        candidates: Vec<FileEntry>,
        outcome: &mut HashOutcome,
    ) -> (Vec<FileEntry>, HashMap<FileId, (PathBuf, Vec<FileEntry>)>) {
        let mut by_id: HashMap<FileId, Vec<FileEntry>> = HashMap::new();
        let mut representatives = Vec::new();
        for entry in candidates {
            match entry.id {
                Some(id) if entry.links > 1 => by_id.entry(id).or_default().push(entry),
                _ => representatives.push(entry),
            }
        }

        let mut aliases = HashMap::new();
        for (id, mut links) in by_id {
            links.sort_by(|a, b| a.path.cmp(&b.path));
            let mut iter = links.into_iter();
            let Some(rep) = iter.next() else { continue };
            let rest: Vec<FileEntry> = iter.collect();
            match self.hard_links {
                HardLinkPolicy::SingleFile => {
                    for link in rest {
                        outcome.hard_links.push((link, rep.path.clone()));
                    }
                }
                HardLinkPolicy::TreatAsDuplicates => {
                    if !rest.is_empty() {
                        aliases.insert(id, (rep.path.clone(), rest));
                    }
                }
            }
            representatives.push(rep);
        }
        (representatives, aliases)
    }

    /// Runs `job` over each entry on the blocking pool, at most `workers` at a time.
    /// Entries not started before cancellation are dropped from the result.
    async fn run_bounded<T, F>(
        &self,
        entries: Vec<FileEntry>,
        cancel: &CancellationToken,
        job: F,
    ) -> (Vec<(FileEntry, Result<T, EntryError>)>, bool)
    where
        T: Send + 'static,
        F: Fn(&Path, u64) -> io::Result<T> + Send + Sync + 'static,
    {
        let job = Arc::new(job);
        let timeout = self.io_timeout;
        let results: Vec<Option<(FileEntry, Result<T, EntryError>)>> =
            stream::iter(entries.into_iter().map(|entry| {
                let job = job.clone();
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    let size = entry.size;
                    let result = run_blocking(&entry.path, timeout, move |path| job(path, size)).await;
                    Some((entry, result))
                }
            }))
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let cancelled = results.iter().any(Option::is_none);
        (results.into_iter().flatten().collect(), cancelled)
    }
}

/// Single attempt on the blocking pool, bounded by `timeout`. A timed-out job keeps
/// its thread and open file until the read returns, outside the `workers` bound.
async fn run_blocking<T, F>(path: &Path, timeout: Duration, job: F) -> Result<T, EntryError>
where
    T: Send + 'static,
    F: FnOnce(&Path) -> io::Result<T> + Send + 'static,
{
    let owned = path.to_path_buf();
    match tokio::time::timeout(timeout, task::spawn_blocking(move || job(&owned))).await {
        Err(_) => Err(EntryError::timed_out(path, Stage::Hash)),
        Ok(Err(join_err)) => Err(EntryError::new(
            path,
            Stage::Hash,
            EntryErrorKind::Io,
            join_err.to_string(),
        )),
        Ok(Ok(Err(io_err))) if io_err.kind() == io::ErrorKind::InvalidData => Err(
            EntryError::new(path, Stage::Hash, EntryErrorKind::Changed, io_err.to_string()),
        ),
        Ok(Ok(Err(io_err))) => Err(EntryError::from_io(path, Stage::Hash, &io_err)),
        Ok(Ok(Ok(value))) => Ok(value),
    }
}

fn changed_since_scan(expected: u64, actual: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("file changed since scan (expected {} bytes, found {})", expected, actual),
    )
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn partial_digest(
    path: &Path,
    size: u64,
    window: usize,
    suffix: bool,
    progress: &ProgressTracker,
) -> io::Result<Partial> {
    let mut file = File::open(path)?;
    let actual = file.metadata()?.len();
    if actual != size {
        return Err(changed_since_scan(size, actual));
    }

    let mut buffer = vec![0u8; window];
    let mut quick = Xxh3::new();
    quick.update(&size.to_le_bytes());

    let read = read_up_to(&mut file, &mut buffer)?;
    progress.bytes_hashed(read as u64);
    quick.update(&buffer[..read]);

    if size <= window as u64 {
        if read as u64 != size {
            return Err(changed_since_scan(size, read as u64));
        }
        let mut strong = Sha256::new();
        strong.update(&buffer[..read]);
        return Ok(Partial {
            quick: quick.digest(),
            full: Some(strong.finalize().into()),
        });
    }

    if suffix {
        let tail_start = size.saturating_sub(window as u64).max(window as u64);
        file.seek(SeekFrom::Start(tail_start))?;
        let read = read_up_to(&mut file, &mut buffer)?;
        progress.bytes_hashed(read as u64);
        quick.update(&buffer[..read]);
    }

    Ok(Partial {
        quick: quick.digest(),
        full: None,
    })
}

/// Streams the whole file through SHA-256 in fixed-size chunks.
fn full_digest(path: &Path, size: u64, progress: &ProgressTracker) -> io::Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_CHUNK_BYTES];
    let mut total = 0u64;
    loop {
        let n = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buffer[..n]);
        total += n as u64;
        progress.bytes_hashed(n as u64);
    }
    if total != size {
        return Err(changed_since_scan(size, total));
    }
    Ok(hasher.finalize().into())
}
