use std::cmp::Ordering;
use std::collections::HashMap;

use super::types::{DuplicateGroup, FileEntry, Fingerprint};
use crate::config::KeepStrategy;

/// Groups fingerprinted files and orders each group so the file to keep comes first.
pub struct DedupGrouper {
    strategy: KeepStrategy,
}

impl DedupGrouper {
    pub fn new(strategy: KeepStrategy) -> Self {
        Self { strategy }
    }

    pub fn group(
        &self,
        fingerprinted: impl IntoIterator<Item = (FileEntry, Fingerprint)>,
    ) -> Vec<DuplicateGroup> {
        let mut by_fingerprint: HashMap<Fingerprint, Vec<FileEntry>> = HashMap::new();
        for (entry, fingerprint) in fingerprinted {
            // Zero-byte content never groups; a size disagreeing with its fingerprint is dropped.
            if fingerprint.size == 0 || entry.size != fingerprint.size {
                continue;
            }
            by_fingerprint.entry(fingerprint).or_default().push(entry);
        }

        let mut groups: Vec<DuplicateGroup> = by_fingerprint
            .into_iter()
            .filter(|(_, members)| members.len() > 1)
            .map(|(fingerprint, mut members)| {
                members.sort_by(|a, b| self.keep_order(a, b));
                members.dedup_by(|a, b| a.path == b.path);
                DuplicateGroup {
                    fingerprint,
                    members,
                }
            })
            .filter(|group| group.members.len() > 1)
            .collect();

        groups.sort_by(|a, b| a.keep().path.cmp(&b.keep().path));
        groups
    }

    /// Total order over group members; the minimum is kept.
    pub fn keep_order(&self, a: &FileEntry, b: &FileEntry) -> Ordering {
        let primary = match self.strategy {
            KeepStrategy::OldestModified => a.modified.cmp(&b.modified),
            KeepStrategy::NewestModified => b.modified.cmp(&a.modified),
            KeepStrategy::ShortestPath => Ordering::Equal,
        };
        primary
            .then_with(|| path_len(a).cmp(&path_len(b)))
            .then_with(|| a.path.cmp(&b.path))
    }
}

fn path_len(entry: &FileEntry) -> usize {
    entry.path.as_os_str().len()
}
