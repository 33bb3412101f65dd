// src/file_cleaner/classifier.rs

use std::path::Path;

use super::types::{Classification, FileEntry, IgnoreReason, TempReason};
use crate::config::CompiledConfig;

/// Pure labelling of walked entries. Uses only the metadata already captured in the entry.
pub struct Classifier<'a> {
    config: &'a CompiledConfig,
}

impl<'a> Classifier<'a> {
    pub fn new(config: &'a CompiledConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, entry: &FileEntry) -> Classification {
        if let Some(reason) = self.temp_reason(&entry.relative) {
            return Classification::Temporary(reason);
        }

        if let Some(idx) = self.config.dedup_exclude.first_match(&entry.relative) {
            let pattern = self
                .config
                .settings()
                .dedup_exclude_globs
                .get(idx)
                .cloned()
                .unwrap_or_default();
            return Classification::Ignored(IgnoreReason::ExcludedPath(pattern));
        }

        let settings = self.config.settings();
        // Empty files are never duplicate candidates, whatever the threshold.
        if entry.size == 0 || entry.size < settings.min_size {
            return Classification::Ignored(IgnoreReason::TooSmall);
        }
        if let Some(max) = settings.max_size {
            if entry.size > max {
                return Classification::Ignored(IgnoreReason::TooLarge);
            }
        }

        Classification::DuplicateCandidate
    }

    fn temp_reason(&self, relative: &Path) -> Option<TempReason> {
        let name = relative.file_name()?.to_str()?;

        if let Some(ext) = Path::new(name).extension().and_then(|e| e.to_str()) {
            let ext_lower = ext.to_lowercase();
            if self.config.temp_extensions.contains(&ext_lower) {
                return Some(TempReason::Extension(ext_lower));
            }
        }

        self.config
            .temp_patterns
            .first_match(Path::new(name))
            .map(|idx| {
                let label = self
                    .config
                    .temp_labels
                    .get(idx)
                    .cloned()
                    .unwrap_or_else(|| "pattern".to_string());
                TempReason::Pattern(label)
            })
    }
}
