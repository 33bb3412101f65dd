// src/config.rs

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const RULES_OVERRIDE_ENV: &str = "AUTOCLEAN_RULES_OVERRIDE";

const DEFAULT_IO_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_PARTIAL_HASH_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeletionMode {
    /// Move into the staging root, preserving the path relative to the scan root.
    #[default]
    Staged,
    Permanent,
}

/// Primary ordering used to pick the survivor of a duplicate group.
/// Ties always fall back to shortest path, then lexicographically smallest path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeepStrategy {
    #[default]
    OldestModified,
    NewestModified,
    ShortestPath,
}

/// How files sharing a device/inode pair are treated before hashing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HardLinkPolicy {
    /// All links collapse to one representative; the others are skipped and never hashed.
    #[default]
    SingleFile,
    /// Links join the representative's duplicate group without being read.
    TreatAsDuplicates,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TempPattern {
    pub pattern: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TempRules {
    pub extensions: Vec<String>,
    pub patterns: Vec<TempPattern>,
}

// Load rules with error propagation, honouring the override file
pub fn load_temp_rules_result() -> Result<TempRules, ConfigError> {
    if let Ok(path) = env::var(RULES_OVERRIDE_ENV) {
        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: PathBuf::from(&path),
            source,
        })?;
        return Ok(serde_json::from_str(&raw)?);
    }
    let raw = include_str!("../rules/temp_rules.json");
    Ok(serde_json::from_str(raw)?)
}

// Load rules with built-in fallback
pub fn load_temp_rules() -> TempRules {
    load_temp_rules_result().unwrap_or_else(|err| {
        log::warn!("Falling back to built-in temp rules: {}", err);
        BUILTIN_TEMP_RULES.clone()
    })
}

lazy_static! {
    static ref BUILTIN_TEMP_RULES: TempRules =
        serde_json::from_str(include_str!("../rules/temp_rules.json")).unwrap_or_default();
}

/// Everything a caller can tune for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub temp_extensions: Vec<String>,
    pub temp_patterns: Vec<TempPattern>,
    /// Smallest size eligible for duplicate detection. Zero-byte files are never grouped.
    pub min_size: u64,
    pub max_size: Option<u64>,
    /// Directories and files pruned during the walk.
    pub exclude_globs: Vec<String>,
    /// Files that are walked but never considered as duplicates.
    pub dedup_exclude_globs: Vec<String>,
    pub max_depth: Option<usize>,
    pub follow_symlinks: bool,
    pub keep_strategy: KeepStrategy,
    pub hard_links: HardLinkPolicy,
    pub deletion_mode: DeletionMode,
    pub staging_root: Option<PathBuf>,
    pub dry_run: bool,
    pub workers: usize,
    pub io_timeout_ms: u64,
    pub partial_hash_bytes: usize,
    pub hash_suffix: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        let rules = load_temp_rules();
        CleanupConfig {
            temp_extensions: rules.extensions,
            temp_patterns: rules.patterns,
            min_size: 1,
            max_size: None,
            exclude_globs: vec![".git".into(), ".hg".into(), ".svn".into()],
            dedup_exclude_globs: Vec::new(),
            max_depth: None,
            follow_symlinks: false,
            keep_strategy: KeepStrategy::default(),
            hard_links: HardLinkPolicy::default(),
            deletion_mode: DeletionMode::default(),
            staging_root: None,
            dry_run: false,
            workers: num_cpus::get(),
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            partial_hash_bytes: DEFAULT_PARTIAL_HASH_BYTES,
            hash_suffix: true,
        }
    }
}

impl CleanupConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.compile().map(|_| ())
    }

    /// Check for contradictions and compile patterns. Nothing touches the filesystem.
    pub fn compile(&self) -> Result<CompiledConfig, ConfigError> {
        if let Some(max) = self.max_size {
            if self.min_size > max {
                return Err(ConfigError::InvalidSize {
                    min: self.min_size,
                    max,
                });
            }
        }
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.io_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.partial_hash_bytes == 0 {
            return Err(ConfigError::ZeroPartialWindow);
        }

        let staging_root = match self.deletion_mode {
            DeletionMode::Permanent => None,
            DeletionMode::Staged => Some(match &self.staging_root {
                Some(root) => root.clone(),
                None => default_staging_root().ok_or(ConfigError::NoStagingRoot)?,
            }),
        };

        let temp_extensions = self
            .temp_extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();

        let temp_patterns: Vec<String> =
            self.temp_patterns.iter().map(|p| p.pattern.clone()).collect();

        Ok(CompiledConfig {
            temp_extensions,
            temp_patterns: PathMatcher::new(&temp_patterns, true)?,
            temp_labels: self.temp_patterns.iter().map(|p| p.label.clone()).collect(),
            exclude: PathMatcher::new(&self.exclude_globs, false)?,
            dedup_exclude: PathMatcher::new(&self.dedup_exclude_globs, false)?,
            staging_root,
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            config: self.clone(),
        })
    }
}

/// Per-user staging area, one timestamped directory per compiled configuration.
fn default_staging_root() -> Option<PathBuf> {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
    dirs::data_local_dir().map(|dir| dir.join("autoclean").join("staging").join(stamp))
}

/// Validated configuration with compiled matchers, shared read-only by every stage.
#[derive(Debug, Clone)]
pub struct CompiledConfig {
    pub(crate) temp_extensions: HashSet<String>,
    pub(crate) temp_patterns: PathMatcher,
    pub(crate) temp_labels: Vec<String>,
    pub(crate) exclude: PathMatcher,
    pub(crate) dedup_exclude: PathMatcher,
    pub(crate) staging_root: Option<PathBuf>,
    pub(crate) io_timeout: Duration,
    pub(crate) config: CleanupConfig,
}

impl CompiledConfig {
    pub fn settings(&self) -> &CleanupConfig {
        &self.config
    }

    pub fn staging_root(&self) -> Option<&Path> {
        self.staging_root.as_deref()
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }
}

/// A set of globs matched against both the root-relative path and the bare file name,
/// so `.git` prunes every `.git` directory while `build/*.o` stays anchored.
#[derive(Debug, Clone)]
pub(crate) struct PathMatcher {
    set: GlobSet,
    len: usize,
}

impl PathMatcher {
    pub(crate) fn new(patterns: &[String], case_insensitive: bool) -> Result<Self, ConfigError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(case_insensitive)
                .literal_separator(true)
                .build()
                .map_err(|source| ConfigError::InvalidGlob {
                    pattern: pattern.clone(),
                    source,
                })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|source| ConfigError::InvalidGlob {
            pattern: patterns.join(", "),
            source,
        })?;
        Ok(Self {
            set,
            len: patterns.len(),
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index of the first pattern matching `relative` or its file name.
    pub(crate) fn first_match(&self, relative: &Path) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let by_path = self.set.matches(relative).into_iter().min();
        let by_name = relative
            .file_name()
            .and_then(|name| self.set.matches(Path::new(name)).into_iter().min());
        match (by_path, by_name) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) fn is_match(&self, relative: &Path) -> bool {
        self.first_match(relative).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_rules_parse() {
        let rules: TempRules =
            serde_json::from_str(include_str!("../rules/temp_rules.json")).unwrap();
        assert!(rules.extensions.iter().any(|e| e == "tmp"));
        assert!(rules.extensions.iter().any(|e| e == "temp"));
        assert!(rules.extensions.iter().any(|e| e == "cache"));
        assert!(rules.patterns.iter().any(|p| p.pattern == "~$*"));
    }

    #[test]
    fn defaults_are_safe() {
        let config = CleanupConfig::default();
        assert_eq!(config.deletion_mode, DeletionMode::Staged);
        assert!(!config.follow_symlinks);
        assert_eq!(config.min_size, 1);
        assert!(config.workers >= 1);
    }

    #[test]
    fn contradictory_sizes_are_rejected() {
        let config = CleanupConfig {
            min_size: 100,
            max_size: Some(10),
            ..CleanupConfig::default()
        };
        assert!(matches!(
            config.compile(),
            Err(ConfigError::InvalidSize { min: 100, max: 10 })
        ));
    }

    #[test]
    fn zero_workers_rejected() {
        let config = CleanupConfig {
            workers: 0,
            ..CleanupConfig::default()
        };
        assert!(matches!(config.compile(), Err(ConfigError::ZeroWorkers)));
    }

    #[test]
    fn bad_glob_is_a_config_error() {
        let config = CleanupConfig {
            exclude_globs: vec!["[unterminated".into()],
            deletion_mode: DeletionMode::Permanent,
            ..CleanupConfig::default()
        };
        assert!(matches!(
            config.compile(),
            Err(ConfigError::InvalidGlob { .. })
        ));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config =
            CleanupConfig::from_json_str(r#"{ "dry_run": true, "deletion_mode": "permanent" }"#)
                .unwrap();
        assert!(config.dry_run);
        assert_eq!(config.deletion_mode, DeletionMode::Permanent);
        assert_eq!(config.min_size, 1);
        assert!(config.exclude_globs.contains(&".git".to_string()));
    }

    #[test]
    fn matcher_checks_name_and_relative_path() {
        let matcher =
            PathMatcher::new(&[".git".to_string(), "build/*.o".to_string()], false).unwrap();
        assert!(matcher.is_match(Path::new("sub/dir/.git")));
        assert!(matcher.is_match(Path::new("build/main.o")));
        assert!(!matcher.is_match(Path::new("other/build/main.o")));
        assert!(!matcher.is_match(Path::new("src/main.rs")));
    }
}
