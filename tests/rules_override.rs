use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use autoclean_lib::config::{load_temp_rules, load_temp_rules_result, RULES_OVERRIDE_ENV};
use autoclean_lib::{CleanupConfig, CleanupEngine, ConfigError, DeletionMode};
use lazy_static::lazy_static;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

lazy_static! {
    static ref TEST_ENV_GUARD: Mutex<()> = Mutex::new(());
}

const OVERRIDE_RULES_JSON: &str = r#"{
    "extensions": ["scratch"],
    "patterns": [
        { "pattern": "*.partial", "label": "download-partial" }
    ]
}"#;

/// Points the rules override at a file for the lifetime of the value.
struct RulesOverrideEnv {
    dir: TempDir,
    prev_rules_override: Option<String>,
}

impl RulesOverrideEnv {
    fn new(contents: &str) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let rules_path = dir.path().join("rules.json");
        fs::write(&rules_path, contents).expect("write rules");

        let prev_rules_override = std::env::var(RULES_OVERRIDE_ENV).ok();
        std::env::set_var(RULES_OVERRIDE_ENV, &rules_path);

        RulesOverrideEnv {
            dir,
            prev_rules_override,
        }
    }

    fn scan_root(&self) -> PathBuf {
        let root = self.dir.path().join("scan");
        fs::create_dir_all(&root).expect("create scan root");
        root
    }
}

impl Drop for RulesOverrideEnv {
    fn drop(&mut self) {
        if let Some(prev) = self.prev_rules_override.take() {
            std::env::set_var(RULES_OVERRIDE_ENV, prev);
        } else {
            std::env::remove_var(RULES_OVERRIDE_ENV);
        }
    }
}

fn acquire_env_guard() -> std::sync::MutexGuard<'static, ()> {
    TEST_ENV_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write(root: &Path, name: &str) {
    fs::write(root.join(name), b"leftover").expect("write file");
}

#[tokio::test]
async fn override_file_replaces_builtin_rules() {
    let _guard = acquire_env_guard();
    let env = RulesOverrideEnv::new(OVERRIDE_RULES_JSON);

    let rules = load_temp_rules_result().expect("override parses");
    assert_eq!(rules.extensions, vec!["scratch".to_string()]);
    assert_eq!(rules.patterns.len(), 1);
    assert_eq!(rules.patterns[0].label, "download-partial");

    let root = env.scan_root();
    write(&root, "notes.scratch");
    write(&root, "movie.partial");
    write(&root, "old.tmp");

    let config = CleanupConfig {
        deletion_mode: DeletionMode::Permanent,
        dry_run: true,
        ..CleanupConfig::default()
    };
    let engine = CleanupEngine::new(&config).expect("engine");
    let planned = engine
        .plan(&root, &CancellationToken::new())
        .await
        .expect("plan");

    let label = |name: &str| {
        planned
            .plan()
            .action_for(&root.join(name))
            .map(|a| a.reason_label())
            .expect("action")
    };
    assert_eq!(label("notes.scratch"), "temporary");
    assert_eq!(label("movie.partial"), "temporary");
    // Built-in extensions no longer apply once overridden.
    assert_ne!(label("old.tmp"), "temporary");
}

#[test]
fn malformed_override_falls_back_to_builtin_rules() {
    let _guard = acquire_env_guard();
    let _env = RulesOverrideEnv::new("{ not json");

    assert!(matches!(load_temp_rules_result(), Err(ConfigError::Parse(_))));
    let rules = load_temp_rules();
    assert!(rules.extensions.contains(&"tmp".to_string()));
    assert!(rules.patterns.iter().any(|p| p.label == "editor-backup"));
}

#[test]
fn missing_override_file_falls_back_to_builtin_rules() {
    let _guard = acquire_env_guard();
    let env = RulesOverrideEnv::new(OVERRIDE_RULES_JSON);
    std::env::set_var(RULES_OVERRIDE_ENV, env.dir.path().join("absent.json"));

    assert!(matches!(load_temp_rules_result(), Err(ConfigError::Io { .. })));
    assert!(load_temp_rules().extensions.contains(&"tmp".to_string()));
}
