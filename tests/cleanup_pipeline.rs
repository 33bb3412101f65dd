use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use autoclean_lib::{
    CleanupConfig, CleanupEngine, DeletionMode, EntryErrorKind, KeepStrategy, ProgressSnapshot,
    ProgressStage, RunEnvelope, Stage,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct TestEnv {
    root: TempDir,
    staging: TempDir,
}

impl TestEnv {
    fn new() -> Self {
        TestEnv {
            root: TempDir::new().expect("temp root"),
            staging: TempDir::new().expect("temp staging"),
        }
    }

    fn root(&self) -> PathBuf {
        fs::canonicalize(self.root.path()).expect("canonical root")
    }

    fn create_file(&self, relative: &str, content: &[u8]) -> PathBuf {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        let mut file = fs::File::create(&path).expect("create file");
        file.write_all(content).expect("write file");
        drop(file);
        path
    }

    /// Pin the mtime so keep-selection does not depend on write timing.
    fn set_age(&self, relative: &str, secs_after_epoch: u64) {
        let file = fs::File::options()
            .write(true)
            .open(self.root().join(relative))
            .expect("open for mtime");
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs_after_epoch))
            .expect("set mtime");
    }

    fn exists(&self, relative: &str) -> bool {
        self.root().join(relative).exists()
    }

    fn permanent(&self) -> CleanupConfig {
        CleanupConfig {
            deletion_mode: DeletionMode::Permanent,
            ..CleanupConfig::default()
        }
    }

    fn staged(&self) -> CleanupConfig {
        CleanupConfig {
            deletion_mode: DeletionMode::Staged,
            staging_root: Some(self.staging.path().to_path_buf()),
            ..CleanupConfig::default()
        }
    }

    fn scenario_a(&self) {
        self.create_file("a.tmp", &[0u8; 10]);
        self.create_file("b.txt", &[7u8; 100]);
        self.create_file("c.txt", &[7u8; 100]);
        self.set_age("b.txt", 1_000);
        self.set_age("c.txt", 2_000);
    }
}

#[tokio::test]
async fn temp_and_duplicate_are_removed_keeping_the_oldest() {
    let env = TestEnv::new();
    env.scenario_a();

    let engine = CleanupEngine::new(&env.permanent()).unwrap();
    let result = engine
        .run(&env.root(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.duplicate_groups, 1);
    assert_eq!(result.planned_deletions, 2);
    assert_eq!(result.files_deleted, 2);
    assert_eq!(result.bytes_freed, 110);
    assert_eq!(result.bytes_would_free, 110);
    assert!(result.errors.is_empty());
    assert!(!env.exists("a.tmp"));
    assert!(env.exists("b.txt"));
    assert!(!env.exists("c.txt"));
}

#[tokio::test]
async fn equal_mtimes_keep_the_lexicographically_smaller_path() {
    let env = TestEnv::new();
    env.create_file("b.txt", &[7u8; 100]);
    env.create_file("c.txt", &[7u8; 100]);
    env.set_age("b.txt", 5_000);
    env.set_age("c.txt", 5_000);

    let engine = CleanupEngine::new(&env.permanent()).unwrap();
    let planned = engine
        .plan(&env.root(), &CancellationToken::new())
        .await
        .unwrap();
    let action = planned.plan().action_for(&env.root().join("c.txt")).unwrap();
    assert_eq!(
        action.reason_label(),
        format!("duplicate-of:{}", env.root().join("b.txt").display())
    );
}

#[tokio::test]
async fn newest_strategy_keeps_the_most_recent_copy() {
    let env = TestEnv::new();
    env.scenario_a();

    let config = CleanupConfig {
        keep_strategy: KeepStrategy::NewestModified,
        ..env.permanent()
    };
    let result = CleanupEngine::new(&config)
        .unwrap()
        .run(&env.root(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.files_deleted, 2);
    assert!(!env.exists("b.txt"));
    assert!(env.exists("c.txt"));
}

#[tokio::test]
async fn empty_files_are_never_grouped() {
    let env = TestEnv::new();
    env.create_file("empty1.dat", b"");
    env.create_file("empty2.dat", b"");

    let result = CleanupEngine::new(&env.permanent())
        .unwrap()
        .run(&env.root(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.files_scanned, 2);
    assert_eq!(result.ignored_files, 2);
    assert_eq!(result.duplicate_groups, 0);
    assert_eq!(result.files_deleted, 0);
    assert!(env.exists("empty1.dat"));
    assert!(env.exists("empty2.dat"));
}

#[tokio::test]
async fn file_unreadable_during_hashing_is_one_error() {
    let env = TestEnv::new();
    env.create_file("x.dat", &[9u8; 300]);
    let victim = env.create_file("y.dat", &[9u8; 300]);
    env.create_file("z.dat", &[9u8; 300]);
    env.set_age("x.dat", 1_000);
    env.set_age("z.dat", 2_000);

    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let target = victim.clone();
    let engine = CleanupEngine::new(&env.permanent())
        .unwrap()
        .with_progress(Arc::new(move |snap: &ProgressSnapshot| {
            if snap.stage == ProgressStage::Hashing && !flag.swap(true, Ordering::SeqCst) {
                make_unreadable(&target);
            }
        }));

    let result = engine
        .run(&env.root(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(fired.load(Ordering::SeqCst));
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].path, victim);
    assert_eq!(result.errors[0].stage, Stage::Hash);
    // The remaining pair is still deduplicated.
    assert_eq!(result.duplicate_groups, 1);
    assert_eq!(result.files_deleted, 1);
    assert!(env.exists("x.dat"));
    assert!(!env.exists("z.dat"));
}

/// Revoke read access; fall back to removal when running with privileges that ignore modes.
fn make_unreadable(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o000));
    }
    if fs::File::open(path).is_ok() {
        let _ = fs::remove_file(path);
    }
}

#[tokio::test]
async fn second_run_finds_nothing_to_do() {
    let env = TestEnv::new();
    env.scenario_a();
    let engine = CleanupEngine::new(&env.permanent()).unwrap();

    let first = engine
        .run(&env.root(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.files_deleted, 2);

    let second = engine
        .run(&env.root(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.planned_deletions, 0);
    assert_eq!(second.files_deleted, 0);
    assert_eq!(second.bytes_freed, 0);
}

#[tokio::test]
async fn temporary_wins_over_duplicate() {
    let env = TestEnv::new();
    env.create_file("x.tmp", &[5u8; 64]);
    env.create_file("y.bin", &[5u8; 64]);
    env.set_age("x.tmp", 1);
    env.set_age("y.bin", 2);

    let engine = CleanupEngine::new(&env.permanent()).unwrap();
    let planned = engine
        .plan(&env.root(), &CancellationToken::new())
        .await
        .unwrap();

    let plan = planned.plan();
    assert_eq!(plan.actions.len(), 2);
    assert_eq!(
        plan.action_for(&env.root().join("x.tmp")).unwrap().reason_label(),
        "temporary"
    );
    assert!(!plan.action_for(&env.root().join("y.bin")).unwrap().is_delete());

    let result = engine.execute(planned, &CancellationToken::new()).await;
    assert_eq!(result.files_deleted, 1);
    assert!(env.exists("y.bin"));
}

#[tokio::test]
async fn dry_run_reports_without_touching_files() {
    let env = TestEnv::new();
    env.scenario_a();
    let config = CleanupConfig {
        dry_run: true,
        ..env.permanent()
    };

    let result = CleanupEngine::new(&config)
        .unwrap()
        .run(&env.root(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.dry_run);
    assert_eq!(result.planned_deletions, 2);
    assert_eq!(result.bytes_would_free, 110);
    assert_eq!(result.files_deleted, 0);
    assert_eq!(result.bytes_freed, 0);
    assert!(env.exists("a.tmp") && env.exists("b.txt") && env.exists("c.txt"));
}

#[tokio::test]
async fn staged_mode_preserves_relative_layout() {
    let env = TestEnv::new();
    env.create_file("build/cache/obj.tmp", b"intermediate");

    let result = CleanupEngine::new(&env.staged())
        .unwrap()
        .run(&env.root(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.files_deleted, 1);
    let staged = env.staging.path().join("build/cache/obj.tmp");
    assert_eq!(result.removed[0].staged_to.as_deref(), Some(staged.as_path()));
    assert_eq!(fs::read(&staged).unwrap(), b"intermediate");
    assert!(!env.exists("build/cache/obj.tmp"));
}

#[tokio::test]
async fn cancelled_token_still_returns_a_result() {
    let env = TestEnv::new();
    env.scenario_a();
    let token = CancellationToken::new();
    token.cancel();

    let result = CleanupEngine::new(&env.permanent())
        .unwrap()
        .run(&env.root(), &token)
        .await
        .unwrap();
    assert!(result.cancelled);
    assert_eq!(result.files_deleted, 0);
    assert!(env.exists("a.tmp"));
}

#[tokio::test]
async fn cancellation_takes_effect_between_files() {
    let env = TestEnv::new();
    for name in ["one.tmp", "two.tmp", "three.tmp"] {
        env.create_file(name, b"scratch");
    }
    let token = CancellationToken::new();
    let trigger = token.clone();
    let engine = CleanupEngine::new(&env.permanent())
        .unwrap()
        .with_progress(Arc::new(move |snap: &ProgressSnapshot| {
            if snap.stage == ProgressStage::Executing && snap.files_processed >= 1 {
                trigger.cancel();
            }
        }));

    let result = engine.run(&env.root(), &token).await.unwrap();
    assert!(result.cancelled);
    assert_eq!(result.planned_deletions, 3);
    assert_eq!(result.files_deleted, 1);
    assert_eq!(result.bytes_freed, 7);
}

#[tokio::test]
async fn file_changed_after_planning_is_skipped() {
    let env = TestEnv::new();
    env.scenario_a();
    let engine = CleanupEngine::new(&env.permanent()).unwrap();
    let planned = engine
        .plan(&env.root(), &CancellationToken::new())
        .await
        .unwrap();

    let mut file = fs::File::options()
        .append(true)
        .open(env.root().join("a.tmp"))
        .unwrap();
    file.write_all(b"grown").unwrap();
    drop(file);

    let result = engine.execute(planned, &CancellationToken::new()).await;
    assert_eq!(result.files_deleted, 1);
    assert_eq!(result.bytes_freed, 100);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, EntryErrorKind::Changed);
    assert!(env.exists("a.tmp"));
}

#[tokio::test]
async fn missing_root_yields_error_envelope() {
    let env = TestEnv::new();
    let outcome = CleanupEngine::new(&env.permanent())
        .unwrap()
        .run(&env.root().join("missing"), &CancellationToken::new())
        .await;

    let json = serde_json::to_value(RunEnvelope::from(outcome)).unwrap();
    assert_eq!(json["status"], "error");
    assert_eq!(json["kind"], "root_not_found");
}

#[tokio::test]
async fn contradictory_config_is_rejected_before_any_work() {
    let env = TestEnv::new();
    env.scenario_a();
    let config = CleanupConfig {
        min_size: 100,
        max_size: Some(10),
        ..env.permanent()
    };
    assert!(CleanupEngine::new(&config).is_err());
    assert!(env.exists("a.tmp"));
}
