use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use autoclean_lib::{
    CleanupConfig, CleanupEngine, ConfigError, DeletionMode, EngineError, KeepStrategy,
    RunEnvelope, RunResult,
};
use bytesize::ByteSize;
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "autoclean")]
#[command(version)]
#[command(about = "Remove temporary files and redundant duplicate copies under a folder", long_about = None)]
struct Cli {
    /// Folder to clean
    root: PathBuf,

    /// Build and print the plan without touching any file
    #[arg(long)]
    dry_run: bool,

    /// Delete permanently instead of moving into the staging folder
    #[arg(long, conflicts_with = "staging")]
    permanent: bool,

    /// Staging folder for removed files
    #[arg(long, value_name = "DIR")]
    staging: Option<PathBuf>,

    /// JSON configuration file; flags override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Smallest file size considered for duplicate detection
    #[arg(long, value_name = "BYTES")]
    min_size: Option<u64>,

    /// Glob to prune from the walk (repeatable)
    #[arg(long = "exclude", value_name = "GLOB")]
    exclude: Vec<String>,

    #[arg(long)]
    follow_symlinks: bool,

    #[arg(long, value_name = "N")]
    max_depth: Option<usize>,

    /// Worker pool size for walking and hashing
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Which copy of a duplicate group survives
    #[arg(long, value_enum)]
    keep: Option<KeepArg>,

    /// Print the result as a JSON envelope
    #[arg(long)]
    json: bool,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
enum KeepArg {
    Oldest,
    Newest,
    Shortest,
}

impl From<KeepArg> for KeepStrategy {
    fn from(arg: KeepArg) -> Self {
        match arg {
            KeepArg::Oldest => KeepStrategy::OldestModified,
            KeepArg::Newest => KeepStrategy::NewestModified,
            KeepArg::Shortest => KeepStrategy::ShortestPath,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted; stopping after the current file");
            interrupt.cancel();
        }
    });

    let outcome = match build_config(&cli) {
        Ok(config) => match CleanupEngine::new(&config) {
            Ok(engine) => engine.run(&cli.root, &token).await,
            Err(err) => Err(err),
        },
        Err(err) => Err(EngineError::from(err)),
    };

    let code = exit_code(&outcome);
    if cli.json {
        let envelope = RunEnvelope::from(outcome);
        let rendered =
            serde_json::to_string_pretty(&envelope).context("failed to render run result")?;
        println!("{}", rendered);
    } else {
        match outcome {
            Ok(result) => print_summary(&result),
            Err(err) => eprintln!("autoclean: {}", err),
        }
    }
    Ok(code)
}

fn build_config(cli: &Cli) -> Result<CleanupConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => CleanupConfig::from_json_file(path)?,
        None => CleanupConfig::default(),
    };

    if cli.dry_run {
        config.dry_run = true;
    }
    if cli.permanent {
        config.deletion_mode = DeletionMode::Permanent;
    }
    if let Some(staging) = &cli.staging {
        config.deletion_mode = DeletionMode::Staged;
        config.staging_root = Some(staging.clone());
    }
    if let Some(min) = cli.min_size {
        config.min_size = min;
    }
    config.exclude_globs.extend(cli.exclude.iter().cloned());
    if cli.follow_symlinks {
        config.follow_symlinks = true;
    }
    if cli.max_depth.is_some() {
        config.max_depth = cli.max_depth;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(keep) = cli.keep {
        config.keep_strategy = keep.into();
    }
    config.validate()?;
    Ok(config)
}

fn exit_code(outcome: &Result<RunResult, EngineError>) -> ExitCode {
    match outcome {
        Err(_) => ExitCode::from(2),
        Ok(result) if result.cancelled => ExitCode::from(130),
        Ok(result) if !result.errors.is_empty() => ExitCode::from(1),
        Ok(_) => ExitCode::SUCCESS,
    }
}

fn print_summary(result: &RunResult) {
    let heading = if result.dry_run { "Dry run" } else { "Cleanup" };
    println!("{} of {}", heading, result.root.display());
    println!("  scanned:          {} files", result.files_scanned);
    println!(
        "  classified:       {} temporary, {} candidates, {} ignored",
        result.temporary_files, result.duplicate_candidates, result.ignored_files
    );
    println!(
        "  duplicates:       {} groups, {} redundant copies",
        result.duplicate_groups, result.duplicate_files
    );
    if result.dry_run {
        println!(
            "  would remove:     {} files ({})",
            result.planned_deletions,
            ByteSize::b(result.bytes_would_free)
        );
    } else {
        println!(
            "  removed:          {} of {} files ({})",
            result.files_deleted,
            result.planned_deletions,
            ByteSize::b(result.bytes_freed)
        );
        let staged = result.removed.iter().filter(|r| r.staged_to.is_some()).count();
        if staged > 0 {
            println!("  staged:           {} files can be restored", staged);
        }
    }
    if result.cancelled {
        println!("  cancelled before completion");
    }
    if !result.errors.is_empty() {
        println!("  errors:           {}", result.errors.len());
        for err in &result.errors {
            println!("    {}", err);
        }
    }
}
