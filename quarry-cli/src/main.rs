//! Quarry CLI: resumable dataset acquisition commands.
//!
//! Commands:
//! - `acquire`: fetch every pending entity of every phase, then finalize
//! - `finalize`: merge partitions into the final dataset, validate, commit
//! - `validate`: build and validate the candidate dataset without committing
//! - `status`: per-phase progress, pending partitions, final dataset metadata
//! - `reset`: clear phase checkpoints so the next acquire starts over

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quarry_core::progress::TracingProgress;
use quarry_core::{Severity, ValidationReport};
use quarry_runner::{FinalizeSummary, Job, JobConfig, JobStatus};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "quarry",
    about = "Quarry: resumable acquisition of partitioned time series"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every pending entity, then merge and validate.
    Acquire {
        /// Path to the job TOML file.
        #[arg(long)]
        config: PathBuf,

        /// Only fetch; leave the partitions for a later `finalize`.
        #[arg(long, default_value_t = false)]
        no_finalize: bool,

        /// After a committed merge of a complete job, clear the checkpoints.
        #[arg(long, default_value_t = false)]
        clear_checkpoints: bool,
    },
    /// Merge partitions into the final dataset and commit if validation passes.
    Finalize {
        /// Path to the job TOML file.
        #[arg(long)]
        config: PathBuf,

        /// After a committed merge of a complete job, clear the checkpoints.
        #[arg(long, default_value_t = false)]
        clear_checkpoints: bool,
    },
    /// Validate the candidate dataset and write the report, without committing.
    Validate {
        /// Path to the job TOML file.
        #[arg(long)]
        config: PathBuf,
    },
    /// Show per-phase progress and the final dataset metadata.
    Status {
        /// Path to the job TOML file.
        #[arg(long)]
        config: PathBuf,

        /// Print machine-readable JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Clear phase checkpoints. Partitions and the final dataset are kept.
    Reset {
        /// Path to the job TOML file.
        #[arg(long)]
        config: PathBuf,

        /// Actually clear (without this flag, only shows what would be cleared).
        #[arg(long, default_value_t = false)]
        confirm: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quarry=info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Acquire {
            config,
            no_finalize,
            clear_checkpoints,
        } => run_acquire(&config, no_finalize, clear_checkpoints),
        Commands::Finalize {
            config,
            clear_checkpoints,
        } => run_finalize(&config, clear_checkpoints),
        Commands::Validate { config } => run_validate(&config),
        Commands::Status { config, json } => run_status(&config, json),
        Commands::Reset { config, confirm } => run_reset(&config, confirm),
    }
}

fn load_job(path: &Path) -> Result<Job> {
    let config = JobConfig::from_file(path)
        .with_context(|| format!("failed to load job config {}", path.display()))?;
    Job::from_config(config).context("failed to resolve job")
}

fn run_acquire(path: &Path, no_finalize: bool, clear_checkpoints: bool) -> Result<()> {
    let job = load_job(path)?;
    let fetcher = job
        .config()
        .build_fetcher()
        .context("failed to build fetch source")?;

    let summary = job
        .acquire(fetcher.as_ref(), &TracingProgress)
        .context("acquisition failed")?;

    println!("Job: {} ({} entities)", job.config().job.name, job.entities().len());
    for phase in &summary.phases {
        println!(
            "  {:<16} fetched {:>5}  empty {:>5}  failed {:>5}  skipped {:>5}  rows {:>8}{}",
            phase.phase,
            phase.fetched,
            phase.empty,
            phase.failed,
            phase.skipped,
            phase.rows_written,
            if phase.job_complete { "  complete" } else { "" }
        );
    }

    if summary.halted {
        eprintln!("Source unavailable; acquisition halted. Re-run after the breaker cooldown.");
        std::process::exit(1);
    }
    if summary.failed() > 0 {
        eprintln!(
            "{} entities failed; re-run `quarry acquire` to retry them.",
            summary.failed()
        );
    }
    if no_finalize {
        return Ok(());
    }

    let fin = job
        .finalize(&TracingProgress, clear_checkpoints)
        .context("finalize failed")?;
    exit_on_uncommitted(&fin);
    Ok(())
}

fn run_finalize(path: &Path, clear_checkpoints: bool) -> Result<()> {
    let job = load_job(path)?;
    let fin = job
        .finalize(&TracingProgress, clear_checkpoints)
        .context("finalize failed")?;
    exit_on_uncommitted(&fin);
    Ok(())
}

/// Quarantined partitions exit 1 (re-run `acquire`); a rejected candidate exits 2.
fn exit_on_uncommitted(fin: &FinalizeSummary) {
    print_finalize(fin);
    if fin.outcome.committed {
        return;
    }
    if !fin.outcome.quarantined.is_empty() {
        eprintln!("Re-run `quarry acquire` to refetch the reopened entities, then finalize again.");
        std::process::exit(1);
    }
    if fin.outcome.report.has_critical() {
        std::process::exit(2);
    }
}

fn run_validate(path: &Path) -> Result<()> {
    let job = load_job(path)?;
    let (candidate, report_path) = job.validate_only().context("validation failed")?;

    println!(
        "Candidate: {} rows from {} partition files{}",
        candidate.table.len(),
        candidate.partitions.len(),
        if candidate.had_prior { " + prior dataset" } else { "" }
    );
    print_report(&candidate.report);
    if !candidate.quarantined.is_empty() {
        println!(
            "Quarantined {} unreadable partition file(s); their entities were reopened for `acquire`.",
            candidate.quarantined.len()
        );
    }
    println!("Report saved to: {}", report_path.display());
    if candidate.report.has_critical() {
        std::process::exit(2);
    }
    Ok(())
}

fn run_status(path: &Path, json: bool) -> Result<()> {
    let job = load_job(path)?;
    let status = job.status().context("failed to read job state")?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status).context("failed to serialize status")?
        );
    } else {
        print_status(&status);
    }
    Ok(())
}

fn run_reset(path: &Path, confirm: bool) -> Result<()> {
    let job = load_job(path)?;
    let phases = job.config().phases();

    if !confirm {
        println!("Would clear {} checkpoint(s):", phases.len());
        for phase in &phases {
            println!("  {}", job.config().checkpoint_store(&phase.name).path().display());
        }
        println!("\nRe-run with --confirm to clear.");
        return Ok(());
    }

    job.reset().context("failed to clear checkpoints")?;
    println!("Cleared {} checkpoint(s).", phases.len());
    Ok(())
}

// ── Output ───────────────────────────────────────────────────────────

fn print_finalize(fin: &FinalizeSummary) {
    let outcome = &fin.outcome;
    println!(
        "Merge: {} inputs, {} rows in, {} rows out, {} superseded",
        outcome.stats.inputs, outcome.stats.input_rows, outcome.stats.output_rows, outcome.stats.superseded
    );
    print_report(&outcome.report);
    match &outcome.meta {
        Some(meta) => println!(
            "Committed: {} rows, {} entities, hash {} ({} partitions consumed)",
            meta.rows,
            meta.entities,
            &meta.data_hash[..meta.data_hash.len().min(16)],
            outcome.partitions_consumed.len()
        ),
        None if !outcome.quarantined.is_empty() => println!(
            "Not committed: {} unreadable partition file(s) quarantined; {} entities reopened.",
            outcome.quarantined.len(),
            fin.reopened.len()
        ),
        None if outcome.report.has_critical() => {
            println!("Rejected: final dataset and partitions left untouched.")
        }
        None => println!("Nothing new to commit."),
    }
    if fin.checkpoints_cleared {
        println!("Checkpoints cleared.");
    }
    println!("Report saved to: {}", fin.report_path.display());
}

fn print_report(report: &ValidationReport) {
    println!("Validation: {}", report.summary());
    for finding in report.findings.iter().filter(|f| f.severity >= Severity::Error).take(20) {
        let key = finding
            .key
            .as_ref()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  [{}] {:<12} {:<24} {}",
            finding.severity, finding.rule, key, finding.message
        );
    }
}

fn print_status(status: &JobStatus) {
    println!("Job: {} ({} entities)", status.job, status.entities);
    for phase in &status.phases {
        let pct = if phase.total > 0 {
            phase.completed as f64 / phase.total as f64 * 100.0
        } else {
            0.0
        };
        let updated = phase
            .last_update
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {:<16} {:>5}/{:<5} ({:>5.1}%)  cursor {:>5}  updated {}{}",
            phase.name,
            phase.completed,
            phase.total,
            pct,
            phase.cursor_index,
            updated,
            if phase.job_complete { "  complete" } else { "" }
        );
        for (entity, runs) in phase.failing.iter().take(10) {
            println!("      failing: {entity} ({runs} runs)");
        }
    }
    println!("Pending partitions: {}", status.pending_partitions);
    match &status.final_dataset {
        Some(meta) => println!(
            "Final dataset: {} rows, {} entities, written {}",
            meta.rows,
            meta.entities,
            meta.written_at.format("%Y-%m-%d %H:%M:%S")
        ),
        None => println!("Final dataset: none"),
    }
}
