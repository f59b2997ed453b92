//! CLI binary for running and validating Verdict pipelines.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use verdict_pipeline::{
    default_registry, validate_with_registry, AuditStore, BatchConfig, BatchRunner,
    DispositionMode, FsAuditStore, FsDataSource, FsDisposer, PipelineEngine, PipelineSpec, Route,
    Severity,
};
use verdict_types::{ArtifactId, FinalStatus};

#[derive(Parser)]
#[command(name = "verdict", version, about = "Staged evaluation pipeline for scientific artifacts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run artifacts through a pipeline
    Run {
        /// Path to the pipeline JSON config
        config: PathBuf,

        /// Artifact files or directories
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Audit trail directory
        #[arg(long, default_value = ".verdict/audit")]
        audit: PathBuf,

        /// Disposition root; artifacts are left in place when omitted
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Move artifacts into their bucket instead of copying
        #[arg(long = "move", requires = "out")]
        move_artifacts: bool,

        /// Maximum artifacts evaluated at once
        #[arg(long, default_value = "4")]
        concurrency: usize,

        /// Glob filter applied when walking directories (repeatable)
        #[arg(short, long)]
        pattern: Vec<String>,
    },

    /// Validate a pipeline config
    Validate {
        /// Path to the pipeline JSON config
        config: PathBuf,
    },

    /// Show information about a pipeline
    Info {
        /// Path to the pipeline JSON config
        config: PathBuf,
    },

    /// Show the recorded runs of an artifact
    History {
        /// Audit trail directory
        #[arg(long, default_value = ".verdict/audit")]
        audit: PathBuf,

        /// Artifact id; lists known artifacts when omitted
        artifact_id: Option<String>,

        /// Print full run records as JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            config,
            inputs,
            audit,
            out,
            move_artifacts,
            concurrency,
            pattern,
        } => {
            let mode = if move_artifacts {
                DispositionMode::Move
            } else {
                DispositionMode::Copy
            };
            cmd_run(&config, &inputs, &audit, out.as_deref(), mode, concurrency, &pattern).await?;
        }
        Commands::Validate { config } => {
            cmd_validate(&config)?;
        }
        Commands::Info { config } => {
            cmd_info(&config)?;
        }
        Commands::History {
            audit,
            artifact_id,
            json,
        } => {
            cmd_history(&audit, artifact_id.as_deref(), json).await?;
        }
    }

    Ok(())
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let spec = PipelineSpec::load(path)?;
    let mut registry = default_registry();
    registry.register_defs(&spec.criteria)?;
    let diagnostics = validate_with_registry(&spec, &registry);

    if diagnostics.is_empty() {
        println!("Pipeline is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        let location = match (&diag.stage_id, &diag.criterion) {
            (Some(stage), Some(criterion)) => format!(" [{stage}/{criterion}]"),
            (Some(stage), None) => format!(" [{stage}]"),
            _ => String::new(),
        };
        println!("[{}] {}{}: {}", severity, diag.rule, location, diag.message);
        if let Some(fix) = &diag.fix {
            println!("    fix: {fix}");
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let spec = PipelineSpec::load(path)?;

    println!("Pipeline: {}", spec.name);
    println!("Stages: {}", spec.stages.len());
    println!(
        "Gates: quality >= {:.2}, confidence >= {:.2} (warning below {:.2}, decay {:.2})",
        spec.gates.quality_min,
        spec.gates.confidence_min,
        spec.gates.soft_warning_threshold,
        spec.gates.warning_decay
    );
    if !spec.criteria.is_empty() {
        let names: Vec<&str> = spec.criteria.iter().map(|c| c.name()).collect();
        println!("Declared criteria: {}", names.join(", "));
    }

    println!("\nStages:");
    for (i, stage) in spec.stages.iter().enumerate() {
        let threshold = stage
            .pass_threshold
            .map(|t| format!("{t:.2}"))
            .unwrap_or_else(|| "(missing)".to_string());
        let next = match &stage.on_pass {
            Some(Route::Stage(id)) => id.clone(),
            Some(Route::Terminal(status)) => status.to_string(),
            None => spec
                .stages
                .get(i + 1)
                .map(|s| s.id.clone())
                .unwrap_or_else(|| "gates".to_string()),
        };
        println!(
            "  {} threshold={} pass->{} fail->{}",
            stage.id, threshold, next, stage.on_fail.status
        );
        for binding in &stage.criteria {
            let hard = if stage.hard_fail.contains(&binding.criterion) {
                " (hard fail)"
            } else {
                ""
            };
            println!("    {} w={:.2}{}", binding.criterion, binding.weight, hard);
        }
        if let Some(repro) = &stage.reproducibility {
            println!(
                "    reproducibility: {} trials, agreement >= {:.2}",
                repro.n_trials, repro.agreement_threshold
            );
        }
    }

    Ok(())
}

async fn cmd_run(
    config: &Path,
    inputs: &[PathBuf],
    audit_dir: &Path,
    out: Option<&Path>,
    mode: DispositionMode,
    concurrency: usize,
    patterns: &[String],
) -> anyhow::Result<()> {
    let spec = PipelineSpec::load(config)?;
    let engine = PipelineEngine::from_spec(spec)?;

    let source = FsDataSource::new(patterns)?;
    let artifacts = source.load_all(inputs).await?;
    if artifacts.is_empty() {
        anyhow::bail!("No artifacts found in the given inputs");
    }
    tracing::debug!(inputs = inputs.len(), artifacts = artifacts.len(), "Artifacts loaded");

    println!("Running pipeline: {}", engine.spec().name);
    println!("Artifacts: {}", artifacts.len());
    println!("Audit: {}", audit_dir.display());
    if let Some(root) = out {
        println!("Disposition: {} ({:?})", root.display(), mode);
    }

    let audit: Arc<dyn AuditStore> = Arc::new(FsAuditStore::new(audit_dir)?);
    let mut runner = BatchRunner::new(engine, audit).with_config(BatchConfig {
        max_concurrent: concurrency,
    });
    if let Some(root) = out {
        runner = runner.with_disposer(FsDisposer::new(root, mode));
    }

    let report = runner.run(artifacts).await;

    println!();
    for item in &report.items {
        println!("{}", item.run.summary());
        if let Some(Ok(disposed)) = &item.disposition {
            println!("    -> {} ({:?})", disposed.destination.display(), disposed.action);
        }
    }

    println!();
    for status in [
        FinalStatus::Approved,
        FinalStatus::Conditional,
        FinalStatus::NeedsRevision,
        FinalStatus::Rejected,
        FinalStatus::Error,
    ] {
        let count = report.count(status);
        if count > 0 {
            println!("{}: {}", status, count);
        }
    }

    let failures: Vec<_> = report.failures().collect();
    for item in &failures {
        if let Err(e) = &item.audit {
            eprintln!("audit failed for {}: {}", item.run.artifact_name, e);
        }
        if let Some(Err(e)) = &item.disposition {
            eprintln!("disposition failed for {}: {}", item.run.artifact_name, e);
        }
    }
    if !failures.is_empty() {
        anyhow::bail!("{} artifact(s) could not be recorded or disposed", failures.len());
    }

    Ok(())
}

async fn cmd_history(
    audit_dir: &Path,
    artifact_id: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let store = FsAuditStore::new(audit_dir)?;

    let Some(id) = artifact_id else {
        let ids = store.artifacts().await?;
        if ids.is_empty() {
            println!("No recorded artifacts in {}", audit_dir.display());
        }
        for id in ids {
            let runs = store.history(&id).await?;
            let latest = runs
                .last()
                .map(|r| r.final_status.to_string())
                .unwrap_or_default();
            println!("{}  runs={}  latest={}", id, runs.len(), latest);
        }
        return Ok(());
    };

    let id = ArtifactId::new(id)?;
    let runs = store.history(&id).await?;
    if runs.is_empty() {
        anyhow::bail!("No runs recorded for artifact {}", id);
    }

    for run in &runs {
        if json {
            println!("{}", serde_json::to_string(run)?);
            continue;
        }
        println!(
            "{}  {}  {}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.run_id,
            run.summary()
        );
        for outcome in &run.outcomes {
            let mark = if outcome.passed { "pass" } else { "fail" };
            println!("    {:<20} {:.3} {}", outcome.stage_id, outcome.aggregate_score, mark);
        }
        for report in &run.reproducibility {
            println!(
                "    reproducibility {}: success {:.2}, agreement {:.3}",
                report.stage_id, report.success_rate, report.agreement_level
            );
        }
    }

    Ok(())
}
