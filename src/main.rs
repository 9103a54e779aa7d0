use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use raven::config::Config;
use raven::errors::{LoopError, PipelineError};
use raven::pipeline::checkpoint::CheckpointStore;
use raven::pipeline::{PhasePipeline, PhaseSelection, StageFlags, StageStatus};

/// Exit code for a SIGINT-cancelled run (128 + SIGINT).
const EXIT_INTERRUPTED: i32 = 130;
/// Exit code for a partial or blocked outcome.
const EXIT_PARTIAL: i32 = 2;

#[derive(Parser)]
#[command(name = "raven")]
#[command(version, about = "Workflow orchestrator for AI coding agents")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project root (defaults to $PROJECT_ROOT, then the current dir)
    #[arg(long, global = true)]
    pub project_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full pipeline for one or more phases
    Run {
        /// Phase id, or "all" for every phase
        #[arg(long, default_value = "all")]
        phase: String,
        /// Start at this phase and run to the end
        #[arg(long, conflicts_with = "phase")]
        from_phase: Option<String>,
        /// Base branch the first phase branches from
        #[arg(long, default_value = "main")]
        base: String,
        #[arg(long)]
        skip_implement: bool,
        #[arg(long)]
        skip_review: bool,
        #[arg(long)]
        skip_fix: bool,
        #[arg(long)]
        skip_pr: bool,
    },
    /// Run only the implementation loop for one phase
    Implement {
        #[arg(long)]
        phase: String,
    },
    /// Run one review pass over the diff from a base ref
    Review {
        #[arg(long, default_value = "main")]
        base: String,
    },
    /// Resume the most recent interrupted run
    Resume {
        #[arg(long, default_value = "main")]
        base: String,
    },
    /// Show project, phase and checkpoint status
    Status,
    /// List the configured phases
    Phases,
}

fn init_tracing(verbose: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_env("RAVEN_LOG").unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    let code = match run_command(&cli, &cancel).await {
        Ok(code) => code,
        Err(e) => {
            if is_interrupted(&e) {
                EXIT_INTERRUPTED
            } else {
                eprintln!("error: {:#}", e);
                1
            }
        }
    };
    std::process::exit(code);
}

fn is_interrupted(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::Loop(LoopError::Interrupted))
    ) || matches!(err.downcast_ref::<LoopError>(), Some(LoopError::Interrupted))
}

async fn run_command(cli: &Cli, cancel: &CancellationToken) -> Result<i32> {
    match &cli.command {
        Commands::Run {
            phase,
            from_phase,
            base,
            skip_implement,
            skip_review,
            skip_fix,
            skip_pr,
        } => {
            let config = Config::new(cli.project_root.clone(), cli.verbose)?;
            let flags = StageFlags {
                skip_implement: *skip_implement,
                skip_review: *skip_review,
                skip_fix: *skip_fix,
                skip_pr: *skip_pr,
            };
            let selection = match from_phase {
                Some(id) => PhaseSelection::From(id.clone()),
                None if phase == "all" => PhaseSelection::All,
                None => PhaseSelection::Single(phase.clone()),
            };
            let pipeline = PhasePipeline::new(config, flags, base.clone());
            let results = pipeline.run(selection, cancel).await?;
            Ok(report_results(&results))
        }
        Commands::Implement { phase } => cmd_implement(cli, phase, cancel).await,
        Commands::Review { base } => cmd_review(cli, base, cancel).await,
        Commands::Resume { base } => cmd_resume(cli, base, cancel).await,
        Commands::Status => cmd_status(cli),
        Commands::Phases => cmd_phases(cli),
    }
}

fn report_results(results: &[raven::pipeline::PhaseResult]) -> i32 {
    let mut code = 0;
    for result in results {
        let line = match &result.status {
            StageStatus::Completed => format!("phase {}: completed ({})", result.phase_id, result.branch),
            StageStatus::Blocked { reason } => {
                format!("phase {}: blocked - {}", result.phase_id, reason)
            }
            StageStatus::Failed { reason } => {
                format!("phase {}: failed - {}", result.phase_id, reason)
            }
            StageStatus::Skipped => format!("phase {}: skipped", result.phase_id),
        };
        println!("{}", line);
        match &result.status {
            StageStatus::Blocked { .. } if code == 0 => code = EXIT_PARTIAL,
            StageStatus::Failed { .. } => code = 1,
            _ => {}
        }
    }
    code
}

async fn cmd_implement(cli: &Cli, phase_id: &str, cancel: &CancellationToken) -> Result<i32> {
    use raven::agent::{resolve_model, AgentInvoker};
    use raven::git::GitFacade;
    use raven::phase::PhaseSet;
    use raven::ralph::{LoopOutcome, RalphLoop};
    use raven::task::load_tasks;
    use raven::task_state::TaskStateStore;

    let config = Config::new(cli.project_root.clone(), cli.verbose)?;
    config.ensure_directories()?;
    let _lock = config.acquire_run_lock()?;

    let phase_set = PhaseSet::load(&config.phases_file)?;
    let tasks = load_tasks(&config.tasks_dir)?;
    phase_set.validate_against_tasks(&tasks)?;
    let phase = phase_set
        .get(phase_id)
        .with_context(|| format!("unknown phase '{}'", phase_id))?;

    let agent = config.toml.agents.implementer.clone();
    let model = match &agent.model {
        Some(preset) => Some(resolve_model(&agent, preset)?),
        None => None,
    };
    let store = TaskStateStore::new(&config.state_file);
    let ralph = RalphLoop {
        git: GitFacade::open(&config.project_root).await?,
        store: store.clone(),
        invoker: AgentInvoker::new(Some(config.project_root.clone())),
        agent,
        model,
        tasks,
        log_dir: config.log_dir.clone(),
        limits: config.toml.limits.clone(),
    };

    match ralph.run(phase, cancel).await {
        Ok(LoopOutcome::PhaseComplete { iterations })
        | Ok(LoopOutcome::AllTasksDone { iterations }) => {
            let remaining = phase.remaining(&store)?;
            if remaining == 0 {
                println!("phase {} implemented in {} iteration(s)", phase.id, iterations);
                Ok(0)
            } else {
                println!("phase {}: {} task(s) remain", phase.id, remaining);
                Ok(EXIT_PARTIAL)
            }
        }
        Ok(LoopOutcome::Blocked { task, reason }) => {
            match task {
                Some(task) => println!("blocked at {}: {}", task, reason),
                None => println!("blocked: {}", reason),
            }
            Ok(EXIT_PARTIAL)
        }
        Err(LoopError::Interrupted) => Ok(EXIT_INTERRUPTED),
        Err(e) => Err(e.into()),
    }
}

async fn cmd_review(cli: &Cli, base: &str, cancel: &CancellationToken) -> Result<i32> {
    use raven::agent::AgentInvoker;
    use raven::git::GitFacade;
    use raven::prompt::build_review_prompt;
    use raven::review::ReviewOrchestrator;

    let config = Config::new(cli.project_root.clone(), cli.verbose)?;
    config.ensure_directories()?;

    let git = GitFacade::open(&config.project_root).await?;
    let base_ref = git.resolve_base_ref(base).await?;
    let diff = git.diff_from(&base_ref).await?;
    if diff.trim().is_empty() {
        println!("no changes against {}", base_ref);
        return Ok(0);
    }

    let orchestrator = ReviewOrchestrator::new(
        AgentInvoker::new(Some(config.project_root.clone())),
        config.toml.agents.reviewers.clone(),
        config.toml.review.concurrency,
        config.reviews_dir.clone(),
    );
    // The prompt builder may externalise a large diff into the run
    // directory, so stage it under the reviews dir.
    let scratch = config.reviews_dir.join("prompt-scratch");
    std::fs::create_dir_all(&scratch)?;
    let prompt = build_review_prompt(
        "Review the current branch against its base.",
        "Follow the conventions already established in this repository.",
        "correctness, security, error handling, tests",
        &diff,
        "full-review",
        &scratch,
    )?;

    let run = orchestrator.run("full-review", &prompt, cancel).await?;
    println!(
        "verdict: {} ({} unique findings, report: {})",
        run.consolidated.verdict,
        run.consolidated.stats.unique_findings,
        run.dir.join("report.md").display()
    );

    if run.consolidated.verdict.is_blocking() || run.consolidated.stats.unique_findings > 0 {
        Ok(EXIT_PARTIAL)
    } else {
        Ok(0)
    }
}

async fn cmd_resume(cli: &Cli, base: &str, cancel: &CancellationToken) -> Result<i32> {
    use raven::pipeline::checkpoint::Stage;

    let config = Config::new(cli.project_root.clone(), cli.verbose)?;
    let checkpoints = CheckpointStore::new(&config.runs_dir);

    let Some((run_dir, mut record)) = checkpoints.find_resumable()? else {
        println!("nothing to resume");
        return Ok(0);
    };
    let phase_id = record
        .phase_id()
        .context("checkpoint is missing phase_id")?
        .to_string();
    let resume_stage = record
        .resume_stage()
        .context("checkpoint has no stage left to resume")?;
    let base_branch = record.base_branch().unwrap_or(base).to_string();

    println!(
        "resuming phase {} at stage {} (from {})",
        phase_id,
        resume_stage,
        run_dir.display()
    );

    // Only the final persist transition was lost: finish the existing
    // record in place, no agents involved.
    if resume_stage == Stage::Persist {
        record.set_stage(Stage::Persist, "completed", None);
        checkpoints.write(&run_dir, &mut record)?;
        println!("phase {}: persisted", phase_id);
        return Ok(0);
    }

    // Stages already persisted as done stay done; the pipeline re-enters
    // at the first incomplete stage on the same branch.
    let done = |stage: Stage| {
        matches!(
            record.stage_status(stage),
            Some("completed") | Some("skipped")
        )
    };
    let flags = StageFlags {
        skip_implement: done(Stage::Implement),
        skip_review: done(Stage::Review),
        skip_fix: done(Stage::Fix),
        skip_pr: done(Stage::Pr),
    };

    let pipeline = PhasePipeline::new(config, flags, base_branch);
    let results = pipeline
        .run(PhaseSelection::Single(phase_id), cancel)
        .await?;
    Ok(report_results(&results))
}

fn cmd_status(cli: &Cli) -> Result<i32> {
    use raven::phase::PhaseSet;
    use raven::task_state::TaskStateStore;

    let config = Config::new(cli.project_root.clone(), cli.verbose)?;

    println!();
    println!("Raven project status");
    println!("====================");
    println!();

    if !config.phases_file.exists() {
        println!("Phases:  missing ({})", config.phases_file.display());
        println!();
        println!("Create the phases file to start using raven.");
        return Ok(0);
    }

    let phase_set = PhaseSet::load(&config.phases_file)?;
    let store = TaskStateStore::new(&config.state_file);

    println!("Phases:  {} defined", phase_set.phases.len());
    for phase in &phase_set.phases {
        let total = phase.task_range().len();
        let remaining = phase.remaining(&store)?;
        println!(
            "  {} phase {:<3} {:<24} {:>2}/{} tasks done",
            phase.icon,
            phase.id,
            phase.title,
            total - remaining,
            total
        );
    }

    let checkpoints = CheckpointStore::new(&config.runs_dir);
    match checkpoints.find_resumable()? {
        Some((run_dir, record)) => {
            println!();
            println!(
                "Resumable run: phase {} at stage {} ({})",
                record.phase_id().unwrap_or("?"),
                record
                    .resume_stage()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "?".to_string()),
                run_dir.display()
            );
        }
        None => {
            println!();
            println!("No resumable run.");
        }
    }
    println!();
    Ok(0)
}

fn cmd_phases(cli: &Cli) -> Result<i32> {
    use raven::phase::PhaseSet;

    let config = Config::new(cli.project_root.clone(), cli.verbose)?;
    let phase_set = PhaseSet::load(&config.phases_file)?;

    println!();
    println!("{:<6} {:<16} {:<12} {}", "Phase", "Slug", "Range", "Title");
    println!("{:<6} {:<16} {:<12} {}", "-----", "----", "-----", "-----");
    for phase in &phase_set.phases {
        println!(
            "{:<6} {:<16} {:<12} {}",
            phase.id,
            phase.slug,
            format!("{}..{}", phase.start, phase.end),
            phase.title
        );
    }
    println!();
    Ok(0)
}
