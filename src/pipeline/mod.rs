//! The phase pipeline: `BOOTSTRAP → IMPLEMENT → REVIEW (+fix) → PR →
//! PERSIST`.
//!
//! One pipeline run drives one or more phases strictly in sequence. Each
//! phase works on its own branch (`phase/<id>-<slug>`); in multi-phase
//! mode the next phase branches off the previous phase's tip rather than
//! the global base, producing stacked branches. Every stage transition is
//! checkpointed before the next stage begins, which makes interrupted
//! runs resumable.

pub mod checkpoint;

use anyhow::Context;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentInvoker, resolve_model};
use crate::config::Config;
use crate::errors::{LoopError, PipelineError};
use crate::git::GitFacade;
use crate::phase::{Phase, PhaseSet};
use crate::prompt;
use crate::ralph::{LoopOutcome, RalphLoop};
use crate::review::{ReviewOrchestrator, Verdict};
use crate::task::load_tasks;
use crate::task_state::TaskStateStore;

use checkpoint::{CheckpointRecord, CheckpointStore, Stage};

/// Which phases a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseSelection {
    Single(String),
    From(String),
    All,
}

/// Per-stage skip switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageFlags {
    pub skip_implement: bool,
    pub skip_review: bool,
    pub skip_fix: bool,
    pub skip_pr: bool,
}

impl StageFlags {
    /// Skipping every real stage leaves nothing to run.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.skip_implement && self.skip_review && self.skip_fix && self.skip_pr {
            return Err(PipelineError::AllStagesSkipped);
        }
        Ok(())
    }
}

/// Outcome of a stage or a whole phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Completed,
    Blocked { reason: String },
    Failed { reason: String },
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Completed => "completed",
            StageStatus::Blocked { .. } => "blocked",
            StageStatus::Failed { .. } => "failed",
            StageStatus::Skipped => "skipped",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            StageStatus::Blocked { reason } | StageStatus::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn is_completed_or_skipped(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Skipped)
    }
}

/// Result of one phase.
#[derive(Debug, Clone)]
pub struct PhaseResult {
    pub phase_id: String,
    pub branch: String,
    pub status: StageStatus,
    pub run_dir: PathBuf,
    pub review_verdict: Option<Verdict>,
    pub review_cycles: u32,
    pub fix_cycles: u32,
}

/// Drives phases through the five stages.
pub struct PhasePipeline {
    pub config: Config,
    pub flags: StageFlags,
    /// The run's global base branch (e.g. `main`).
    pub base_branch: String,
}

impl PhasePipeline {
    pub fn new(config: Config, flags: StageFlags, base_branch: String) -> Self {
        Self {
            config,
            flags,
            base_branch,
        }
    }

    /// Run the selected phases strictly in sequence, chaining branches.
    ///
    /// A blocked or failed phase halts the run after persisting; phases
    /// already completed keep their artifacts.
    pub async fn run(
        &self,
        selection: PhaseSelection,
        cancel: &CancellationToken,
    ) -> Result<Vec<PhaseResult>, PipelineError> {
        self.flags.validate()?;
        self.config
            .ensure_directories()
            .map_err(PipelineError::Other)?;
        let _lock = self
            .config
            .acquire_run_lock()
            .map_err(PipelineError::Other)?;

        let phase_set =
            PhaseSet::load(&self.config.phases_file).map_err(PipelineError::Other)?;
        let tasks = load_tasks(&self.config.tasks_dir).map_err(PipelineError::Other)?;
        phase_set
            .validate_against_tasks(&tasks)
            .map_err(PipelineError::Other)?;

        let phases: Vec<&Phase> = match &selection {
            PhaseSelection::Single(id) => {
                vec![phase_set.get(id).ok_or_else(|| PipelineError::UnknownPhase {
                    id: id.clone(),
                })?]
            }
            PhaseSelection::From(id) => {
                let tail = phase_set
                    .from_phase(id)
                    .map_err(|_| PipelineError::UnknownPhase { id: id.clone() })?;
                tail
            }
            PhaseSelection::All => phase_set.phases.iter().collect(),
        };

        let mut results = Vec::new();
        let mut chain_base = self.base_branch.clone();

        for phase in phases {
            let result = self.run_phase(phase, &chain_base, cancel).await?;
            let completed = result.status == StageStatus::Completed;
            let branch = result.branch.clone();
            results.push(result);
            if !completed {
                break;
            }
            // The next phase stacks on this phase's tip.
            chain_base = branch;
        }

        Ok(results)
    }

    /// Run a single phase through all five stages.
    pub async fn run_phase(
        &self,
        phase: &Phase,
        chain_base: &str,
        cancel: &CancellationToken,
    ) -> Result<PhaseResult, PipelineError> {
        let git = GitFacade::open(&self.config.project_root).await?;
        let store = TaskStateStore::new(&self.config.state_file);
        let tasks = load_tasks(&self.config.tasks_dir).map_err(PipelineError::Other)?;

        let checkpoints = CheckpointStore::new(&self.config.runs_dir);
        let (run_dir, run_id) = checkpoints
            .create_run_dir(&phase.id)
            .map_err(PipelineError::Other)?;
        let branch = phase.branch_name();
        let mut record = CheckpointRecord::new(&run_id, &phase.id, &branch, chain_base);
        record.set("implement_agent", &self.config.toml.agents.implementer.name);

        banner(&format!(
            "{} phase {} - {} [{}]",
            phase.icon, phase.id, phase.title, branch
        ));

        // ---- BOOTSTRAP ----
        self.bootstrap(&git, phase, chain_base).await?;
        record.set_stage(Stage::Bootstrap, "completed", None);
        checkpoints
            .write(&run_dir, &mut record)
            .map_err(PipelineError::Other)?;

        let mut result = PhaseResult {
            phase_id: phase.id.clone(),
            branch: branch.clone(),
            status: StageStatus::Completed,
            run_dir: run_dir.clone(),
            review_verdict: None,
            review_cycles: 0,
            fix_cycles: 0,
        };

        // ---- IMPLEMENT ----
        let implement_status = if self.flags.skip_implement {
            StageStatus::Skipped
        } else {
            self.implement(&git, &store, &tasks, phase, cancel).await?
        };
        record.set_stage(
            Stage::Implement,
            implement_status.as_str(),
            implement_status.reason(),
        );
        checkpoints
            .write(&run_dir, &mut record)
            .map_err(PipelineError::Other)?;

        if !implement_status.is_completed_or_skipped() {
            tracing::warn!(
                phase = %phase.id,
                status = implement_status.as_str(),
                reason = implement_status.reason().unwrap_or(""),
                "implementation halted the phase"
            );
            result.status = implement_status;
            return Ok(result);
        }

        // ---- REVIEW + FIX ----
        if self.flags.skip_review {
            record.set_stage(Stage::Review, "skipped", None);
            record.set_stage(Stage::Fix, "skipped", None);
            checkpoints
                .write(&run_dir, &mut record)
                .map_err(PipelineError::Other)?;
        } else {
            let review = self
                .review_and_fix(&git, phase, chain_base, &run_dir, cancel, &mut record, &checkpoints)
                .await?;
            result.review_verdict = Some(review.verdict);
            result.review_cycles = review.review_cycles;
            result.fix_cycles = review.fix_cycles;

            if let Some(reason) = review.failure {
                record.set_stage(Stage::Review, "failed", Some(&reason));
                checkpoints
                    .write(&run_dir, &mut record)
                    .map_err(PipelineError::Other)?;
                result.status = StageStatus::Failed { reason };
                return Ok(result);
            }
        }

        // ---- PR ----
        let pr_status = if self.flags.skip_pr {
            StageStatus::Skipped
        } else {
            self.prepare_pr(phase, chain_base, &implement_status, &result, &run_dir)
                .map_err(PipelineError::Other)?;
            StageStatus::Completed
        };
        record.set_stage(Stage::Pr, pr_status.as_str(), None);
        checkpoints
            .write(&run_dir, &mut record)
            .map_err(PipelineError::Other)?;

        // ---- PERSIST ----
        if let Some(verdict) = result.review_verdict {
            record.set("review_verdict", &verdict.to_string());
        }
        record.set("review_cycles", &result.review_cycles.to_string());
        record.set("fix_cycles", &result.fix_cycles.to_string());
        record.set_stage(Stage::Persist, "completed", None);
        checkpoints
            .write(&run_dir, &mut record)
            .map_err(PipelineError::Other)?;

        tracing::info!(phase = %phase.id, branch = %branch, "phase completed");
        Ok(result)
    }

    /// Clean tree required; branch created from (or checked out at) the
    /// chain base.
    async fn bootstrap(
        &self,
        git: &GitFacade,
        phase: &Phase,
        chain_base: &str,
    ) -> Result<(), PipelineError> {
        if !git.is_clean().await? {
            return Err(PipelineError::DirtyWorkingTree);
        }
        let branch = phase.branch_name();
        if git.branch_exists(&branch).await? {
            git.checkout(&branch).await?;
            tracing::info!(%branch, "checked out existing phase branch");
        } else {
            let base_ref = git.resolve_base_ref(chain_base).await?;
            git.create_branch(&branch, &base_ref).await?;
            tracing::info!(%branch, base = %base_ref, "created phase branch");
        }
        Ok(())
    }

    /// Run the implementation loop and map its outcome to a stage status.
    async fn implement(
        &self,
        git: &GitFacade,
        store: &TaskStateStore,
        tasks: &std::collections::BTreeMap<crate::task::TaskId, crate::task::Task>,
        phase: &Phase,
        cancel: &CancellationToken,
    ) -> Result<StageStatus, PipelineError> {
        let agent = self.config.toml.agents.implementer.clone();
        let model = match &agent.model {
            Some(preset) => Some(resolve_model(&agent, preset)?),
            None => None,
        };
        let ralph = RalphLoop {
            git: git.clone(),
            store: store.clone(),
            invoker: AgentInvoker::new(Some(self.config.project_root.clone())),
            agent,
            model,
            tasks: tasks.clone(),
            log_dir: self.config.log_dir.clone(),
            limits: self.config.toml.limits.clone(),
        };

        let outcome = match ralph.run(phase, cancel).await {
            Ok(outcome) => outcome,
            // A signal aborts the whole run, not just the phase.
            Err(LoopError::Interrupted) => return Err(LoopError::Interrupted.into()),
            Err(e) => {
                return Ok(StageStatus::Failed {
                    reason: e.to_string(),
                });
            }
        };

        match outcome {
            LoopOutcome::Blocked { task, reason } => Ok(StageStatus::Blocked {
                reason: match task {
                    Some(task) => format!("{}: {}", task, reason),
                    None => reason,
                },
            }),
            LoopOutcome::PhaseComplete { .. } | LoopOutcome::AllTasksDone { .. } => {
                // Never declare a partial phase successful: the remaining
                // count is verified independently of the agent's word.
                match phase.remaining(store) {
                    Ok(0) => Ok(StageStatus::Completed),
                    Ok(remaining) => Ok(StageStatus::Blocked {
                        reason: format!("{} task(s) remain", remaining),
                    }),
                    Err(e) => Ok(StageStatus::Failed {
                        reason: format!("remaining-task count unverifiable: {}", e),
                    }),
                }
            }
        }
    }

    /// One review pass, then fix/re-review cycles while the verdict
    /// blocks, bounded by `review.max_cycles`.
    #[allow(clippy::too_many_arguments)]
    async fn review_and_fix(
        &self,
        git: &GitFacade,
        phase: &Phase,
        chain_base: &str,
        run_dir: &std::path::Path,
        cancel: &CancellationToken,
        record: &mut CheckpointRecord,
        checkpoints: &CheckpointStore,
    ) -> Result<ReviewLoopResult, PipelineError> {
        let max_cycles = self.config.toml.review.max_cycles;
        let orchestrator = ReviewOrchestrator::new(
            AgentInvoker::new(Some(self.config.project_root.clone())),
            self.config.toml.agents.reviewers.clone(),
            self.config.toml.review.concurrency,
            self.config.reviews_dir.clone(),
        );

        let mut review_cycles = 0u32;
        let mut fix_cycles = 0u32;

        loop {
            review_cycles += 1;
            let base_ref = git.resolve_base_ref(chain_base).await?;
            let diff = git.diff_from(&base_ref).await?;
            let review_prompt = prompt::build_review_prompt(
                &format!("Phase {} - {}", phase.id, phase.title),
                "Follow the conventions already established in this repository.",
                "correctness, security, error handling, tests",
                &diff,
                "full-review",
                run_dir,
            )
            .map_err(PipelineError::Other)?;

            let run = orchestrator
                .run("full-review", &review_prompt, cancel)
                .await
                .map_err(PipelineError::Other)?;
            let verdict = run.consolidated.verdict;

            record.set("review_verdict", &verdict.to_string());
            record.set("review_cycles", &review_cycles.to_string());
            record.set("review_run", &run.dir.display().to_string());
            record.set_stage(Stage::Review, "completed", None);
            checkpoints
                .write(run_dir, record)
                .map_err(PipelineError::Other)?;

            if !verdict.is_blocking() {
                if fix_cycles == 0 {
                    record.set_stage(Stage::Fix, "skipped", None);
                    checkpoints
                        .write(run_dir, record)
                        .map_err(PipelineError::Other)?;
                }
                return Ok(ReviewLoopResult {
                    verdict,
                    review_cycles,
                    fix_cycles,
                    failure: None,
                });
            }

            if self.flags.skip_fix {
                tracing::warn!(%verdict, "blocking verdict, fix stage skipped by flag");
                record.set_stage(Stage::Fix, "skipped", None);
                checkpoints
                    .write(run_dir, record)
                    .map_err(PipelineError::Other)?;
                return Ok(ReviewLoopResult {
                    verdict,
                    review_cycles,
                    fix_cycles,
                    failure: None,
                });
            }

            if review_cycles >= max_cycles {
                let failure = PipelineError::ReviewCyclesExhausted {
                    cycles: review_cycles,
                    verdict: verdict.to_string(),
                }
                .to_string();
                return Ok(ReviewLoopResult {
                    verdict,
                    review_cycles,
                    fix_cycles,
                    failure: Some(failure),
                });
            }

            // ---- FIX ----
            let fixer = self.config.toml.agents.fixer().clone();
            let model = match &fixer.model {
                Some(preset) => Some(resolve_model(&fixer, preset)?),
                None => None,
            };
            let fix_prompt = prompt::build_fix_prompt(&run.consolidated);
            let invoker = AgentInvoker::new(Some(self.config.project_root.clone()));
            let output = invoker
                .invoke(&fixer, model.as_deref(), &fix_prompt, cancel)
                .await
                .map_err(LoopError::from)?;
            if output.exit_code != 0 {
                tracing::warn!(exit_code = output.exit_code, "fix agent exited non-zero");
            }
            fix_cycles += 1;
            record.set("fix_cycles", &fix_cycles.to_string());
            record.set_stage(Stage::Fix, "completed", None);
            checkpoints
                .write(run_dir, record)
                .map_err(PipelineError::Other)?;
        }
    }

    /// Assemble the verification summary and hand the request to the
    /// PR-creation helper (a request file in the run directory).
    fn prepare_pr(
        &self,
        phase: &Phase,
        chain_base: &str,
        implement_status: &StageStatus,
        result: &PhaseResult,
        run_dir: &std::path::Path,
    ) -> anyhow::Result<()> {
        let summary = format!(
            "implementation={}; review_verdict={}; review_cycles={}; fix_cycles={}; artifacts={}",
            implement_status.as_str(),
            result
                .review_verdict
                .map(|v| v.to_string())
                .unwrap_or_else(|| "skipped".to_string()),
            result.review_cycles,
            result.fix_cycles,
            run_dir.display(),
        );

        let request = format!(
            "phase={}\nbranch={}\nbase={}\ntitle={} {}\nverification={}\nartifacts={}\n",
            phase.id,
            result.branch,
            chain_base,
            phase.icon,
            phase.title,
            summary,
            run_dir.display(),
        );
        let path = run_dir.join("pr-request.txt");
        std::fs::write(&path, request)
            .with_context(|| format!("pr: failed to write {}", path.display()))?;
        tracing::info!(request = %path.display(), "PR request prepared");
        Ok(())
    }
}

struct ReviewLoopResult {
    verdict: Verdict,
    review_cycles: u32,
    fix_cycles: u32,
    failure: Option<String>,
}

fn banner(text: &str) {
    println!("{}", console::style(text).bold());
}
