//! The implementation loop: one task per iteration, fresh agent each
//! time.
//!
//! Each iteration selects the next eligible task, reconciles the working
//! tree, invokes the agent in a fresh subprocess and classifies its
//! output:
//!
//! ```text
//! [SELECT_TASK] → [RECOVER_TREE] → [INVOKE_AGENT] → [CLASSIFY_OUTPUT]
//!      PHASE_COMPLETE → stop        RATE_LIMITED → stash, cooldown, pop
//!      TASK_BLOCKED   → stop        PROGRESS_MADE → commit recovery
//!      RALPH_ERROR    → retry       NO_PROGRESS   → count toward stall
//! ```
//!
//! Three counters bound the loop: the hard iteration cap, the
//! consecutive-unproductive-iteration counter (abort at 3) and the
//! rate-limit wait cap.

use anyhow::Context;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentConfig, AgentInvoker};
use crate::config::LimitsSection;
use crate::cooldown;
use crate::errors::{AdapterError, LoopError};
use crate::git::GitFacade;
use crate::phase::Phase;
use crate::prompt;
use crate::ratelimit;
use crate::recovery::{self, RecoveryOutcome};
use crate::selector::{select_next, Selection};
use crate::signals::{classify_output, OutputClass};
use crate::task::{Task, TaskId};
use crate::task_state::{TaskStateStore, TaskStatus};

/// Consecutive unproductive iterations before the loop aborts.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// How the loop ended, when it ended on its own terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// The agent signalled `PHASE_COMPLETE`.
    PhaseComplete { iterations: u32 },
    /// The selector found no work left in the range.
    AllTasksDone { iterations: u32 },
    /// The agent signalled a block, or dependencies cannot be met.
    Blocked { task: Option<TaskId>, reason: String },
}

/// The per-phase implementation loop.
pub struct RalphLoop {
    pub git: GitFacade,
    pub store: TaskStateStore,
    pub invoker: AgentInvoker,
    pub agent: AgentConfig,
    /// Fully resolved model id, if any.
    pub model: Option<String>,
    pub tasks: BTreeMap<TaskId, Task>,
    pub log_dir: PathBuf,
    pub limits: LimitsSection,
}

impl RalphLoop {
    pub async fn run(
        &self,
        phase: &Phase,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome, LoopError> {
        let range = phase.task_range();
        let mut iteration: u32 = 0;
        let mut consecutive_errors: u32 = 0;
        let mut rate_limit_waits: u32 = 0;
        let mut last_attempted: Option<TaskId> = None;
        // Set after a post-cooldown stash pop: the dirty tree is the
        // restored partial work, not debris to reconcile away.
        let mut resume_with_dirty_tree = false;
        let mut prompt_files: Vec<PathBuf> = Vec::new();

        std::fs::create_dir_all(&self.log_dir)
            .context("loop: failed to create log dir")
            .map_err(LoopError::Other)?;

        loop {
            if cancel.is_cancelled() {
                return Err(self.interrupted(&prompt_files).await);
            }

            iteration += 1;
            if iteration > self.limits.max_iterations {
                return Err(LoopError::IterationCapReached {
                    cap: self.limits.max_iterations,
                });
            }

            // SELECT_TASK - exactly one task per iteration.
            let task_id = match select_next(&range, &self.tasks, &self.store)
                .map_err(LoopError::Other)?
            {
                Selection::Ready(id) => id,
                Selection::Empty => {
                    tracing::info!(phase = %phase.id, "no work left in phase range");
                    return Ok(LoopOutcome::AllTasksDone {
                        iterations: iteration - 1,
                    });
                }
                Selection::Blocked { task, missing } => {
                    let deps: Vec<String> = missing.iter().map(ToString::to_string).collect();
                    let reason = format!("{} is waiting on {}", task, deps.join(", "));
                    return Ok(LoopOutcome::Blocked {
                        task: Some(task),
                        reason,
                    });
                }
            };

            // RECOVER_TREE
            if resume_with_dirty_tree {
                resume_with_dirty_tree = false;
            } else {
                match recovery::recover_dirty_tree(
                    &self.git,
                    &self.store,
                    last_attempted,
                    "loop restart",
                )
                .await
                .map_err(LoopError::Other)?
                {
                    RecoveryOutcome::AutoCommitFailed { detail } => {
                        tracing::warn!(%detail, "auto-commit recovery created no commit");
                    }
                    outcome => tracing::debug!(?outcome, "pre-iteration reconciliation"),
                }
            }

            last_attempted = Some(task_id);
            let task = self
                .tasks
                .get(&task_id)
                .ok_or_else(|| LoopError::Other(anyhow::anyhow!("no spec for {}", task_id)))?;
            self.store
                .set(task_id, TaskStatus::InProgress)
                .map_err(LoopError::Other)?;

            // Pre-invocation snapshot for the progress definitions.
            let remaining_before = phase.remaining(&self.store).map_err(LoopError::Other)?;
            let head_before = self.git.head_sha().await?;

            tracing::info!(
                iteration,
                cap = self.limits.max_iterations,
                task = %task_id,
                remaining = remaining_before,
                "invoking agent"
            );

            // INVOKE_AGENT - fresh subprocess, prompt via stdin.
            let prompt = prompt::build_implement_prompt(phase, task);
            let prompt_file = self
                .log_dir
                .join(format!("phase-{}-iter-{}-prompt.md", phase.id, iteration));
            std::fs::write(&prompt_file, &prompt)
                .context("loop: failed to write prompt file")
                .map_err(LoopError::Other)?;
            prompt_files.push(prompt_file);

            let output = match self
                .invoker
                .invoke(&self.agent, self.model.as_deref(), &prompt, cancel)
                .await
            {
                Ok(output) => output,
                Err(AdapterError::Io(ref e)) if e.kind() == std::io::ErrorKind::Interrupted => {
                    return Err(self.interrupted(&prompt_files).await);
                }
                Err(e) => return Err(e.into()),
            };

            let output_file = self
                .log_dir
                .join(format!("phase-{}-iter-{}-output.log", phase.id, iteration));
            if let Err(e) = std::fs::write(&output_file, &output.output) {
                tracing::warn!(error = %e, "failed to write agent output log");
            }

            // CLASSIFY_OUTPUT
            match classify_output(&output.output) {
                OutputClass::RateLimited => {
                    tracing::warn!(task = %task_id, "agent reported a rate limit");
                    let mut stash_committed = false;
                    match recovery::recover_dirty_tree(
                        &self.git,
                        &self.store,
                        Some(task_id),
                        "rate-limit",
                    )
                    .await
                    .map_err(LoopError::Other)?
                    {
                        RecoveryOutcome::Stashed { .. } => stash_committed = true,
                        outcome => tracing::debug!(?outcome, "rate-limit reconciliation"),
                    }

                    let wait_secs = match ratelimit::parse_reset_wait(&output.output, Utc::now()) {
                        Some(raw) => ratelimit::wait_with_buffer(raw, self.limits.max_wait_secs),
                        None => ratelimit::backoff_delay_secs(rate_limit_waits)
                            .min(self.limits.max_wait_secs),
                    };
                    cooldown::wait_for_rate_limit_reset(
                        wait_secs,
                        rate_limit_waits,
                        self.limits.max_rate_limit_waits,
                    )
                    .await?;
                    rate_limit_waits += 1;

                    if stash_committed {
                        recovery::pop_rate_limit_stash(&self.git).await?;
                        resume_with_dirty_tree = true;
                    }
                }
                OutputClass::PhaseComplete => {
                    tracing::info!(iterations = iteration, "agent signalled phase complete");
                    return Ok(LoopOutcome::PhaseComplete {
                        iterations: iteration,
                    });
                }
                OutputClass::TaskBlocked(reason) => {
                    self.store
                        .set(task_id, TaskStatus::Blocked)
                        .map_err(LoopError::Other)?;
                    tracing::warn!(task = %task_id, %reason, "agent signalled a block");
                    return Ok(LoopOutcome::Blocked {
                        task: Some(task_id),
                        reason,
                    });
                }
                OutputClass::RalphError(reason) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        task = %task_id,
                        %reason,
                        consecutive_errors,
                        "agent reported an error"
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        return Err(LoopError::ProgressStalled {
                            iterations: consecutive_errors,
                        });
                    }
                }
                OutputClass::Narrative => {
                    let remaining_after =
                        phase.remaining(&self.store).map_err(LoopError::Other)?;
                    let head_after = self.git.head_sha().await?;
                    let progress_made = remaining_after < remaining_before;
                    let commit_made = head_after != head_before;

                    if progress_made {
                        if !commit_made {
                            // The agent finished the task but forgot to
                            // commit; the task still counts as completed.
                            match recovery::auto_commit(&self.git, task_id).await {
                                Ok(Some(sha)) => {
                                    tracing::info!(%sha, "auto-committed completed work")
                                }
                                Ok(None) => tracing::warn!(
                                    task = %task_id,
                                    "progress made but auto-commit created no commit"
                                ),
                                Err(e) => tracing::warn!(
                                    task = %task_id,
                                    error = %e,
                                    "auto-commit after progress failed"
                                ),
                            }
                        }
                        consecutive_errors = 0;
                        rate_limit_waits = 0;
                        tracing::info!(
                            task = %task_id,
                            remaining = remaining_after,
                            "iteration completed a task"
                        );
                    } else {
                        consecutive_errors += 1;
                        tracing::warn!(
                            task = %task_id,
                            exit_code = output.exit_code,
                            consecutive_errors,
                            "iteration made no progress"
                        );
                        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                            return Err(LoopError::ProgressStalled {
                                iterations: consecutive_errors,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Signal-exit path: warn about a dirty tree once, never auto-stash,
    /// remove temp prompt files.
    async fn interrupted(&self, prompt_files: &[PathBuf]) -> LoopError {
        match self.git.is_clean().await {
            Ok(false) => {
                tracing::warn!("interrupted with uncommitted changes in the working tree")
            }
            Ok(true) => {}
            Err(e) => tracing::warn!(error = %e, "could not check working tree on interrupt"),
        }
        for file in prompt_files {
            let _ = std::fs::remove_file(file);
        }
        LoopError::Interrupted
    }
}
