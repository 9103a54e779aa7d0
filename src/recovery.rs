//! Dirty-tree reconciliation between loop iterations.
//!
//! A dirty working tree at an iteration boundary means the previous agent
//! run was cut short. Two protocols apply:
//!
//! - the last attempted task is marked `completed` → the work is good,
//!   auto-commit it;
//! - otherwise → the work is partial, park it in a named stash so the
//!   next iteration starts from a clean tree.
//!
//! A stash created for a rate-limit interruption is popped after the
//! cooldown so the partial work is back on disk; the *caller* tracks that
//! commitment with a local flag rather than inferring it from the stash
//! log.

use anyhow::Result;

use crate::errors::GitError;
use crate::git::GitFacade;
use crate::task::TaskId;
use crate::task_state::TaskStateStore;

/// What the reconciliation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Nothing to do.
    CleanTree,
    /// Completed work was committed.
    AutoCommitted { sha: String },
    /// Partial work was parked in a named stash.
    Stashed { name: String },
    /// Auto-commit was warranted but produced no commit (e.g. only
    /// ignored files changed); logged as a warning by the caller.
    AutoCommitFailed { detail: String },
}

/// Reconcile a dirty tree before the next iteration.
///
/// `last_task` is the task the previous iteration attempted, if any;
/// `reason` records the interrupting context in the stash name.
pub async fn recover_dirty_tree(
    git: &GitFacade,
    store: &TaskStateStore,
    last_task: Option<TaskId>,
    reason: &str,
) -> Result<RecoveryOutcome> {
    if git.is_clean().await? {
        return Ok(RecoveryOutcome::CleanTree);
    }

    if let Some(task) = last_task {
        if store.status_of(task)?.is_completed() {
            return match auto_commit(git, task).await? {
                Some(sha) => {
                    tracing::info!(%task, %sha, "auto-commit recovery");
                    Ok(RecoveryOutcome::AutoCommitted { sha })
                }
                None => Ok(RecoveryOutcome::AutoCommitFailed {
                    detail: format!("no new commit created for {}", task),
                }),
            };
        }
    }

    let context = match last_task {
        Some(task) => task.to_string(),
        None => "unassigned work".to_string(),
    };
    let name = format!("raven: {} during {}", reason, context);
    if git.stash_push(&name).await? {
        tracing::info!(stash = %name, "stash recovery");
        Ok(RecoveryOutcome::Stashed { name })
    } else {
        // The tree was racing toward clean; nothing to park.
        Ok(RecoveryOutcome::CleanTree)
    }
}

/// Stage everything and commit as an automated recovery for `task`.
///
/// Returns the new sha only when a commit was actually created.
pub async fn auto_commit(git: &GitFacade, task: TaskId) -> Result<Option<String>> {
    let before = git.head_sha().await?;
    git.add_all().await?;

    let message = format!("{}: automated recovery commit by raven", task);
    match git.commit(&message).await {
        Ok(sha) => {
            if before.as_deref() == Some(sha.as_str()) {
                Ok(None)
            } else {
                Ok(Some(sha))
            }
        }
        Err(GitError::CommandFailed { stderr, .. })
            if stderr.contains("nothing to commit") || stderr.contains("nothing added") =>
        {
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Pop the stash created for a rate-limit interruption.
///
/// An empty stack is tolerated (the stash may have been popped by hand
/// during a long cooldown); a conflict is logged loudly and propagated
/// with the tree left in conflict.
pub async fn pop_rate_limit_stash(git: &GitFacade) -> Result<(), GitError> {
    match git.stash_pop().await {
        Ok(()) => {
            tracing::info!("restored stashed work after cooldown");
            Ok(())
        }
        Err(GitError::EmptyStash) => {
            tracing::warn!("expected a stash to pop after cooldown, stack was empty");
            Ok(())
        }
        Err(GitError::StashConflict { stderr }) => {
            tracing::error!(%stderr, "stash pop conflict, tree left in conflict for manual resolution");
            Err(GitError::StashConflict { stderr })
        }
        Err(e) => Err(e),
    }
}
