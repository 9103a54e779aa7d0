//! Typed error hierarchy for the Raven orchestrator.
//!
//! Five enums cover the failure surfaces callers need to match on:
//! - `AdapterError` - agent subprocess invocation failures
//! - `GitError` - git CLI wrapper failures
//! - `CooldownError` - rate-limit cooldown failures
//! - `LoopError` - implementation-loop termination causes
//! - `PipelineError` - phase-pipeline failures
//!
//! Everything else propagates as `anyhow::Error` with a component prefix
//! in the context string (e.g. `git: diff from "main"`).

use thiserror::Error;

/// Errors from invoking an agent CLI as a subprocess.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("agent command '{command}' not found on PATH")]
    MissingBinary { command: String },

    #[error("failed to spawn agent '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the git CLI façade.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("git: {action}: {stderr}")]
    CommandFailed { action: String, stderr: String },

    #[error("git: no stash entries to pop")]
    EmptyStash,

    #[error("git: stash pop hit a merge conflict, resolve manually: {stderr}")]
    StashConflict { stderr: String },

    #[error("git: {path} is not a git repository")]
    NotARepository { path: String },

    #[error("git: failed to run git binary: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors from the rate-limit cooldown.
#[derive(Debug, Error)]
pub enum CooldownError {
    #[error("rate-limit wait {cycle} reached the cap of {max} waits")]
    WaitCyclesExhausted { cycle: u32, max: u32 },
}

/// Terminal outcomes of the implementation loop that are not success.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("no task completed in {iterations} consecutive iterations")]
    ProgressStalled { iterations: u32 },

    #[error("iteration cap of {cap} reached with work remaining")]
    IterationCapReached { cap: u32 },

    #[error(transparent)]
    Cooldown(#[from] CooldownError),

    #[error("interrupted by signal")]
    Interrupted,

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the phase pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("working tree is dirty, commit or stash before starting a phase")]
    DirtyWorkingTree,

    #[error("all stages are skipped, nothing to run")]
    AllStagesSkipped,

    #[error("unknown phase '{id}'")]
    UnknownPhase { id: String },

    #[error("review verdict still {verdict} after {cycles} fix cycles")]
    ReviewCyclesExhausted { cycles: u32, verdict: String },

    #[error("preset '{preset}' is not valid for agent '{agent}' (valid presets: {valid})")]
    WrongFamilyPreset {
        preset: String,
        agent: String,
        valid: String,
    },

    #[error(transparent)]
    Loop(#[from] LoopError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_missing_binary_is_matchable() {
        let err = AdapterError::MissingBinary {
            command: "claude".into(),
        };
        match &err {
            AdapterError::MissingBinary { command } => assert_eq!(command, "claude"),
            _ => panic!("expected MissingBinary"),
        }
        assert!(err.to_string().contains("claude"));
    }

    #[test]
    fn git_command_failed_carries_action_and_stderr() {
        let err = GitError::CommandFailed {
            action: "diff from \"main\"".into(),
            stderr: "fatal: bad revision".into(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("git: "));
        assert!(msg.contains("diff from \"main\""));
        assert!(msg.contains("bad revision"));
    }

    #[test]
    fn git_empty_stash_is_distinct_from_conflict() {
        let empty = GitError::EmptyStash;
        let conflict = GitError::StashConflict {
            stderr: "CONFLICT (content): a.rs".into(),
        };
        assert!(matches!(empty, GitError::EmptyStash));
        assert!(matches!(conflict, GitError::StashConflict { .. }));
        assert!(!matches!(empty, GitError::StashConflict { .. }));
    }

    #[test]
    fn cooldown_exhausted_carries_counts() {
        let err = CooldownError::WaitCyclesExhausted { cycle: 5, max: 5 };
        match err {
            CooldownError::WaitCyclesExhausted { cycle, max } => {
                assert_eq!(cycle, 5);
                assert_eq!(max, 5);
            }
        }
    }

    #[test]
    fn loop_error_converts_from_cooldown() {
        let inner = CooldownError::WaitCyclesExhausted { cycle: 3, max: 3 };
        let loop_err: LoopError = inner.into();
        assert!(matches!(
            loop_err,
            LoopError::Cooldown(CooldownError::WaitCyclesExhausted { .. })
        ));
    }

    #[test]
    fn pipeline_wrong_family_preset_names_valid_set() {
        let err = PipelineError::WrongFamilyPreset {
            preset: "o3".into(),
            agent: "claude".into(),
            valid: "opus, sonnet, default".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("o3"));
        assert!(msg.contains("opus, sonnet, default"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&AdapterError::MissingBinary {
            command: "x".into(),
        });
        assert_std_error(&GitError::EmptyStash);
        assert_std_error(&CooldownError::WaitCyclesExhausted { cycle: 1, max: 2 });
        assert_std_error(&LoopError::ProgressStalled { iterations: 3 });
        assert_std_error(&PipelineError::AllStagesSkipped);
    }
}
