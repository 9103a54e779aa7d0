//! Prompt assembly for the implement, review and fix stages.
//!
//! Raven assembles section-structured prompts from the task spec, the
//! state-file contract and the control-signal contract. The long-form
//! template text each team tunes lives outside the orchestrator; these
//! builders only guarantee the sections and contracts are present.

use anyhow::{Context, Result};
use std::path::Path;

use crate::phase::Phase;
use crate::review::ConsolidatedReview;
use crate::task::Task;

/// Diffs up to this size are embedded inline; larger ones are written to
/// the run directory and referenced by path.
pub const INLINE_DIFF_LIMIT_BYTES: usize = 48 * 1024;

/// Contract lines every implementation prompt carries.
fn control_signal_contract() -> &'static str {
    "## COMPLETION CONTRACT\n\
     Work on exactly ONE task, then stop.\n\
     Update the task-state file (`.raven/task-state`) when the task is done: `T-NNN|completed|YYYY-MM-DD`.\n\
     Commit your work with a descriptive message.\n\
     Signal by writing exactly one of these on a line by itself:\n\
     - PHASE_COMPLETE            (every task in the phase is completed)\n\
     - TASK_BLOCKED: <reason>    (you cannot proceed)\n\
     - RALPH_ERROR: <reason>     (something is broken beyond this task)\n\
     Do not mention these tokens anywhere else in your output."
}

/// Prompt for one implementation iteration.
pub fn build_implement_prompt(phase: &Phase, task: &Task) -> String {
    format!(
        "You are implementing phase {} ({}) of this project.\n\n\
         ## CURRENT TASK\n{}\n\n\
         ## SCOPE\nPhase {} covers tasks {} through {}. Only the current task is in scope for this run.\n\n\
         {}\n",
        phase.id,
        phase.title,
        task.body.trim_end(),
        phase.id,
        phase.start,
        phase.end,
        control_signal_contract(),
    )
}

/// Prompt for one review agent.
///
/// The unified diff is embedded when small; otherwise it is written to
/// `run_dir/diff.patch` and referenced by path.
pub fn build_review_prompt(
    brief: &str,
    patterns: &str,
    checklist: &str,
    diff: &str,
    pass: &str,
    run_dir: &Path,
) -> Result<String> {
    let diff_section = if diff.len() <= INLINE_DIFF_LIMIT_BYTES {
        format!("## DIFF\n```diff\n{}\n```", diff)
    } else {
        let diff_path = run_dir.join("diff.patch");
        std::fs::write(&diff_path, diff)
            .with_context(|| format!("review: failed to write {}", diff_path.display()))?;
        format!(
            "## DIFF\nThe diff is too large to inline ({} bytes). Read it from: {}",
            diff.len(),
            diff_path.display()
        )
    };

    Ok(format!(
        "You are reviewing a change as part of the `{}` pass.\n\n\
         ## PROJECT BRIEF\n{}\n\n\
         ## PATTERNS\n{}\n\n\
         ## CHECKLIST\n{}\n\n\
         {}\n\n\
         ## OUTPUT CONTRACT\n\
         Respond with a single JSON object and nothing else:\n\
         {{\n\
         \x20 \"schema_version\": \"1.0\",\n\
         \x20 \"pass\": \"{}\",\n\
         \x20 \"agent\": \"<your name>\",\n\
         \x20 \"verdict\": \"APPROVE\" | \"COMMENT\" | \"REQUEST_CHANGES\" | \"NEEDS_FIXES\",\n\
         \x20 \"summary\": \"<string>\",\n\
         \x20 \"highlights\": [\"<string>\"],\n\
         \x20 \"findings\": [{{\"severity\": \"critical|high|medium|low|suggestion\",\n\
         \x20                 \"category\": \"<tag>\", \"path\": \"<file>\", \"line\": <int>,\n\
         \x20                 \"title\": \"<short>\", \"details\": \"<string>\",\n\
         \x20                 \"suggested_fix\": \"<string>\"}}]\n\
         }}",
        pass, brief, patterns, checklist, diff_section, pass,
    ))
}

/// Prompt for the fix stage, digesting the blocking findings.
pub fn build_fix_prompt(review: &ConsolidatedReview) -> String {
    let mut digest = String::new();
    for finding in &review.findings {
        let location = if finding.line > 0 {
            format!("{}:{}", finding.path, finding.line)
        } else {
            finding.path.clone()
        };
        digest.push_str(&format!(
            "- [{}] {} ({})\n  {}\n",
            finding.severity, finding.title, location, finding.details
        ));
        if let Some(fix) = &finding.suggested_fix {
            digest.push_str(&format!("  Suggested fix: {}\n", fix));
        }
    }
    if digest.is_empty() {
        digest.push_str("- (no individual findings; see summary)\n");
    }

    format!(
        "A code review returned the verdict {} on the current branch.\n\n\
         ## REVIEW SUMMARY\n{}\n\n\
         ## FINDINGS TO ADDRESS\n{}\n\
         ## INSTRUCTIONS\n\
         Address every finding above, highest severity first. Commit your\n\
         fixes with descriptive messages. Do not start unrelated work.",
        review.verdict, review.summary, digest,
    )
}
