//! Control-signal parsing from agent output.
//!
//! Agents signal completion, blockage or failure by emitting a reserved
//! token on a line by itself, optionally after a bracketed timestamp:
//!
//! ```text
//! [2026-02-18 10:05:00] PHASE_COMPLETE
//! TASK_BLOCKED: missing API credentials
//! RALPH_ERROR: tests will not compile
//! ```
//!
//! Recognition is strictly line-anchored. Tokens mentioned in prose,
//! bullet lists, backticks or fenced code blocks are narrative, not
//! signals - the agent explaining the protocol must not trigger it.

use regex::Regex;
use std::sync::LazyLock;

use crate::ratelimit;

static TIMESTAMP_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\]\s*").unwrap());

/// A reserved control token emitted by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    PhaseComplete,
    TaskBlocked(String),
    RalphError(String),
}

/// Classification of one complete agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputClass {
    /// A rate-limit message was detected; takes precedence over signals.
    RateLimited,
    PhaseComplete,
    TaskBlocked(String),
    RalphError(String),
    /// No control signal, just narrative output.
    Narrative,
}

/// Strip an optional `[YYYY-MM-DD HH:MM:SS]` prefix and surrounding
/// whitespace from a line.
fn strip_line(line: &str) -> &str {
    let line = line.trim();
    match TIMESTAMP_PREFIX.find(line) {
        Some(m) => line[m.end()..].trim(),
        None => line,
    }
}

/// Parse a control signal from a single line, if the line carries one.
pub fn parse_signal_line(line: &str) -> Option<ControlSignal> {
    let stripped = strip_line(line);
    if stripped == "PHASE_COMPLETE" {
        return Some(ControlSignal::PhaseComplete);
    }
    if let Some(reason) = stripped.strip_prefix("TASK_BLOCKED:") {
        return Some(ControlSignal::TaskBlocked(reason.trim().to_string()));
    }
    if let Some(reason) = stripped.strip_prefix("RALPH_ERROR:") {
        return Some(ControlSignal::RalphError(reason.trim().to_string()));
    }
    None
}

/// Find the first control signal in a full output, skipping fenced code
/// blocks.
pub fn find_signal(output: &str) -> Option<ControlSignal> {
    let mut in_fence = false;
    for line in output.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(signal) = parse_signal_line(line) {
            return Some(signal);
        }
    }
    None
}

/// Classify a complete agent output.
///
/// Rate-limit detection wins over everything else: an agent that hits a
/// limit mid-task often emits `RALPH_ERROR` too, and the recoverable
/// interpretation must be chosen.
pub fn classify_output(output: &str) -> OutputClass {
    if ratelimit::is_rate_limit_message(output) {
        return OutputClass::RateLimited;
    }
    match find_signal(output) {
        Some(ControlSignal::PhaseComplete) => OutputClass::PhaseComplete,
        Some(ControlSignal::TaskBlocked(reason)) => OutputClass::TaskBlocked(reason),
        Some(ControlSignal::RalphError(reason)) => OutputClass::RalphError(reason),
        None => OutputClass::Narrative,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================
    // Line-level recognition
    // =========================================

    #[test]
    fn test_bare_phase_complete_line() {
        assert_eq!(
            parse_signal_line("PHASE_COMPLETE"),
            Some(ControlSignal::PhaseComplete)
        );
    }

    #[test]
    fn test_timestamp_prefixed_phase_complete() {
        assert_eq!(
            parse_signal_line("[2026-02-18 10:05:00] PHASE_COMPLETE"),
            Some(ControlSignal::PhaseComplete)
        );
    }

    #[test]
    fn test_task_blocked_extracts_reason() {
        assert_eq!(
            parse_signal_line("TASK_BLOCKED: missing API credentials"),
            Some(ControlSignal::TaskBlocked("missing API credentials".into()))
        );
    }

    #[test]
    fn test_ralph_error_extracts_reason() {
        assert_eq!(
            parse_signal_line("[2026-02-18 10:05:00] RALPH_ERROR: build broken"),
            Some(ControlSignal::RalphError("build broken".into()))
        );
    }

    #[test]
    fn test_leading_whitespace_is_tolerated() {
        assert_eq!(
            parse_signal_line("   PHASE_COMPLETE  "),
            Some(ControlSignal::PhaseComplete)
        );
    }

    #[test]
    fn test_phase_complete_with_trailing_prose_is_not_a_signal() {
        assert_eq!(parse_signal_line("PHASE_COMPLETE was emitted earlier"), None);
    }

    #[test]
    fn test_backticked_token_is_not_a_signal() {
        assert_eq!(parse_signal_line("`PHASE_COMPLETE`"), None);
        assert_eq!(parse_signal_line("update docs with `PHASE_COMPLETE`"), None);
    }

    #[test]
    fn test_bullet_list_token_is_not_a_signal() {
        assert_eq!(parse_signal_line("- PHASE_COMPLETE"), None);
        assert_eq!(parse_signal_line("* TASK_BLOCKED: something"), None);
    }

    #[test]
    fn test_prose_mention_is_not_a_signal() {
        assert_eq!(
            parse_signal_line("When done, emit PHASE_COMPLETE on its own line"),
            None
        );
        assert_eq!(parse_signal_line("The TASK_BLOCKED: marker means stop"), None);
    }

    #[test]
    fn test_non_timestamp_bracket_prefix_is_not_stripped() {
        assert_eq!(parse_signal_line("[note] PHASE_COMPLETE"), None);
    }

    // =========================================
    // Whole-output scanning
    // =========================================

    #[test]
    fn test_find_signal_skips_code_fences() {
        let output = "\
Some narration.
```
PHASE_COMPLETE
```
More narration.
";
        assert_eq!(find_signal(output), None);
    }

    #[test]
    fn test_find_signal_after_code_fence() {
        let output = "\
```text
example: TASK_BLOCKED: not really
```
[2026-02-18 10:05:00] PHASE_COMPLETE
";
        assert_eq!(find_signal(output), Some(ControlSignal::PhaseComplete));
    }

    #[test]
    fn test_find_signal_first_wins() {
        let output = "TASK_BLOCKED: first\nRALPH_ERROR: second\n";
        assert_eq!(
            find_signal(output),
            Some(ControlSignal::TaskBlocked("first".into()))
        );
    }

    // =========================================
    // Classification
    // =========================================

    #[test]
    fn test_classify_narrative() {
        assert_eq!(classify_output("did some work, more to do"), OutputClass::Narrative);
    }

    #[test]
    fn test_classify_phase_complete_with_timestamp() {
        let output = "work log...\n[2026-02-18 10:05:00] PHASE_COMPLETE\n";
        assert_eq!(classify_output(output), OutputClass::PhaseComplete);
    }

    #[test]
    fn test_classify_backticked_mention_stays_narrative() {
        assert_eq!(
            classify_output("update docs with `PHASE_COMPLETE`"),
            OutputClass::Narrative
        );
    }

    #[test]
    fn test_rate_limit_takes_precedence_over_ralph_error() {
        let output = "\
RALPH_ERROR: could not finish
You have hit your limit. Your usage limit resets 7pm (Europe/Berlin).
";
        assert_eq!(classify_output(output), OutputClass::RateLimited);
    }

    #[test]
    fn test_classify_blocked() {
        let output = "cannot proceed\nTASK_BLOCKED: schema undecided\n";
        assert_eq!(
            classify_output(output),
            OutputClass::TaskBlocked("schema undecided".into())
        );
    }
}
