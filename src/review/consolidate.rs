//! Deduplication and merging of per-agent review payloads.
//!
//! Findings are keyed by `(path, line, lowercase title, pass)`. Merging
//! is commutative and associative: the union of source agents, the
//! maximum severity, the longest details and the longest suggested fix
//! survive, so the order per-agent files arrive in never changes the
//! result.

use chrono::Utc;
use std::collections::BTreeMap;

use super::types::{
    ConsolidatedReview, Finding, ReviewPayload, ReviewStats, Severity, Verdict, SCHEMA_VERSION,
};

/// Merge per-agent payloads into one consolidated review.
pub fn consolidate(pass: &str, payloads: &[ReviewPayload]) -> ConsolidatedReview {
    let mut merged: BTreeMap<(String, u32, String, String), Finding> = BTreeMap::new();
    let mut total_raw = 0usize;
    let mut parse_error_runs = 0usize;
    let mut highlights: Vec<String> = Vec::new();

    for payload in payloads {
        if payload.parse_error {
            parse_error_runs += 1;
        }
        for highlight in &payload.highlights {
            if !highlights.contains(highlight) {
                highlights.push(highlight.clone());
            }
        }
        for finding in &payload.findings {
            total_raw += 1;
            let key = finding.key(pass);
            match merged.get_mut(&key) {
                Some(existing) => merge_into(existing, finding, &payload.agent),
                None => {
                    let mut fresh = finding.clone();
                    fresh.source_agents = vec![payload.agent.clone()];
                    fresh.agent_count = 1;
                    merged.insert(key, fresh);
                }
            }
        }
    }

    let mut findings: Vec<Finding> = merged.into_values().collect();
    for finding in &mut findings {
        finding.source_agents.sort();
        finding.source_agents.dedup();
        finding.agent_count = finding.source_agents.len();
    }
    findings.sort_by(|a, b| {
        b.severity
            .rank()
            .cmp(&a.severity.rank())
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.line.cmp(&b.line))
            .then_with(|| a.title.cmp(&b.title))
    });

    let unique = findings.len();
    let stats = ReviewStats {
        total_raw_findings: total_raw,
        unique_findings: unique,
        duplicates_removed: total_raw - unique,
        parse_error_runs,
    };

    let verdict = derive_verdict(&findings, parse_error_runs);
    let summary = summarize(&findings, &stats, payloads.len());

    ConsolidatedReview {
        schema_version: SCHEMA_VERSION.to_string(),
        pass: pass.to_string(),
        verdict,
        summary,
        highlights,
        findings,
        stats,
        generated_at: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    }
}

fn merge_into(existing: &mut Finding, incoming: &Finding, agent: &str) {
    if !existing.source_agents.iter().any(|a| a == agent) {
        existing.source_agents.push(agent.to_string());
    }
    if incoming.severity.rank() > existing.severity.rank() {
        existing.severity = incoming.severity;
    }
    if incoming.details.len() > existing.details.len() {
        existing.details = incoming.details.clone();
    }
    let incoming_fix_len = incoming.suggested_fix.as_deref().map_or(0, str::len);
    let existing_fix_len = existing.suggested_fix.as_deref().map_or(0, str::len);
    if incoming_fix_len > existing_fix_len {
        existing.suggested_fix = incoming.suggested_fix.clone();
    }
    // Category disagreements keep the first non-"other" tag.
    if existing.category == "other" && incoming.category != "other" {
        existing.category = incoming.category.clone();
    }
}

/// `REQUEST_CHANGES` on ≥1 critical or ≥3 high; `COMMENT` when any run
/// failed to parse; `APPROVE` when nothing actionable remains.
fn derive_verdict(findings: &[Finding], parse_error_runs: usize) -> Verdict {
    let critical = findings
        .iter()
        .filter(|f| f.severity == Severity::Critical)
        .count();
    let high = findings
        .iter()
        .filter(|f| f.severity == Severity::High)
        .count();

    if critical >= 1 || high >= 3 {
        return Verdict::RequestChanges;
    }
    if parse_error_runs > 0 {
        return Verdict::Comment;
    }
    if findings.iter().all(|f| f.severity == Severity::Suggestion) {
        return Verdict::Approve;
    }
    Verdict::Comment
}

fn summarize(findings: &[Finding], stats: &ReviewStats, agent_runs: usize) -> String {
    let mut by_severity: BTreeMap<u8, usize> = BTreeMap::new();
    for finding in findings {
        *by_severity.entry(finding.severity.rank()).or_default() += 1;
    }
    let breakdown: Vec<String> = [
        (Severity::Critical, "critical"),
        (Severity::High, "high"),
        (Severity::Medium, "medium"),
        (Severity::Low, "low"),
        (Severity::Suggestion, "suggestion"),
    ]
    .iter()
    .filter_map(|(sev, label)| {
        by_severity
            .get(&sev.rank())
            .map(|count| format!("{} {}", count, label))
    })
    .collect();

    let mut summary = format!(
        "{} unique finding(s) from {} agent run(s)",
        stats.unique_findings, agent_runs
    );
    if !breakdown.is_empty() {
        summary.push_str(&format!(" ({})", breakdown.join(", ")));
    }
    if stats.parse_error_runs > 0 {
        summary.push_str(&format!("; {} run(s) failed to parse", stats.parse_error_runs));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::normalize::parse_error_payload;

    fn payload(agent: &str, findings: Vec<Finding>) -> ReviewPayload {
        ReviewPayload {
            schema_version: SCHEMA_VERSION.to_string(),
            pass: "full-review".to_string(),
            agent: agent.to_string(),
            verdict: Verdict::Comment,
            summary: String::new(),
            highlights: Vec::new(),
            findings,
            parse_error: false,
        }
    }

    #[test]
    fn test_duplicate_findings_merge_to_max_severity() {
        // Identical (path, line, title) from two agents with severities
        // high and critical: consolidated entry is critical, counted for
        // both agents, sources sorted.
        let a = payload(
            "agent-b",
            vec![Finding::new(Severity::High, "a.go", 12, "nil deref").with_details("short")],
        );
        let b = payload(
            "agent-a",
            vec![
                Finding::new(Severity::Critical, "a.go", 12, "nil deref")
                    .with_details("much longer explanation"),
            ],
        );

        let review = consolidate("full-review", &[a, b]);
        assert_eq!(review.findings.len(), 1);
        let merged = &review.findings[0];
        assert_eq!(merged.severity, Severity::Critical);
        assert_eq!(merged.agent_count, 2);
        assert_eq!(merged.source_agents, vec!["agent-a", "agent-b"]);
        assert_eq!(merged.details, "much longer explanation");
    }

    #[test]
    fn test_stats_conservation_invariant() {
        let a = payload(
            "a",
            vec![
                Finding::new(Severity::High, "x.rs", 1, "one"),
                Finding::new(Severity::Low, "x.rs", 2, "two"),
            ],
        );
        let b = payload(
            "b",
            vec![
                Finding::new(Severity::High, "x.rs", 1, "one"),
                Finding::new(Severity::Medium, "y.rs", 9, "three"),
            ],
        );

        let review = consolidate("full-review", &[a, b]);
        let stats = &review.stats;
        assert_eq!(stats.total_raw_findings, 4);
        assert_eq!(stats.unique_findings, 3);
        assert_eq!(stats.duplicates_removed, 1);
        assert_eq!(
            stats.unique_findings + stats.duplicates_removed,
            stats.total_raw_findings
        );
    }

    #[test]
    fn test_merge_order_independence() {
        let a = payload(
            "a",
            vec![
                Finding::new(Severity::High, "x.rs", 1, "One").with_suggested_fix("short"),
                Finding::new(Severity::Low, "z.rs", 3, "zed"),
            ],
        );
        let b = payload(
            "b",
            vec![
                Finding::new(Severity::Critical, "x.rs", 1, "one")
                    .with_suggested_fix("a longer suggested fix"),
            ],
        );
        let c = payload("c", vec![Finding::new(Severity::Medium, "x.rs", 1, "ONE")]);

        let forward = consolidate("p", &[a.clone(), b.clone(), c.clone()]);
        let reverse = consolidate("p", &[c, b, a]);

        let keys = |r: &ConsolidatedReview| {
            r.findings
                .iter()
                .map(|f| (f.key("p"), f.severity, f.suggested_fix.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(keys(&forward), keys(&reverse));
    }

    #[test]
    fn test_sort_order_severity_path_line_title() {
        let a = payload(
            "a",
            vec![
                Finding::new(Severity::Low, "b.rs", 5, "bee"),
                Finding::new(Severity::Critical, "z.rs", 1, "zed"),
                Finding::new(Severity::Critical, "a.rs", 9, "late"),
                Finding::new(Severity::Critical, "a.rs", 2, "early"),
            ],
        );
        let review = consolidate("p", &[a]);
        let order: Vec<(String, u32)> = review
            .findings
            .iter()
            .map(|f| (f.path.clone(), f.line))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a.rs".to_string(), 2),
                ("a.rs".to_string(), 9),
                ("z.rs".to_string(), 1),
                ("b.rs".to_string(), 5),
            ]
        );
    }

    #[test]
    fn test_verdict_request_changes_on_critical() {
        let a = payload("a", vec![Finding::new(Severity::Critical, "x.rs", 1, "bad")]);
        assert_eq!(consolidate("p", &[a]).verdict, Verdict::RequestChanges);
    }

    #[test]
    fn test_verdict_request_changes_on_three_high() {
        let a = payload(
            "a",
            vec![
                Finding::new(Severity::High, "x.rs", 1, "one"),
                Finding::new(Severity::High, "x.rs", 2, "two"),
                Finding::new(Severity::High, "x.rs", 3, "three"),
            ],
        );
        assert_eq!(consolidate("p", &[a]).verdict, Verdict::RequestChanges);
    }

    #[test]
    fn test_verdict_two_high_is_comment() {
        let a = payload(
            "a",
            vec![
                Finding::new(Severity::High, "x.rs", 1, "one"),
                Finding::new(Severity::High, "x.rs", 2, "two"),
            ],
        );
        assert_eq!(consolidate("p", &[a]).verdict, Verdict::Comment);
    }

    #[test]
    fn test_verdict_comment_on_parse_errors() {
        let a = payload("a", vec![]);
        let broken = parse_error_payload("b", "p", "garbage");
        let review = consolidate("p", &[a, broken]);
        assert_eq!(review.verdict, Verdict::Comment);
        assert_eq!(review.stats.parse_error_runs, 1);
    }

    #[test]
    fn test_verdict_approve_when_empty_or_suggestions_only() {
        let empty = payload("a", vec![]);
        assert_eq!(consolidate("p", &[empty]).verdict, Verdict::Approve);

        let suggestions = payload(
            "a",
            vec![Finding::new(Severity::Suggestion, "x.rs", 1, "style nit")],
        );
        assert_eq!(consolidate("p", &[suggestions]).verdict, Verdict::Approve);
    }

    #[test]
    fn test_source_agents_sorted_and_unique() {
        let mut duplicated = Finding::new(Severity::Medium, "x.rs", 1, "dup");
        duplicated.source_agents = vec!["zeta".to_string(), "zeta".to_string()];
        let a = payload("zeta", vec![duplicated]);
        let b = payload("alpha", vec![Finding::new(Severity::Medium, "x.rs", 1, "dup")]);

        let review = consolidate("p", &[a, b]);
        let merged = &review.findings[0];
        assert_eq!(merged.source_agents, vec!["alpha", "zeta"]);
        assert_eq!(merged.agent_count, merged.source_agents.len());
    }

    #[test]
    fn test_generated_at_is_rfc3339_utc() {
        let review = consolidate("p", &[payload("a", vec![])]);
        assert!(review.generated_at.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&review.generated_at).is_ok());
    }
}
