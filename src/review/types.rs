//! Review schema types shared by agents, normalisation and consolidation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Version stamped into every review JSON document.
pub const SCHEMA_VERSION: &str = "1.0";

/// Categories the checklist knows about; anything else normalises to
/// `other`.
pub const KNOWN_CATEGORIES: &[&str] = &[
    "correctness",
    "security",
    "performance",
    "concurrency",
    "error-handling",
    "testing",
    "style",
    "docs",
    "other",
];

/// Severity of a single finding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
    Suggestion,
}

impl Severity {
    /// Rank used for ordering: critical=5 … suggestion=1.
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Critical => 5,
            Severity::High => 4,
            Severity::Medium => 3,
            Severity::Low => 2,
            Severity::Suggestion => 1,
        }
    }

    /// Normalise a free-form string; unknown values become `medium`.
    pub fn from_loose(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "critical" | "blocker" => Severity::Critical,
            "high" | "major" | "error" => Severity::High,
            "medium" | "warning" | "moderate" => Severity::Medium,
            "low" | "minor" => Severity::Low,
            "suggestion" | "info" | "nit" | "note" => Severity::Suggestion,
            _ => Severity::Medium,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Suggestion => "suggestion",
        };
        write!(f, "{}", s)
    }
}

/// Review verdict, a closed set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approve,
    #[default]
    Comment,
    RequestChanges,
    NeedsFixes,
}

impl Verdict {
    /// Whether this verdict gates the fix stage.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Verdict::RequestChanges | Verdict::NeedsFixes)
    }

    /// Normalise a free-form string; unknown values become `COMMENT`.
    pub fn from_loose(s: &str) -> Self {
        let normalised: String = s
            .trim()
            .to_uppercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();
        match normalised.as_str() {
            "APPROVE" | "APPROVED" | "LGTM" => Verdict::Approve,
            "COMMENT" | "COMMENTED" => Verdict::Comment,
            "REQUEST_CHANGES" | "CHANGES_REQUESTED" => Verdict::RequestChanges,
            "NEEDS_FIXES" | "NEEDS_FIX" | "FIX" => Verdict::NeedsFixes,
            _ => Verdict::Comment,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Approve => "APPROVE",
            Verdict::Comment => "COMMENT",
            Verdict::RequestChanges => "REQUEST_CHANGES",
            Verdict::NeedsFixes => "NEEDS_FIXES",
        };
        write!(f, "{}", s)
    }
}

/// Normalise a category tag; unknown values become `other`.
pub fn normalize_category(s: &str) -> String {
    let tag = s.trim().to_lowercase().replace([' ', '_'], "-");
    if KNOWN_CATEGORIES.contains(&tag.as_str()) {
        tag
    } else {
        "other".to_string()
    }
}

/// A single review issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub category: String,
    pub path: String,
    /// 1-based line; 0 means not line-specific.
    pub line: u32,
    pub title: String,
    #[serde(default)]
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    /// Agents that reported this finding; populated during consolidation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_agents: Vec<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub agent_count: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl Finding {
    pub fn new(severity: Severity, path: &str, line: u32, title: &str) -> Self {
        Self {
            severity,
            category: "other".to_string(),
            path: path.to_string(),
            line,
            title: title.to_string(),
            details: String::new(),
            suggested_fix: None,
            source_agents: Vec::new(),
            agent_count: 0,
        }
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = category.to_string();
        self
    }

    pub fn with_details(mut self, details: &str) -> Self {
        self.details = details.to_string();
        self
    }

    pub fn with_suggested_fix(mut self, fix: &str) -> Self {
        self.suggested_fix = Some(fix.to_string());
        self
    }

    /// Consolidation key: path, line, lowercase title, pass.
    pub fn key(&self, pass: &str) -> (String, u32, String, String) {
        (
            self.path.clone(),
            self.line,
            self.title.to_lowercase(),
            pass.to_string(),
        )
    }
}

/// One agent's review output after normalisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewPayload {
    pub schema_version: String,
    pub pass: String,
    pub agent: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub highlights: Vec<String>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    /// Set when this payload was synthesised from unparseable output.
    #[serde(default, skip_serializing_if = "is_false")]
    pub parse_error: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Conservation counters for a consolidated run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewStats {
    pub total_raw_findings: usize,
    pub unique_findings: usize,
    pub duplicates_removed: usize,
    pub parse_error_runs: usize,
}

/// The merged output of one review pass across all agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedReview {
    pub schema_version: String,
    pub pass: String,
    pub verdict: Verdict,
    pub summary: String,
    #[serde(default)]
    pub highlights: Vec<String>,
    pub findings: Vec<Finding>,
    pub stats: ReviewStats,
    /// RFC 3339 UTC timestamp.
    pub generated_at: String,
}
