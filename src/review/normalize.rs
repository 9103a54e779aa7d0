//! Normalisation of raw agent review output into [`ReviewPayload`].
//!
//! Agents are asked for a single JSON object but drift: markdown fences,
//! leading prose, unknown severity spellings, string line numbers. The
//! normaliser extracts the largest balanced `{…}` region, parses it
//! leniently, and coerces every field into the closed schema. Output that
//! yields no JSON at all becomes a synthesised parse-error payload - a
//! bad agent run never fails the review.

use serde_json::Value;

use super::types::{
    Finding, ReviewPayload, Severity, Verdict, normalize_category, SCHEMA_VERSION,
};

/// Extract the largest balanced JSON object from free-form text.
///
/// Brace counting skips string literals (and escapes) so braces inside
/// `details` text do not unbalance the scan.
pub fn extract_json_object(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut best: Option<(usize, usize)> = None;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = balanced_end(text, i) {
                let len = end - i;
                if best.map(|(s, e)| e - s).unwrap_or(0) < len {
                    best = Some((i, end));
                }
                // Continue after this region to find a larger sibling.
                i = end;
                continue;
            }
        }
        i += 1;
    }

    best.map(|(s, e)| text[s..e].to_string())
}

/// End index (exclusive) of the balanced object starting at `start`.
fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// The payload synthesised when an agent produced no parseable JSON.
pub fn parse_error_payload(agent: &str, pass: &str, detail: &str) -> ReviewPayload {
    ReviewPayload {
        schema_version: SCHEMA_VERSION.to_string(),
        pass: pass.to_string(),
        agent: agent.to_string(),
        verdict: Verdict::Comment,
        summary: format!("review output could not be parsed: {}", detail),
        highlights: Vec::new(),
        findings: Vec::new(),
        parse_error: true,
    }
}

/// Normalise one agent's raw output into a schema-conforming payload.
pub fn normalize_output(raw: &str, agent: &str, pass: &str) -> ReviewPayload {
    let Some(json) = extract_json_object(raw) else {
        return parse_error_payload(agent, pass, "no JSON object found");
    };
    let value: Value = match serde_json::from_str(&json) {
        Ok(v) => v,
        Err(e) => return parse_error_payload(agent, pass, &e.to_string()),
    };
    normalize_value(&value, agent, pass)
}

fn normalize_value(value: &Value, agent: &str, pass: &str) -> ReviewPayload {
    let verdict = value
        .get("verdict")
        .and_then(Value::as_str)
        .map(Verdict::from_loose)
        .unwrap_or_default();

    let summary = value
        .get("summary")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let highlights = value
        .get("highlights")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let findings = value
        .get("findings")
        .and_then(Value::as_array)
        .map(|items| items.iter().map(normalize_finding).collect())
        .unwrap_or_default();

    ReviewPayload {
        schema_version: SCHEMA_VERSION.to_string(),
        pass: pass.to_string(),
        agent: agent.to_string(),
        verdict,
        summary,
        highlights,
        findings,
        parse_error: false,
    }
}

fn normalize_finding(value: &Value) -> Finding {
    let severity = value
        .get("severity")
        .and_then(Value::as_str)
        .map(Severity::from_loose)
        .unwrap_or_default();

    let category = value
        .get("category")
        .and_then(Value::as_str)
        .map(normalize_category)
        .unwrap_or_else(|| "other".to_string());

    let path = value
        .get("path")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    // Line must be a non-negative integer; strings are parsed, negatives
    // and garbage collapse to 0 ("not line-specific").
    let line = match value.get("line") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0).min(u32::MAX as u64) as u32,
        Some(Value::String(s)) => s.trim().parse::<u32>().unwrap_or(0),
        _ => 0,
    };

    let details = value
        .get("details")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let title = value
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| {
            let mut derived: String = details.chars().take(60).collect();
            if derived.trim().is_empty() {
                derived = "untitled finding".to_string();
            }
            derived
        });

    let suggested_fix = value
        .get("suggested_fix")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string);

    Finding {
        severity,
        category,
        path,
        line,
        title,
        details,
        suggested_fix,
        source_agents: Vec::new(),
        agent_count: 0,
    }
}
