//! Parallel fan-out of review agents and assembly of the run directory.
//!
//! Every configured review agent gets the same prompt and its own
//! subprocess, bounded by a concurrency cap. Per-agent raw output and
//! normalised JSON land in a timestamped run directory that is immutable
//! once the run completes; a `latest` symlink points at the newest run.
//! One crashing or babbling agent never fails the review - its run is
//! recorded as a parse error and consolidation continues.

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentConfig, AgentInvoker, resolve_model};

use super::consolidate::consolidate;
use super::normalize::{normalize_output, parse_error_payload};
use super::types::{ConsolidatedReview, ReviewPayload, Severity};

/// A completed review pass: where it lives and what it concluded.
#[derive(Debug, Clone)]
pub struct ReviewRun {
    pub dir: PathBuf,
    pub consolidated: ConsolidatedReview,
}

/// Fans review agents out over the same diff and consolidates.
pub struct ReviewOrchestrator {
    invoker: AgentInvoker,
    agents: Vec<AgentConfig>,
    concurrency: usize,
    reviews_dir: PathBuf,
}

impl ReviewOrchestrator {
    pub fn new(
        invoker: AgentInvoker,
        agents: Vec<AgentConfig>,
        concurrency: usize,
        reviews_dir: PathBuf,
    ) -> Self {
        Self {
            invoker,
            agents,
            concurrency: concurrency.max(1),
            reviews_dir,
        }
    }

    /// Run one review pass: spawn agents, normalise, consolidate, write
    /// the run directory.
    pub async fn run(
        &self,
        pass: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<ReviewRun> {
        // Model presets are a configuration concern: resolve before any
        // subprocess starts so a bad preset fails fast.
        let mut resolved: Vec<(AgentConfig, Option<String>)> = Vec::new();
        for agent in &self.agents {
            let model = match &agent.model {
                Some(preset) => Some(resolve_model(agent, preset)?),
                None => None,
            };
            resolved.push((agent.clone(), model));
        }

        let run_dir = self.create_run_dir()?;
        tracing::info!(pass, agents = resolved.len(), dir = %run_dir.display(), "review fan-out");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let futures = resolved.iter().enumerate().map(|(idx, (agent, model))| {
            let semaphore = Arc::clone(&semaphore);
            let run_dir = run_dir.clone();
            let invoker = self.invoker.clone();
            let cancel = cancel.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                run_one_agent(&invoker, agent, model.as_deref(), pass, prompt, idx, &run_dir, &cancel)
                    .await
            }
        });

        let payloads: Vec<ReviewPayload> = join_all(futures).await;

        let consolidated = consolidate(pass, &payloads);
        let consolidated_json = serde_json::to_string_pretty(&consolidated)
            .context("review: failed to serialize consolidated output")?;
        std::fs::write(run_dir.join("consolidated.json"), consolidated_json)
            .context("review: failed to write consolidated.json")?;
        std::fs::write(run_dir.join("report.md"), render_report(&consolidated))
            .context("review: failed to write report.md")?;
        self.update_latest_link(&run_dir);

        tracing::info!(
            verdict = %consolidated.verdict,
            unique = consolidated.stats.unique_findings,
            "review consolidated"
        );

        Ok(ReviewRun {
            dir: run_dir,
            consolidated,
        })
    }

    fn create_run_dir(&self) -> Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let dir = self
            .reviews_dir
            .join(format!("review-{}-{}", stamp, &suffix[..8]));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("review: failed to create run dir {}", dir.display()))?;
        Ok(dir)
    }

    fn update_latest_link(&self, run_dir: &Path) {
        let link = self.reviews_dir.join("latest");
        let _ = std::fs::remove_file(&link);
        #[cfg(unix)]
        {
            if let Some(name) = run_dir.file_name() {
                let _ = std::os::unix::fs::symlink(name, &link);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = std::fs::write(&link, run_dir.display().to_string());
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one_agent(
    invoker: &AgentInvoker,
    agent: &AgentConfig,
    model: Option<&str>,
    pass: &str,
    prompt: &str,
    idx: usize,
    run_dir: &Path,
    cancel: &CancellationToken,
) -> ReviewPayload {
    let stem = format!("{:02}-{}", idx + 1, agent.name);

    let payload = match invoker.invoke(agent, model, prompt, cancel).await {
        Ok(output) => {
            let raw_path = run_dir.join(format!("{}-raw.txt", stem));
            if let Err(e) = std::fs::write(&raw_path, &output.output) {
                tracing::warn!(path = %raw_path.display(), error = %e, "failed to write raw review output");
            }
            if output.exit_code != 0 {
                tracing::warn!(agent = %agent.name, exit_code = output.exit_code, "review agent exited non-zero");
            }
            normalize_output(&output.output, &agent.name, pass)
        }
        Err(e) => {
            tracing::warn!(agent = %agent.name, error = %e, "review agent invocation failed");
            parse_error_payload(&agent.name, pass, &format!("invocation failed: {}", e))
        }
    };

    let json_path = run_dir.join(format!("{}.json", stem));
    match serde_json::to_string_pretty(&payload) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&json_path, json) {
                tracing::warn!(path = %json_path.display(), error = %e, "failed to write normalised payload");
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to serialize normalised payload"),
    }

    payload
}

/// Render the human-readable report for a consolidated review.
fn render_report(review: &ConsolidatedReview) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Review report - {}\n\n", review.pass));
    out.push_str(&format!("- Verdict: **{}**\n", review.verdict));
    out.push_str(&format!("- Generated: {}\n", review.generated_at));
    out.push_str(&format!(
        "- Findings: {} unique ({} raw, {} duplicates removed, {} parse-error runs)\n\n",
        review.stats.unique_findings,
        review.stats.total_raw_findings,
        review.stats.duplicates_removed,
        review.stats.parse_error_runs,
    ));

    if !review.summary.is_empty() {
        out.push_str(&format!("{}\n\n", review.summary));
    }

    if !review.highlights.is_empty() {
        out.push_str("## Highlights\n\n");
        for highlight in &review.highlights {
            out.push_str(&format!("- {}\n", highlight));
        }
        out.push('\n');
    }

    if !review.findings.is_empty() {
        out.push_str("## Findings\n\n");
        for finding in &review.findings {
            let location = if finding.line > 0 {
                format!("{}:{}", finding.path, finding.line)
            } else {
                finding.path.clone()
            };
            out.push_str(&format!(
                "### [{}] {} ({})\n\n",
                finding.severity, finding.title, location
            ));
            out.push_str(&format!(
                "- Category: {} - reported by {}\n",
                finding.category,
                finding.source_agents.join(", ")
            ));
            if !finding.details.is_empty() {
                out.push_str(&format!("\n{}\n", finding.details));
            }
            if let Some(fix) = &finding.suggested_fix {
                out.push_str(&format!("\nSuggested fix: {}\n", fix));
            }
            out.push('\n');
        }
    }

    let critical = review
        .findings
        .iter()
        .filter(|f| f.severity == Severity::Critical)
        .count();
    if critical > 0 {
        out.push_str(&format!(
            "**{} critical finding(s) must be addressed before merge.**\n",
            critical
        ));
    }

    out
}
