//! Uniform adapter over heterogeneous coding-agent CLIs.
//!
//! The rest of Raven only ever calls [`AgentInvoker::invoke`]: prompt in
//! via stdin, combined output and exit code back out. Per-family quirks
//! (argv shape, stdin contract, reasoning-effort plumbing) live here and
//! nowhere else. Every value is passed as its own argv element; nothing is
//! ever routed through a shell, so metacharacters in a model string are
//! inert.
//!
//! Each invocation is a fresh subprocess; no state carries between
//! iterations.

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::errors::{AdapterError, PipelineError};

/// Reasoning-effort environment variable for Claude-like agents, set on
/// the child process only.
const CLAUDE_EFFORT_ENV: &str = "CLAUDE_REASONING_EFFORT";

/// Configuration for one agent CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Short identifier, lowercase alphanumerics and hyphens.
    pub name: String,
    /// Executable looked up on PATH.
    pub command: String,
    /// Model identifier or preset short name.
    #[serde(default)]
    pub model: Option<String>,
    /// Reasoning effort level (e.g. "high").
    #[serde(default)]
    pub effort: Option<String>,
    /// Prompt template name, resolved by the prompt builder.
    #[serde(default)]
    pub prompt_template: Option<String>,
    /// Tools the agent is allowed to use (Claude-like families).
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
}

impl AgentConfig {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            model: None,
            effort: None,
            prompt_template: None,
            allowed_tools: None,
        }
    }

    /// The default agent entry used when raven.toml has no roster.
    pub fn claude_default() -> Self {
        Self::new("claude", "claude")
    }

    pub fn family(&self) -> AgentFamily {
        AgentFamily::detect(&self.name, &self.command)
    }

    /// Names must be lowercase alphanumerics plus hyphens.
    pub fn validate(&self) -> anyhow::Result<()> {
        let ok = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !ok {
            anyhow::bail!(
                "agent name '{}' must be lowercase alphanumerics and hyphens",
                self.name
            );
        }
        if self.command.is_empty() {
            anyhow::bail!("agent '{}' has an empty command", self.name);
        }
        Ok(())
    }
}

/// The two argv dialects Raven speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentFamily {
    /// `claude`-style: `-p`, `--permission-mode`, `--model`, stdin prompt.
    ClaudeLike,
    /// `codex`-style: `exec`, `--sandbox`, `-m`, trailing `-` for stdin.
    CodexLike,
}

impl AgentFamily {
    pub fn detect(name: &str, command: &str) -> Self {
        if name.contains("codex") || command.contains("codex") {
            AgentFamily::CodexLike
        } else {
            AgentFamily::ClaudeLike
        }
    }

    /// Preset short names valid for this family.
    pub fn presets(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            AgentFamily::ClaudeLike => &[
                ("opus", "claude-opus-4-5"),
                ("sonnet", "claude-sonnet-4-5"),
                ("default", "claude-sonnet-4-5"),
            ],
            AgentFamily::CodexLike => &[("o3", "o3"), ("default", "gpt-5-codex")],
        }
    }
}

/// Map a preset short name to a full model id for the given agent.
///
/// A name outside the table that looks like a full id (contains `-` or
/// `.`) passes through untouched. A preset belonging to the other family
/// is rejected with the valid presets for this agent.
pub fn resolve_model(agent: &AgentConfig, preset: &str) -> Result<String, PipelineError> {
    let family = agent.family();
    if let Some((_, full)) = family.presets().iter().find(|(short, _)| *short == preset) {
        return Ok(full.to_string());
    }
    if preset.contains('-') || preset.contains('.') {
        return Ok(preset.to_string());
    }
    let valid = family
        .presets()
        .iter()
        .map(|(short, _)| *short)
        .collect::<Vec<_>>()
        .join(", ");
    Err(PipelineError::WrongFamilyPreset {
        preset: preset.to_string(),
        agent: agent.name.clone(),
        valid,
    })
}

/// Combined result of one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    /// Interleaved stdout + stderr, stdout first.
    pub output: String,
    pub exit_code: i32,
}

impl AgentOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Invokes agent CLIs as fresh subprocesses.
#[derive(Debug, Clone, Default)]
pub struct AgentInvoker {
    /// Working directory for the child; inherits ours when `None`.
    pub working_dir: Option<std::path::PathBuf>,
}

impl AgentInvoker {
    pub fn new(working_dir: Option<std::path::PathBuf>) -> Self {
        Self { working_dir }
    }

    /// Build the argv for an agent, model already resolved.
    pub fn build_args(agent: &AgentConfig, model: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        match agent.family() {
            AgentFamily::ClaudeLike => {
                args.push("-p".into());
                args.push("--permission-mode".into());
                args.push("dontAsk".into());
                if let Some(model) = model {
                    args.push("--model".into());
                    args.push(model.to_string());
                }
                if let Some(tools) = &agent.allowed_tools {
                    args.push("--allowedTools".into());
                    args.push(tools.join(","));
                }
            }
            AgentFamily::CodexLike => {
                args.push("exec".into());
                args.push("--sandbox".into());
                args.push("workspace-write".into());
                args.push("-a".into());
                args.push("never".into());
                args.push("--ephemeral".into());
                if let Some(model) = model {
                    args.push("-m".into());
                    args.push(model.to_string());
                }
                if let Some(effort) = &agent.effort {
                    args.push("-c".into());
                    args.push(format!("model_reasoning_effort={}", effort));
                }
                // Trailing '-' makes codex read the prompt from stdin.
                args.push("-".into());
            }
        }
        args
    }

    /// Run the agent once: prompt via stdin, combined output back.
    ///
    /// Never panics on subprocess failure; the exit code and whatever
    /// output was produced are always returned. A missing binary is the
    /// distinct [`AdapterError::MissingBinary`]. Cancelling `cancel` kills
    /// the child and returns [`AdapterError::Io`] with `Interrupted`.
    pub async fn invoke(
        &self,
        agent: &AgentConfig,
        model: Option<&str>,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<AgentOutput, AdapterError> {
        let args = Self::build_args(agent, model);

        let mut cmd = Command::new(&agent.command);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        if agent.family() == AgentFamily::ClaudeLike {
            if let Some(effort) = &agent.effort {
                cmd.env(CLAUDE_EFFORT_ENV, effort);
            }
        }

        tracing::debug!(agent = %agent.name, command = %agent.command, ?args, "spawning agent");

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AdapterError::MissingBinary {
                    command: agent.command.clone(),
                }
            } else {
                AdapterError::SpawnFailed {
                    command: agent.command.clone(),
                    source: e,
                }
            }
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A child that exits without reading stdin (or crashes early)
            // yields a broken pipe here; the exit code tells that story.
            match stdin.write_all(prompt.as_bytes()).await {
                Ok(()) => {
                    if let Err(e) = stdin.shutdown().await {
                        if e.kind() != std::io::ErrorKind::BrokenPipe {
                            return Err(AdapterError::Io(e));
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(AdapterError::Io(e)),
            }
        }

        let mut stdout = child.stdout.take().ok_or_else(|| {
            AdapterError::Io(std::io::Error::other("child stdout was not piped"))
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| {
            AdapterError::Io(std::io::Error::other("child stderr was not piped"))
        })?;
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(AdapterError::Io(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "agent invocation cancelled",
                )));
            }
            status = async {
                let (out_res, err_res, status) = tokio::join!(
                    stdout.read_to_end(&mut out_buf),
                    stderr.read_to_end(&mut err_buf),
                    child.wait(),
                );
                out_res?;
                err_res?;
                status
            } => status?,
        };

        let mut output = String::from_utf8_lossy(&out_buf).into_owned();
        if !err_buf.is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&String::from_utf8_lossy(&err_buf));
        }

        Ok(AgentOutput {
            output,
            exit_code: status.code().unwrap_or(-1),
        })
    }
}
