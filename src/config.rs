//! Unified configuration for Raven.
//!
//! Reads `raven.toml` from the project root and layers CLI flags on top.
//! Sections:
//!
//! ```toml
//! [project]
//! name = "my-project"
//! tasks_dir = "docs/tasks"
//! phases_file = "docs/phases.txt"
//!
//! [agents.implementer]
//! name = "claude"
//! command = "claude"
//! model = "sonnet"
//!
//! [[agents.reviewers]]
//! name = "claude"
//! command = "claude"
//!
//! [review]
//! concurrency = 3
//! max_cycles = 2
//!
//! [limits]
//! max_iterations = 20
//! max_rate_limit_waits = 5
//! max_wait_secs = 21600
//! ```
//!
//! The runtime [`Config`] resolves every path Raven touches and owns the
//! single-writer run lock for the working tree.

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::agent::AgentConfig;

/// Project-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Project name (optional, defaults to directory name).
    #[serde(default)]
    pub name: Option<String>,
    /// Task spec directory, relative to the project root.
    #[serde(default)]
    pub tasks_dir: Option<String>,
    /// Phases definition file, relative to the project root.
    #[serde(default)]
    pub phases_file: Option<String>,
}

/// Agent roster: one implementer, N reviewers, an optional dedicated fixer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsSection {
    #[serde(default = "AgentConfig::claude_default")]
    pub implementer: AgentConfig,
    #[serde(default = "default_reviewers")]
    pub reviewers: Vec<AgentConfig>,
    /// Falls back to the implementer when absent.
    #[serde(default)]
    pub fixer: Option<AgentConfig>,
}

fn default_reviewers() -> Vec<AgentConfig> {
    vec![AgentConfig::claude_default()]
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            implementer: AgentConfig::claude_default(),
            reviewers: default_reviewers(),
            fixer: None,
        }
    }
}

impl AgentsSection {
    /// The agent used by the fix stage.
    pub fn fixer(&self) -> &AgentConfig {
        self.fixer.as_ref().unwrap_or(&self.implementer)
    }
}

/// Review orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSection {
    /// Maximum review agents running concurrently.
    #[serde(default = "default_review_concurrency")]
    pub concurrency: usize,
    /// Maximum review passes per phase (initial review + re-reviews).
    #[serde(default = "default_max_review_cycles")]
    pub max_cycles: u32,
}

fn default_review_concurrency() -> usize {
    3
}

fn default_max_review_cycles() -> u32 {
    2
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            concurrency: default_review_concurrency(),
            max_cycles: default_max_review_cycles(),
        }
    }
}

/// Implementation-loop limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSection {
    /// Hard cap on loop iterations per phase.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Hard cap on rate-limit cooldowns per loop run.
    #[serde(default = "default_max_rate_limit_waits")]
    pub max_rate_limit_waits: u32,
    /// Ceiling on a single cooldown wait, in seconds.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
}

fn default_max_iterations() -> u32 {
    20
}

fn default_max_rate_limit_waits() -> u32 {
    5
}

fn default_max_wait_secs() -> u64 {
    6 * 60 * 60
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_rate_limit_waits: default_max_rate_limit_waits(),
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

/// The parsed `raven.toml` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RavenToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub agents: AgentsSection,
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub limits: LimitsSection,
}

impl RavenToml {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("config: failed to read {}", path.display()))?;
        let toml: RavenToml = toml::from_str(&content)
            .with_context(|| format!("config: failed to parse {}", path.display()))?;
        Ok(toml)
    }

    /// Load from `<root>/raven.toml` if present, defaults otherwise.
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let path = root.join("raven.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate and return human-readable warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for agent in std::iter::once(&self.agents.implementer)
            .chain(self.agents.reviewers.iter())
            .chain(self.agents.fixer.iter())
        {
            if let Err(e) = agent.validate() {
                warnings.push(e.to_string());
            }
        }
        if self.agents.reviewers.is_empty() {
            warnings.push("no review agents configured, review stage will be empty".to_string());
        }
        if self.review.concurrency == 0 {
            warnings.push("review.concurrency must be at least 1".to_string());
        }
        if self.review.max_cycles == 0 {
            warnings.push("review.max_cycles must be at least 1".to_string());
        }
        if self.limits.max_iterations == 0 {
            warnings.push("limits.max_iterations must be at least 1".to_string());
        }

        warnings
    }
}

/// Runtime configuration: resolved paths plus the parsed TOML.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_root: PathBuf,
    pub tasks_dir: PathBuf,
    pub phases_file: PathBuf,
    pub state_file: PathBuf,
    pub runs_dir: PathBuf,
    pub reviews_dir: PathBuf,
    pub log_dir: PathBuf,
    pub lock_file: PathBuf,
    pub toml: RavenToml,
    pub verbose: bool,
}

impl Config {
    /// Resolve the runtime configuration.
    ///
    /// The project root comes from the explicit argument, then the
    /// `PROJECT_ROOT` environment variable, then the current directory.
    pub fn new(project_root: Option<PathBuf>, verbose: bool) -> Result<Self> {
        let root = match project_root {
            Some(dir) => dir,
            None => match std::env::var_os("PROJECT_ROOT") {
                Some(dir) => PathBuf::from(dir),
                None => std::env::current_dir().context("config: failed to get current dir")?,
            },
        };
        let project_root = root
            .canonicalize()
            .with_context(|| format!("config: failed to resolve project root {}", root.display()))?;

        let toml = RavenToml::load_or_default(&project_root)?;

        let tasks_dir = project_root.join(
            toml.project
                .tasks_dir
                .as_deref()
                .unwrap_or("docs/tasks"),
        );
        let phases_file = project_root.join(
            toml.project
                .phases_file
                .as_deref()
                .unwrap_or("docs/phases.txt"),
        );
        let raven_dir = project_root.join(".raven");

        Ok(Self {
            tasks_dir,
            phases_file,
            state_file: raven_dir.join("task-state"),
            runs_dir: raven_dir.join("runs"),
            reviews_dir: raven_dir.join("reviews"),
            log_dir: raven_dir.join("logs"),
            lock_file: raven_dir.join("lock"),
            project_root,
            toml,
            verbose,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.runs_dir).context("config: failed to create runs dir")?;
        std::fs::create_dir_all(&self.reviews_dir)
            .context("config: failed to create reviews dir")?;
        std::fs::create_dir_all(&self.log_dir).context("config: failed to create log dir")?;
        Ok(())
    }

    /// Take the advisory single-writer lock for this working tree.
    ///
    /// Held for the whole run; a second concurrent run fails fast.
    pub fn acquire_run_lock(&self) -> Result<RunLock> {
        if let Some(parent) = self.lock_file.parent() {
            std::fs::create_dir_all(parent).context("config: failed to create .raven dir")?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_file)
            .with_context(|| format!("config: failed to open {}", self.lock_file.display()))?;
        file.try_lock_exclusive().with_context(|| {
            format!(
                "config: another raven run holds the lock on {}",
                self.lock_file.display()
            )
        })?;
        Ok(RunLock { file })
    }
}

/// Exclusive advisory lock over the working tree; released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: std::fs::File,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
