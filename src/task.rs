//! Task definitions and task-spec markdown loading.
//!
//! Tasks are discovered once at startup from the tasks directory and never
//! mutated during a run. A task spec lives at `docs/tasks/T-NNN-<slug>.md`
//! and starts with a `# T-NNN: <title>` heading; an optional
//! `**Dependencies:**` line lists required task ids.

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

static TASK_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"T-(\d{3})").unwrap());

static HEADING_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#\s+(T-\d{3}):\s*(.+?)\s*$").unwrap());

static PRIORITY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\*\*Priority:\*\*\s*(\d+)").unwrap());

/// Canonical task identifier `T-NNN` (three digits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u32);

impl TaskId {
    pub fn number(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T-{:03}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let rest = s
            .strip_prefix("T-")
            .ok_or_else(|| anyhow!("invalid task id '{}': expected T-NNN", s))?;
        if rest.len() != 3 || !rest.chars().all(|c| c.is_ascii_digit()) {
            return Err(anyhow!("invalid task id '{}': expected three digits", s));
        }
        Ok(TaskId(rest.parse()?))
    }
}

impl serde::Serialize for TaskId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for TaskId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A single task loaded from its spec file.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    /// Ids of tasks that must be completed first.
    pub dependencies: Vec<TaskId>,
    pub priority: Option<u32>,
    /// Full markdown body, passed to the agent untouched.
    pub body: String,
    pub path: PathBuf,
}

impl Task {
    /// Parse a task spec from markdown content.
    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        let first_line = content
            .lines()
            .next()
            .ok_or_else(|| anyhow!("task spec {} is empty", path.display()))?;
        let caps = HEADING_REGEX.captures(first_line).ok_or_else(|| {
            anyhow!(
                "task spec {} must start with '# T-NNN: <title>'",
                path.display()
            )
        })?;
        let id: TaskId = caps[1].parse()?;
        let title = caps[2].to_string();

        let mut dependencies: Vec<TaskId> = Vec::new();
        for line in content.lines() {
            if let Some(rest) = line.trim_start().strip_prefix("**Dependencies:**") {
                for cap in TASK_ID_REGEX.captures_iter(rest) {
                    let dep = TaskId(cap[1].parse()?);
                    if !dependencies.contains(&dep) {
                        dependencies.push(dep);
                    }
                }
            }
        }
        dependencies.sort();

        let priority = PRIORITY_REGEX
            .captures(content)
            .and_then(|c| c[1].parse().ok());

        Ok(Self {
            id,
            title,
            dependencies,
            priority,
            body: content.to_string(),
            path: path.to_path_buf(),
        })
    }

    /// Load a task spec file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read task spec {}", path.display()))?;
        Self::parse(path, &content)
    }
}

/// Load every task spec under the tasks directory, keyed by id.
///
/// Duplicate ids across files are a configuration error.
pub fn load_tasks(tasks_dir: &Path) -> Result<BTreeMap<TaskId, Task>> {
    let pattern = tasks_dir.join("T-*.md").to_string_lossy().to_string();
    let mut tasks = BTreeMap::new();

    for entry in glob::glob(&pattern).context("failed to read tasks glob pattern")? {
        let path = entry.context("failed to read tasks directory entry")?;
        let task = Task::load(&path)?;
        let id = task.id;
        if tasks.insert(id, task).is_some() {
            return Err(anyhow!(
                "duplicate task id {} (second definition in {})",
                id,
                path.display()
            ));
        }
    }

    Ok(tasks)
}
