//! Workflow checkpoint store: the resume contract.
//!
//! On every stage transition the pipeline writes a `key=value` text file
//! into the run directory (atomic write-to-temp + rename) and repoints
//! the `latest` link. `resume` reads the last persisted record and
//! continues at the first non-completed stage on the same branch.

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// File name of the checkpoint inside a run directory.
pub const CHECKPOINT_FILE: &str = "checkpoint.txt";

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Bootstrap,
    Implement,
    Review,
    Fix,
    Pr,
    Persist,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Bootstrap => "bootstrap",
            Stage::Implement => "implement",
            Stage::Review => "review",
            Stage::Fix => "fix",
            Stage::Pr => "pr",
            Stage::Persist => "persist",
        }
    }

    pub fn all() -> [Stage; 6] {
        [
            Stage::Bootstrap,
            Stage::Implement,
            Stage::Review,
            Stage::Fix,
            Stage::Pr,
            Stage::Persist,
        ]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One run's persisted state: a flat key=value map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointRecord {
    entries: BTreeMap<String, String>,
}

impl CheckpointRecord {
    pub fn new(run_id: &str, phase_id: &str, branch: &str, base_branch: &str) -> Self {
        let mut record = Self::default();
        record.set("run_id", run_id);
        record.set("phase_id", phase_id);
        record.set("branch", branch);
        record.set("base_branch", base_branch);
        record.set("created_at", &now_stamp());
        record
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn run_id(&self) -> Option<&str> {
        self.get("run_id")
    }

    pub fn phase_id(&self) -> Option<&str> {
        self.get("phase_id")
    }

    pub fn branch(&self) -> Option<&str> {
        self.get("branch")
    }

    pub fn base_branch(&self) -> Option<&str> {
        self.get("base_branch")
    }

    /// Record a stage transition.
    pub fn set_stage(&mut self, stage: Stage, status: &str, reason: Option<&str>) {
        self.set(&format!("stage.{}.status", stage), status);
        match reason {
            Some(reason) => self.set(&format!("stage.{}.reason", stage), reason),
            None => {
                self.entries.remove(&format!("stage.{}.reason", stage));
            }
        }
    }

    pub fn stage_status(&self, stage: Stage) -> Option<&str> {
        self.get(&format!("stage.{}.status", stage))
    }

    pub fn stage_reason(&self, stage: Stage) -> Option<&str> {
        self.get(&format!("stage.{}.reason", stage))
    }

    /// First stage that has not completed (or been skipped); `None` when
    /// the run finished.
    pub fn resume_stage(&self) -> Option<Stage> {
        for stage in Stage::all() {
            match self.stage_status(stage) {
                Some("completed") | Some("skipped") => continue,
                _ => return Some(stage),
            }
        }
        None
    }

    /// Serialise as sorted `key=value` lines.
    pub fn to_file_string(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(&format!("{}={}\n", key, value.replace('\n', " ")));
        }
        out
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let (key, value) = trimmed
                .split_once('=')
                .ok_or_else(|| anyhow!("checkpoint: line {} is not key=value", lineno + 1))?;
            entries.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Self { entries })
    }
}

fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Store managing run directories under `.raven/runs/`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    runs_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    /// Create a fresh run directory and return its path with the run id.
    pub fn create_run_dir(&self, phase_id: &str) -> Result<(PathBuf, String)> {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let run_id = format!("run-{}-{}-phase-{}", stamp, &suffix[..8], phase_id);
        let dir = self.runs_dir.join(&run_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("checkpoint: failed to create {}", dir.display()))?;
        Ok((dir, run_id))
    }

    /// Atomically persist the record and repoint `latest`.
    pub fn write(&self, run_dir: &Path, record: &mut CheckpointRecord) -> Result<()> {
        record.set("updated_at", &now_stamp());
        let path = run_dir.join(CHECKPOINT_FILE);
        let tmp = run_dir.join(format!("{}.tmp", CHECKPOINT_FILE));
        std::fs::write(&tmp, record.to_file_string())
            .with_context(|| format!("checkpoint: failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("checkpoint: failed to replace {}", path.display()))?;
        self.update_latest_link(run_dir);
        Ok(())
    }

    pub fn read(run_dir: &Path) -> Result<CheckpointRecord> {
        let path = run_dir.join(CHECKPOINT_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("checkpoint: failed to read {}", path.display()))?;
        CheckpointRecord::parse(&content)
    }

    /// Run directories containing a valid checkpoint, oldest first.
    pub fn list_runs(&self) -> Result<Vec<PathBuf>> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut runs: Vec<PathBuf> = std::fs::read_dir(&self.runs_dir)
            .with_context(|| format!("checkpoint: failed to list {}", self.runs_dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir() && path.join(CHECKPOINT_FILE).exists())
            .collect();
        runs.sort();
        Ok(runs)
    }

    /// The most recent resumable run, if any: the newest run whose
    /// checkpoint still has a non-completed stage.
    pub fn find_resumable(&self) -> Result<Option<(PathBuf, CheckpointRecord)>> {
        for run_dir in self.list_runs()?.into_iter().rev() {
            let record = match Self::read(&run_dir) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(dir = %run_dir.display(), error = %e, "skipping unreadable checkpoint");
                    continue;
                }
            };
            if record.resume_stage().is_some() {
                return Ok(Some((run_dir, record)));
            }
        }
        Ok(None)
    }

    fn update_latest_link(&self, run_dir: &Path) {
        let link = self.runs_dir.join("latest");
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
