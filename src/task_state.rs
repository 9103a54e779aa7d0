//! The machine-readable task-state store.
//!
//! One pipe-delimited line per task: `T-NNN|status|YYYY-MM-DD`. Comment
//! lines starting with `#` and blank lines are ignored. Statuses are
//! normalised on read (case- and whitespace-insensitive, common aliases
//! mapped) and the file is replaced atomically on write.
//!
//! The store is single-writer by protocol: one implementation loop per
//! working tree. It keeps no in-memory cache, every query re-reads the
//! file.

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::task::TaskId;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Blocked,
}

impl TaskStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::NotStarted => "not_started",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalised: String = s
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
            .collect();
        match normalised.as_str() {
            "notstarted" | "todo" | "pending" | "open" => Ok(TaskStatus::NotStarted),
            "inprogress" | "wip" | "started" | "active" => Ok(TaskStatus::InProgress),
            "completed" | "complete" | "done" | "finished" => Ok(TaskStatus::Completed),
            "blocked" | "block" | "stuck" => Ok(TaskStatus::Blocked),
            _ => Err(anyhow!("unknown task status '{}'", s)),
        }
    }
}

/// Read/write access to the task-state file.
#[derive(Debug, Clone)]
pub struct TaskStateStore {
    path: PathBuf,
}

impl TaskStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record. Malformed lines are an error, not skipped:
    /// the file is machine-written and corruption should be loud.
    pub fn read_all(&self) -> Result<BTreeMap<TaskId, TaskStatus>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("state: failed to read {}", self.path.display()))?;

        let mut records = BTreeMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut parts = trimmed.split('|');
            let id: TaskId = parts
                .next()
                .ok_or_else(|| anyhow!("state: line {} has no task id", lineno + 1))?
                .parse()
                .with_context(|| format!("state: line {} of {}", lineno + 1, self.path.display()))?;
            let status: TaskStatus = parts
                .next()
                .ok_or_else(|| anyhow!("state: line {} has no status", lineno + 1))?
                .parse()
                .with_context(|| format!("state: line {} of {}", lineno + 1, self.path.display()))?;
            // Third field is the date; kept in the file, not in memory.
            records.insert(id, status);
        }
        Ok(records)
    }

    /// Status of one task; unrecorded tasks are `not_started`.
    pub fn status_of(&self, id: TaskId) -> Result<TaskStatus> {
        Ok(self.read_all()?.get(&id).copied().unwrap_or_default())
    }

    /// Set one task's status, keeping exactly one record per task.
    ///
    /// The whole file is rewritten to a temp file and renamed into place.
    pub fn set(&self, id: TaskId, status: TaskStatus) -> Result<()> {
        let mut records = self.read_all()?;
        records.insert(id, status);
        self.write_all(&records)
    }

    /// Ids of all completed tasks.
    pub fn completed_set(&self) -> Result<std::collections::BTreeSet<TaskId>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|(_, s)| s.is_completed())
            .map(|(id, _)| id)
            .collect())
    }

    /// Count of tasks in `ids` that are not yet completed.
    pub fn count_remaining<'a>(&self, ids: impl IntoIterator<Item = &'a TaskId>) -> Result<usize> {
        let records = self.read_all()?;
        Ok(ids
            .into_iter()
            .filter(|id| {
                !records
                    .get(id)
                    .copied()
                    .unwrap_or_default()
                    .is_completed()
            })
            .count())
    }

    fn write_all(&self, records: &BTreeMap<TaskId, TaskStatus>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("state: failed to create {}", parent.display()))?;
        }
        let today = Utc::now().format("%Y-%m-%d");
        let mut content = String::new();
        for (id, status) in records {
            content.push_str(&format!("{}|{}|{}\n", id, status, today));
        }

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("state: failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("state: failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> TaskStateStore {
        TaskStateStore::new(dir.join("task-state"))
    }

    #[test]
    fn test_status_parse_canonical_values() {
        assert_eq!(
            "not_started".parse::<TaskStatus>().unwrap(),
            TaskStatus::NotStarted
        );
        assert_eq!(
            "in_progress".parse::<TaskStatus>().unwrap(),
            TaskStatus::InProgress
        );
        assert_eq!(
            "completed".parse::<TaskStatus>().unwrap(),
            TaskStatus::Completed
        );
        assert_eq!("blocked".parse::<TaskStatus>().unwrap(), TaskStatus::Blocked);
    }

    #[test]
    fn test_status_parse_aliases_and_case() {
        assert_eq!("DONE".parse::<TaskStatus>().unwrap(), TaskStatus::Completed);
        assert_eq!(
            "  In Progress ".parse::<TaskStatus>().unwrap(),
            TaskStatus::InProgress
        );
        assert_eq!("todo".parse::<TaskStatus>().unwrap(), TaskStatus::NotStarted);
        assert_eq!("WIP".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
    }

    #[test]
    fn test_status_parse_unknown_fails() {
        assert!("banana".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_read_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_set_then_get_roundtrip() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        store.set(TaskId(1), TaskStatus::Completed).unwrap();
        store.set(TaskId(2), TaskStatus::InProgress).unwrap();

        assert_eq!(store.status_of(TaskId(1)).unwrap(), TaskStatus::Completed);
        assert_eq!(store.status_of(TaskId(2)).unwrap(), TaskStatus::InProgress);
        assert_eq!(store.status_of(TaskId(3)).unwrap(), TaskStatus::NotStarted);
    }

    #[test]
    fn test_set_overwrites_single_record() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        store.set(TaskId(1), TaskStatus::InProgress).unwrap();
        store.set(TaskId(1), TaskStatus::Completed).unwrap();

        let content = fs::read_to_string(store.path()).unwrap();
        let records: Vec<&str> = content.lines().filter(|l| l.contains("T-001")).collect();
        assert_eq!(records.len(), 1);
        assert!(records[0].contains("completed"));
    }

    #[test]
    fn test_read_skips_comments_and_blanks() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        fs::write(
            store.path(),
            "# raven task state\n\nT-001|completed|2026-02-17\nT-002|not_started|2026-02-17\n",
        )
        .unwrap();

        let records = store.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[&TaskId(1)], TaskStatus::Completed);
    }

    #[test]
    fn test_read_normalises_aliases() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        fs::write(store.path(), "T-001|Done|2026-02-17\nT-002| BLOCKED |2026-02-17\n").unwrap();

        let records = store.read_all().unwrap();
        assert_eq!(records[&TaskId(1)], TaskStatus::Completed);
        assert_eq!(records[&TaskId(2)], TaskStatus::Blocked);
    }

    #[test]
    fn test_read_malformed_line_is_loud() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        fs::write(store.path(), "T-001|completed|2026-02-17\ngarbage line\n").unwrap();
        assert!(store.read_all().is_err());
    }

    #[test]
    fn test_file_format_is_pipe_delimited_with_date() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.set(TaskId(7), TaskStatus::Blocked).unwrap();

        let content = fs::read_to_string(store.path()).unwrap();
        let line = content.lines().next().unwrap();
        let parts: Vec<&str> = line.split('|').collect();
        assert_eq!(parts[0], "T-007");
        assert_eq!(parts[1], "blocked");
        assert_eq!(parts[2].len(), 10); // YYYY-MM-DD
    }

    #[test]
    fn test_completed_set_and_count_remaining() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.set(TaskId(1), TaskStatus::Completed).unwrap();
        store.set(TaskId(2), TaskStatus::InProgress).unwrap();

        let completed = store.completed_set().unwrap();
        assert!(completed.contains(&TaskId(1)));
        assert!(!completed.contains(&TaskId(2)));

        let range = [TaskId(1), TaskId(2), TaskId(3)];
        assert_eq!(store.count_remaining(range.iter()).unwrap(), 2);
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.set(TaskId(1), TaskStatus::Completed).unwrap();
        assert!(!store.path().with_extension("tmp").exists());
    }
}
