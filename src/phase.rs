//! Phase definitions and the phases file loader.
//!
//! A phase covers a contiguous task range and maps to one branch
//! (`phase/<id>-<slug>`). Phases are defined in a pipe-delimited file:
//!
//! ```text
//! # phase_id|slug|title|start|end|icon
//! 1|foundation|Foundation layer|001|003|🏗
//! 2|engine|Execution engine|004|009|⚙
//! ```
//!
//! Range columns are three-digit numerics matching task ids.

use anyhow::{Context, Result, anyhow};
use std::collections::BTreeMap;
use std::path::Path;

use crate::task::{Task, TaskId};
use crate::task_state::TaskStateStore;

/// A single phase: id, slug (branch naming), title, task range, icon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub id: String,
    pub slug: String,
    pub title: String,
    pub start: TaskId,
    pub end: TaskId,
    pub icon: String,
}

impl Phase {
    /// Branch this phase's work lands on.
    pub fn branch_name(&self) -> String {
        format!("phase/{}-{}", self.id, self.slug)
    }

    /// All task ids in the range, ascending.
    pub fn task_range(&self) -> Vec<TaskId> {
        (self.start.0..=self.end.0).map(TaskId).collect()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        id >= self.start && id <= self.end
    }

    /// Count of tasks in this phase not yet completed.
    pub fn remaining(&self, store: &TaskStateStore) -> Result<usize> {
        let range = self.task_range();
        store.count_remaining(range.iter())
    }
}

/// The ordered set of phases from the phases file.
#[derive(Debug, Clone)]
pub struct PhaseSet {
    pub phases: Vec<Phase>,
}

impl PhaseSet {
    /// Load and structurally validate the phases file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("phases: failed to read {}", path.display()))?;

        let mut phases = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = trimmed.split('|').collect();
            if parts.len() != 6 {
                return Err(anyhow!(
                    "phases: line {} of {} has {} fields, expected 6 (id|slug|title|start|end|icon)",
                    lineno + 1,
                    path.display(),
                    parts.len()
                ));
            }
            let start = parse_range_bound(parts[3])
                .with_context(|| format!("phases: line {} start", lineno + 1))?;
            let end = parse_range_bound(parts[4])
                .with_context(|| format!("phases: line {} end", lineno + 1))?;
            phases.push(Phase {
                id: parts[0].trim().to_string(),
                slug: parts[1].trim().to_string(),
                title: parts[2].trim().to_string(),
                start,
                end,
                icon: parts[5].trim().to_string(),
            });
        }

        let set = Self { phases };
        set.validate_ranges()?;
        Ok(set)
    }

    /// Ranges must be well-formed, ordered, disjoint and contiguous.
    fn validate_ranges(&self) -> Result<()> {
        for phase in &self.phases {
            if phase.start > phase.end {
                return Err(anyhow!(
                    "phases: phase '{}' has inverted range {}..{}",
                    phase.id,
                    phase.start,
                    phase.end
                ));
            }
            if phase.id.is_empty() || phase.slug.is_empty() {
                return Err(anyhow!("phases: phase id and slug must be non-empty"));
            }
        }
        for pair in self.phases.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.start.0 != prev.end.0 + 1 {
                return Err(anyhow!(
                    "phases: phase '{}' range must start at {} (right after phase '{}'), found {}",
                    next.id,
                    TaskId(prev.end.0 + 1),
                    prev.id,
                    next.start
                ));
            }
        }
        Ok(())
    }

    /// Every task id referenced by a range must have a spec file.
    pub fn validate_against_tasks(&self, tasks: &BTreeMap<TaskId, Task>) -> Result<()> {
        for phase in &self.phases {
            for id in phase.task_range() {
                if !tasks.contains_key(&id) {
                    return Err(anyhow!(
                        "phases: phase '{}' references {} but no task spec exists for it",
                        phase.id,
                        id
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// Phases starting at `id`, in file order.
    pub fn from_phase(&self, id: &str) -> Result<Vec<&Phase>> {
        let pos = self
            .phases
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| anyhow!("phases: unknown phase '{}'", id))?;
        Ok(self.phases[pos..].iter().collect())
    }
}

fn parse_range_bound(s: &str) -> Result<TaskId> {
    let s = s.trim();
    if s.len() != 3 || !s.chars().all(|c| c.is_ascii_digit()) {
        return Err(anyhow!(
            "range bound '{}' must be a zero-padded three-digit task number",
            s
        ));
    }
    Ok(TaskId(s.parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_state::TaskStatus;
    use std::fs;
    use tempfile::tempdir;

    const PHASES: &str = "\
# comment line
1|foundation|Foundation layer|001|003|A
2|engine|Execution engine|004|006|B
";

    fn write_phases(dir: &Path, content: &str) -> std::path::PathBuf {
        let path = dir.join("phases.txt");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_parses_fields() {
        let dir = tempdir().unwrap();
        let path = write_phases(dir.path(), PHASES);
        let set = PhaseSet::load(&path).unwrap();

        assert_eq!(set.phases.len(), 2);
        let p = &set.phases[0];
        assert_eq!(p.id, "1");
        assert_eq!(p.slug, "foundation");
        assert_eq!(p.title, "Foundation layer");
        assert_eq!(p.start, TaskId(1));
        assert_eq!(p.end, TaskId(3));
        assert_eq!(p.icon, "A");
    }

    #[test]
    fn test_branch_name() {
        let dir = tempdir().unwrap();
        let path = write_phases(dir.path(), PHASES);
        let set = PhaseSet::load(&path).unwrap();
        assert_eq!(set.phases[0].branch_name(), "phase/1-foundation");
    }

    #[test]
    fn test_task_range_is_ascending() {
        let dir = tempdir().unwrap();
        let path = write_phases(dir.path(), PHASES);
        let set = PhaseSet::load(&path).unwrap();
        assert_eq!(
            set.phases[1].task_range(),
            vec![TaskId(4), TaskId(5), TaskId(6)]
        );
    }

    #[test]
    fn test_load_rejects_wrong_field_count() {
        let dir = tempdir().unwrap();
        let path = write_phases(dir.path(), "1|foundation|Title|001|003\n");
        let err = PhaseSet::load(&path).unwrap_err();
        assert!(err.to_string().contains("expected 6"));
    }

    #[test]
    fn test_load_rejects_non_three_digit_bounds() {
        let dir = tempdir().unwrap();
        let path = write_phases(dir.path(), "1|foundation|Title|1|3|A\n");
        assert!(PhaseSet::load(&path).is_err());
    }

    #[test]
    fn test_load_rejects_inverted_range() {
        let dir = tempdir().unwrap();
        let path = write_phases(dir.path(), "1|foundation|Title|005|003|A\n");
        let err = PhaseSet::load(&path).unwrap_err();
        assert!(err.to_string().contains("inverted range"));
    }

    #[test]
    fn test_load_rejects_overlapping_ranges() {
        let dir = tempdir().unwrap();
        let path = write_phases(
            dir.path(),
            "1|a|First|001|003|A\n2|b|Second|003|005|B\n",
        );
        assert!(PhaseSet::load(&path).is_err());
    }

    #[test]
    fn test_load_rejects_gap_between_ranges() {
        let dir = tempdir().unwrap();
        let path = write_phases(
            dir.path(),
            "1|a|First|001|003|A\n2|b|Second|005|006|B\n",
        );
        assert!(PhaseSet::load(&path).is_err());
    }

    #[test]
    fn test_validate_against_tasks_flags_missing_spec() {
        let dir = tempdir().unwrap();
        let path = write_phases(dir.path(), "1|a|First|001|002|A\n");
        let set = PhaseSet::load(&path).unwrap();

        let mut tasks = BTreeMap::new();
        let t1 = Task::parse(Path::new("T-001-x.md"), "# T-001: One\n").unwrap();
        tasks.insert(t1.id, t1);

        let err = set.validate_against_tasks(&tasks).unwrap_err();
        assert!(err.to_string().contains("T-002"));
    }

    #[test]
    fn test_get_and_from_phase() {
        let dir = tempdir().unwrap();
        let path = write_phases(dir.path(), PHASES);
        let set = PhaseSet::load(&path).unwrap();

        assert_eq!(set.get("2").unwrap().slug, "engine");
        assert!(set.get("9").is_none());

        let tail = set.from_phase("2").unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id, "2");

        assert!(set.from_phase("9").is_err());
    }

    #[test]
    fn test_remaining_counts_non_completed() {
        let dir = tempdir().unwrap();
        let path = write_phases(dir.path(), PHASES);
        let set = PhaseSet::load(&path).unwrap();

        let store = TaskStateStore::new(dir.path().join("state"));
        store.set(TaskId(1), TaskStatus::Completed).unwrap();
        store.set(TaskId(2), TaskStatus::InProgress).unwrap();

        assert_eq!(set.phases[0].remaining(&store).unwrap(), 2);
        assert_eq!(set.phases[1].remaining(&store).unwrap(), 3);
    }
}
