//! Next-task selection for the implementation loop.
//!
//! Given a phase's task range and the current task state, the selector
//! returns the first eligible task, a blocked indication, or "no work
//! left". It never mutates state and re-reads the store on every call.

use anyhow::Result;
use std::collections::BTreeMap;

use crate::task::{Task, TaskId};
use crate::task_state::TaskStateStore;

/// Outcome of a selection pass over a phase range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// The next task to hand to the agent.
    Ready(TaskId),
    /// No task is eligible: the first not-completed task and the
    /// dependencies it is still waiting on.
    Blocked { task: TaskId, missing: Vec<TaskId> },
    /// Every task in the range is completed.
    Empty,
}

/// Select the next task from `range` (ascending task ids).
///
/// A task is eligible when its status is not `completed` and every
/// dependency is in the completed set. Ties break on ascending numeric id
/// by construction of the scan order.
pub fn select_next(
    range: &[TaskId],
    tasks: &BTreeMap<TaskId, Task>,
    store: &TaskStateStore,
) -> Result<Selection> {
    let records = store.read_all()?;
    let completed: std::collections::BTreeSet<TaskId> = records
        .iter()
        .filter(|(_, s)| s.is_completed())
        .map(|(id, _)| *id)
        .collect();

    let mut first_incomplete: Option<TaskId> = None;

    for id in range {
        if completed.contains(id) {
            continue;
        }
        if first_incomplete.is_none() {
            first_incomplete = Some(*id);
        }

        let deps: &[TaskId] = tasks.get(id).map(|t| t.dependencies.as_slice()).unwrap_or(&[]);
        if deps.iter().all(|d| completed.contains(d)) {
            return Ok(Selection::Ready(*id));
        }
    }

    match first_incomplete {
        Some(task) => {
            let deps: Vec<TaskId> = tasks
                .get(&task)
                .map(|t| t.dependencies.clone())
                .unwrap_or_default();
            let missing: Vec<TaskId> = deps
                .into_iter()
                .filter(|d| !completed.contains(d))
                .collect();
            Ok(Selection::Blocked { task, missing })
        }
        None => Ok(Selection::Empty),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_state::TaskStatus;
    use std::path::Path;
    use tempfile::tempdir;

    fn task(id: u32, deps: &[u32]) -> Task {
        let deps_line = if deps.is_empty() {
            String::new()
        } else {
            let list: Vec<String> = deps.iter().map(|d| format!("T-{:03}", d)).collect();
            format!("\n**Dependencies:** {}\n", list.join(", "))
        };
        let content = format!("# T-{:03}: Task {}\n{}", id, id, deps_line);
        Task::parse(Path::new("test.md"), &content).unwrap()
    }

    fn setup(tasks_spec: &[(u32, &[u32])]) -> (BTreeMap<TaskId, Task>, Vec<TaskId>) {
        let mut tasks = BTreeMap::new();
        let mut range = Vec::new();
        for (id, deps) in tasks_spec {
            tasks.insert(TaskId(*id), task(*id, deps));
            range.push(TaskId(*id));
        }
        (tasks, range)
    }

    #[test]
    fn test_selects_first_eligible_after_completed() {
        // Phase 1, range T-001..T-003: T-001 completed, T-003 depends on
        // T-002. The selector must return T-002.
        let dir = tempdir().unwrap();
        let store = TaskStateStore::new(dir.path().join("state"));
        store.set(TaskId(1), TaskStatus::Completed).unwrap();

        let (tasks, range) = setup(&[(1, &[]), (2, &[]), (3, &[2])]);
        let selection = select_next(&range, &tasks, &store).unwrap();
        assert_eq!(selection, Selection::Ready(TaskId(2)));
    }

    #[test]
    fn test_empty_when_all_completed() {
        let dir = tempdir().unwrap();
        let store = TaskStateStore::new(dir.path().join("state"));
        store.set(TaskId(1), TaskStatus::Completed).unwrap();
        store.set(TaskId(2), TaskStatus::Completed).unwrap();

        let (tasks, range) = setup(&[(1, &[]), (2, &[])]);
        let selection = select_next(&range, &tasks, &store).unwrap();
        assert_eq!(selection, Selection::Empty);
    }

    #[test]
    fn test_blocked_carries_missing_dependencies() {
        let dir = tempdir().unwrap();
        let store = TaskStateStore::new(dir.path().join("state"));

        // T-002 depends on T-001 which lives outside this range and is
        // not completed.
        let (tasks, _) = setup(&[(1, &[]), (2, &[1])]);
        let range = vec![TaskId(2)];
        let selection = select_next(&range, &tasks, &store).unwrap();
        assert_eq!(
            selection,
            Selection::Blocked {
                task: TaskId(2),
                missing: vec![TaskId(1)],
            }
        );
    }

    #[test]
    fn test_dependency_cycle_reports_blocked_not_loop() {
        let dir = tempdir().unwrap();
        let store = TaskStateStore::new(dir.path().join("state"));

        let (tasks, range) = setup(&[(1, &[2]), (2, &[1])]);
        let selection = select_next(&range, &tasks, &store).unwrap();
        match selection {
            Selection::Blocked { task, missing } => {
                assert_eq!(task, TaskId(1));
                assert_eq!(missing, vec![TaskId(2)]);
            }
            other => panic!("expected Blocked, got {:?}", other),
        }
    }

    #[test]
    fn test_in_progress_task_is_still_selectable() {
        // A crashed iteration may leave a task in_progress; it is not
        // completed, so it is picked up again.
        let dir = tempdir().unwrap();
        let store = TaskStateStore::new(dir.path().join("state"));
        store.set(TaskId(1), TaskStatus::InProgress).unwrap();

        let (tasks, range) = setup(&[(1, &[]), (2, &[])]);
        let selection = select_next(&range, &tasks, &store).unwrap();
        assert_eq!(selection, Selection::Ready(TaskId(1)));
    }

    #[test]
    fn test_skips_blocked_head_for_eligible_later_task() {
        // T-001 waits on an external dependency, T-002 is free: the
        // selector picks T-002 rather than reporting blocked.
        let dir = tempdir().unwrap();
        let store = TaskStateStore::new(dir.path().join("state"));

        let (tasks, range) = setup(&[(1, &[9]), (2, &[])]);
        let selection = select_next(&range, &tasks, &store).unwrap();
        assert_eq!(selection, Selection::Ready(TaskId(2)));
    }

    #[test]
    fn test_selection_does_not_mutate_state() {
        let dir = tempdir().unwrap();
        let store = TaskStateStore::new(dir.path().join("state"));
        store.set(TaskId(1), TaskStatus::NotStarted).unwrap();
        let before = std::fs::read_to_string(store.path()).unwrap();

        let (tasks, range) = setup(&[(1, &[])]);
        select_next(&range, &tasks, &store).unwrap();

        let after = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(before, after);
    }
}
