//! Cascading status updates after a task's status changes.
//!
//! The cascade is computed iteratively from a work queue with a visited set
//! keyed by task path, so every task is expanded at most once per top-level
//! update and the walk terminates even on malformed graphs. Cascaded changes
//! are staged in a [`StatusUpdateBatch`] overlay (later steps read staged
//! values, not stale rows) and flushed in one pass at the end, each touched
//! task receiving exactly one version bump.
//!
//! Rules, applied to the task being expanded:
//!
//! | New status    | Parent                                        | Dependents                                          |
//! |---------------|-----------------------------------------------|-----------------------------------------------------|
//! | `IN_PROGRESS` | `PENDING` parent becomes `IN_PROGRESS`        | -                                                   |
//! | `BLOCKED`     | -                                             | become `BLOCKED` unless `FAILED`                    |
//! | `FAILED`      | becomes `FAILED`                              | become `BLOCKED` with a block reason unless `FAILED` |
//! | `COMPLETED`   | becomes `COMPLETED` once all children are     | `BLOCKED` ones return to `PENDING` once every dependency is `COMPLETED` |

use crate::libs::error::Result;
use crate::libs::task::{now_millis, Task, TaskStatus};
use crate::ops::graph::{TaskGraph, TaskStore};
use std::collections::{BTreeMap, HashSet, VecDeque};

/// Staged cascade writes, keyed by path, in first-staged order.
#[derive(Debug, Default)]
pub struct StatusUpdateBatch {
    staged: BTreeMap<String, (Task, Task)>,
    order: Vec<String>,
}

impl StatusUpdateBatch {
    /// Current view of `path`: the staged copy if any, else the stored row.
    pub fn view<G: TaskGraph + ?Sized>(&self, graph: &G, path: &str) -> Result<Option<Task>> {
        match self.staged.get(path) {
            Some((_, after)) => Ok(Some(after.clone())),
            None => graph.task(path),
        }
    }

    fn overlay(&self, task: Task) -> Task {
        match self.staged.get(&task.path) {
            Some((_, after)) => after.clone(),
            None => task,
        }
    }

    /// Stages `after`; `before` is kept from the first staging of the path.
    pub fn stage(&mut self, before: &Task, after: Task) {
        match self.staged.get_mut(&after.path) {
            Some(entry) => entry.1 = after,
            None => {
                self.order.push(after.path.clone());
                self.staged.insert(after.path.clone(), (before.clone(), after));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Writes every staged task once, bumping its version. Returns the
    /// written tasks in staging order.
    pub fn flush<S: TaskStore + ?Sized>(mut self, store: &mut S) -> Result<Vec<Task>> {
        let mut written = Vec::with_capacity(self.order.len());
        for path in std::mem::take(&mut self.order) {
            if let Some((before, mut after)) = self.staged.remove(&path) {
                after.touch();
                store.write(&before, &after)?;
                written.push(after);
            }
        }
        Ok(written)
    }
}

/// Cascades the status of `root`, which must already be written with its
/// new status. Returns the cascaded tasks as written.
pub fn propagate<S: TaskStore + ?Sized>(store: &mut S, root: &Task) -> Result<Vec<Task>> {
    let batch = plan(&*store, root)?;
    batch.flush(store)
}

/// Computes the cascade for `root` without writing anything.
pub fn plan<G: TaskGraph + ?Sized>(graph: &G, root: &Task) -> Result<StatusUpdateBatch> {
    let mut batch = StatusUpdateBatch::default();
    let mut visited: HashSet<String> = HashSet::from([root.path.clone()]);
    let mut queue: VecDeque<Task> = VecDeque::from([root.clone()]);

    while let Some(task) = queue.pop_front() {
        let mut changed: Vec<Task> = Vec::new();
        match task.status {
            TaskStatus::InProgress => {
                if let Some(parent) = parent_view(graph, &batch, &task)? {
                    if parent.status == TaskStatus::Pending {
                        changed.push(with_status(&mut batch, &parent, TaskStatus::InProgress));
                    }
                }
            }
            TaskStatus::Blocked => {
                for dependent in dependents_view(graph, &batch, &task.path)? {
                    if let Some(after) = block_dependent(&mut batch, &root.path, &dependent, &task.path, None) {
                        changed.push(after);
                    }
                }
            }
            TaskStatus::Failed => {
                let reason = format!("dependency '{}' failed", task.path);
                for dependent in dependents_view(graph, &batch, &task.path)? {
                    if let Some(after) =
                        block_dependent(&mut batch, &root.path, &dependent, &task.path, Some(reason.clone()))
                    {
                        changed.push(after);
                    }
                }
                if let Some(parent) = parent_view(graph, &batch, &task)? {
                    if parent.status != TaskStatus::Failed {
                        changed.push(with_status(&mut batch, &parent, TaskStatus::Failed));
                    }
                }
            }
            TaskStatus::Completed => {
                for dependent in dependents_view(graph, &batch, &task.path)? {
                    if dependent.status != TaskStatus::Blocked {
                        continue;
                    }
                    if !all_completed(graph, &batch, &dependent.dependencies)? {
                        continue;
                    }
                    let mut after = dependent.clone();
                    after.status = TaskStatus::Pending;
                    after.metadata.clear_block();
                    after.metadata.unblocked_at = Some(now_millis());
                    batch.stage(&dependent, after.clone());
                    changed.push(after);
                }
                if let Some(parent) = parent_view(graph, &batch, &task)? {
                    if parent.status != TaskStatus::Completed && children_completed(graph, &batch, &parent.path)? {
                        changed.push(with_status(&mut batch, &parent, TaskStatus::Completed));
                    }
                }
            }
            TaskStatus::Pending => {}
        }

        for next in changed {
            if visited.insert(next.path.clone()) {
                queue.push_back(next);
            }
        }
    }
    Ok(batch)
}

/// Stages `dependent` as blocked by `blocker`. Failed tasks, the cascade
/// root and tasks already carrying this exact block are left alone.
fn block_dependent(
    batch: &mut StatusUpdateBatch,
    root: &str,
    dependent: &Task,
    blocker: &str,
    reason: Option<String>,
) -> Option<Task> {
    if dependent.status == TaskStatus::Failed || dependent.path == root {
        return None;
    }
    if dependent.status == TaskStatus::Blocked
        && dependent.metadata.blocked_by.as_deref() == Some(blocker)
        && dependent.metadata.block_reason == reason
    {
        return None;
    }
    let mut after = dependent.clone();
    after.status = TaskStatus::Blocked;
    after.metadata.blocked_by = Some(blocker.to_string());
    after.metadata.blocked_at = Some(now_millis());
    after.metadata.block_reason = reason;
    batch.stage(dependent, after.clone());
    Some(after)
}

fn with_status(batch: &mut StatusUpdateBatch, task: &Task, status: TaskStatus) -> Task {
    let mut after = task.clone();
    after.status = status;
    batch.stage(task, after.clone());
    after
}

fn parent_view<G: TaskGraph + ?Sized>(graph: &G, batch: &StatusUpdateBatch, task: &Task) -> Result<Option<Task>> {
    match &task.parent_path {
        Some(parent) => batch.view(graph, parent),
        None => Ok(None),
    }
}

fn dependents_view<G: TaskGraph + ?Sized>(graph: &G, batch: &StatusUpdateBatch, path: &str) -> Result<Vec<Task>> {
    Ok(graph
        .dependents(path)?
        .into_iter()
        .map(|t| batch.overlay(t))
        .collect())
}

fn all_completed<G: TaskGraph + ?Sized>(graph: &G, batch: &StatusUpdateBatch, paths: &[String]) -> Result<bool> {
    for path in paths {
        let done = batch
            .view(graph, path)?
            .map(|t| t.status == TaskStatus::Completed)
            .unwrap_or(false);
        if !done {
            return Ok(false);
        }
    }
    Ok(true)
}

fn children_completed<G: TaskGraph + ?Sized>(graph: &G, batch: &StatusUpdateBatch, parent: &str) -> Result<bool> {
    let children = graph.children(parent)?;
    Ok(!children.is_empty()
        && children
            .into_iter()
            .map(|t| batch.overlay(t))
            .all(|t| t.status == TaskStatus::Completed))
}
