//! Task create/update/delete with hierarchy bookkeeping.
//!
//! The `*_in` functions hold the logic and run against any [`TaskStore`];
//! [`TaskOperations`] wraps each of them in one storage transaction so the
//! write, its parent bookkeeping and the whole status cascade commit or roll
//! back together.

use crate::db::storage::Storage;
use crate::libs::error::Result;
use crate::libs::messages::Message;
use crate::libs::task::{now_millis, parent_of, CreateTaskInput, Task, TaskStatus, TaskType, TaskUpdate};
use crate::ops::graph::{TaskGraph, TaskStore};
use crate::ops::propagation::propagate;
use crate::ops::validation::{validate_create, validate_parent, validate_update};
use crate::{msg_debug, msg_info};
use std::sync::Arc;

/// Result of an update: the task as written plus every task the status
/// cascade changed.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub task: Task,
    pub cascaded: Vec<Task>,
}

/// Validates and inserts a new task, registering it with its parent.
///
/// Without an explicit `parent_path` the path prefix becomes the parent,
/// but only when a task with that path exists.
pub fn create_in<S: TaskStore + ?Sized>(store: &mut S, input: &CreateTaskInput) -> Result<Task> {
    validate_create(&*store, input)?;

    let parent_path = match &input.parent_path {
        Some(parent) => Some(parent.clone()),
        None => match parent_of(&input.path) {
            Some(implied) if store.task(&implied)?.is_some() => Some(implied),
            _ => None,
        },
    };
    let parent = match &parent_path {
        Some(path) => Some(validate_parent(&*store, path)?),
        None => None,
    };

    let mut task = Task::new(&input.path, &input.name, input.task_type.unwrap_or(TaskType::Task));
    task.description = input.description.clone();
    task.parent_path = parent_path;
    task.notes = input.notes.clone();
    task.reasoning = input.reasoning.clone();
    task.dependencies = input.dependencies.clone();
    task.metadata.extra = input.metadata.clone();

    for dep in &input.dependencies {
        let Some(dependency) = store.task(dep)? else { continue };
        if matches!(dependency.status, TaskStatus::Failed | TaskStatus::Blocked) {
            task.status = TaskStatus::Blocked;
            task.metadata.blocked_by = Some(dependency.path.clone());
            task.metadata.blocked_at = Some(now_millis());
            task.metadata.block_reason =
                Some(format!("dependency '{}' is {}", dependency.path, dependency.status));
            break;
        }
    }

    store.insert(&task)?;

    if let Some(before) = parent {
        if !before.subtasks.contains(&task.path) {
            let mut after = before.clone();
            after.subtasks.push(task.path.clone());
            after.touch();
            store.write(&before, &after)?;
        }
    }
    Ok(task)
}

/// Validates and applies `update`, then cascades a status change.
pub fn update_in<S: TaskStore + ?Sized>(store: &mut S, path: &str, update: &TaskUpdate) -> Result<UpdateOutcome> {
    let before = store.require(path)?;
    validate_update(&*store, &before, update)?;

    let mut after = before.clone();
    update.apply_to(&mut after);
    let status_changed = after.status != before.status;
    if status_changed
        && after.status == TaskStatus::Pending
        && matches!(before.status, TaskStatus::Blocked | TaskStatus::Failed)
    {
        after.metadata.clear_block();
        after.metadata.unblocked_at = Some(now_millis());
    }
    after.touch();
    store.write(&before, &after)?;

    let cascaded = if status_changed { propagate(store, &after)? } else { Vec::new() };
    Ok(UpdateOutcome { task: after, cascaded })
}

/// Deletes `path` and its subtree. Returns every removed task.
pub fn delete_in<S: TaskStore + ?Sized>(store: &mut S, path: &str) -> Result<Vec<Task>> {
    store.require(path)?;
    store.remove_subtree(path)
}

/// Transactional entry point for hierarchy-aware writes.
#[derive(Clone)]
pub struct TaskOperations {
    storage: Arc<Storage>,
}

impl TaskOperations {
    pub fn new(storage: Arc<Storage>) -> Self {
        TaskOperations { storage }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub async fn create_task(&self, input: &CreateTaskInput) -> Result<Task> {
        let task = self
            .storage
            .in_transaction("create task", |tx| create_in(tx, input))
            .await?;
        msg_info!(Message::TaskCreated(task.path.clone()), path = %task.path);
        Ok(task)
    }

    pub async fn update_task(&self, path: &str, update: &TaskUpdate) -> Result<UpdateOutcome> {
        let outcome = self
            .storage
            .in_transaction("update task", |tx| update_in(tx, path, update))
            .await?;
        msg_debug!(Message::TaskUpdated {
            path: path.to_string(),
            version: outcome.task.metadata.version,
        });
        if !outcome.cascaded.is_empty() {
            msg_info!(Message::StatusPropagated {
                path: path.to_string(),
                cascaded: outcome.cascaded.len(),
            });
        }
        Ok(outcome)
    }

    pub async fn delete_task(&self, path: &str) -> Result<Vec<Task>> {
        let removed = self
            .storage
            .in_transaction("delete task", |tx| delete_in(tx, path))
            .await?;
        msg_info!(Message::TaskDeleted {
            path: path.to_string(),
            removed: removed.len(),
        });
        Ok(removed)
    }

    pub async fn get_task(&self, path: &str) -> Result<Option<Task>> {
        self.storage.get_task(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::error::StorageError;
    use crate::ops::graph::memory::MemoryGraph;

    fn create(graph: &mut MemoryGraph, input: CreateTaskInput) -> Task {
        create_in(graph, &input).unwrap()
    }

    fn set(graph: &mut MemoryGraph, path: &str, status: TaskStatus) -> UpdateOutcome {
        update_in(graph, path, &TaskUpdate::status(status)).unwrap()
    }

    #[test]
    fn create_registers_with_implied_parent() {
        let mut graph = MemoryGraph::default();
        create(&mut graph, CreateTaskInput::new("p", "P").with_type(TaskType::Group));
        let child = create(&mut graph, CreateTaskInput::new("p/a", "A"));

        assert_eq!(child.parent_path.as_deref(), Some("p"));
        let parent = graph.get("p");
        assert_eq!(parent.subtasks, vec!["p/a".to_string()]);
        assert_eq!(parent.metadata.version, 2);

        let orphan = create(&mut graph, CreateTaskInput::new("q/a", "A"));
        assert!(orphan.parent_path.is_none());
    }

    #[test]
    fn create_under_failed_dependency_starts_blocked() {
        let mut graph = MemoryGraph::default();
        create(&mut graph, CreateTaskInput::new("x", "X"));
        set(&mut graph, "x", TaskStatus::InProgress);
        set(&mut graph, "x", TaskStatus::Failed);

        let task = create(&mut graph, CreateTaskInput::new("y", "Y").with_dependencies(&["x"]));
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.metadata.blocked_by.as_deref(), Some("x"));
    }

    #[test]
    fn update_bumps_version_once() {
        let mut graph = MemoryGraph::default();
        create(&mut graph, CreateTaskInput::new("a", "A"));
        let update = TaskUpdate {
            name: Some("renamed".into()),
            ..Default::default()
        };
        let outcome = update_in(&mut graph, "a", &update).unwrap();
        assert_eq!(outcome.task.metadata.version, 2);
        assert!(outcome.cascaded.is_empty());
        assert_eq!(graph.get("a").name, "renamed");
    }

    #[test]
    fn rejected_update_writes_nothing() {
        let mut graph = MemoryGraph::default();
        create(&mut graph, CreateTaskInput::new("a", "A"));
        let writes = graph.writes;
        let err = update_in(&mut graph, "a", &TaskUpdate::status(TaskStatus::Completed)).unwrap_err();
        assert!(matches!(err, StorageError::InvalidStatusTransition { .. }));
        assert_eq!(graph.writes, writes);
        assert!(matches!(
            update_in(&mut graph, "missing", &TaskUpdate::default()),
            Err(StorageError::TaskNotFound(_))
        ));
    }

    #[test]
    fn completing_children_completes_parent_and_unblocks() {
        let mut graph = MemoryGraph::default();
        create(&mut graph, CreateTaskInput::new("p", "P").with_type(TaskType::Group));
        create(&mut graph, CreateTaskInput::new("p/a", "A"));
        create(&mut graph, CreateTaskInput::new("p/b", "B"));
        create(&mut graph, CreateTaskInput::new("next", "Next").with_dependencies(&["p/b"]));

        let started = set(&mut graph, "p/a", TaskStatus::InProgress);
        assert_eq!(started.cascaded.len(), 1);
        assert_eq!(graph.get("p").status, TaskStatus::InProgress);

        set(&mut graph, "p/b", TaskStatus::InProgress);
        set(&mut graph, "p/b", TaskStatus::Blocked);
        assert_eq!(graph.get("next").status, TaskStatus::Blocked);

        set(&mut graph, "p/b", TaskStatus::Pending);
        assert!(graph.get("p/b").metadata.unblocked_at.is_some());
        set(&mut graph, "p/b", TaskStatus::InProgress);
        set(&mut graph, "p/a", TaskStatus::Completed);
        assert_eq!(graph.get("p").status, TaskStatus::InProgress);

        set(&mut graph, "p/b", TaskStatus::Completed);
        assert_eq!(graph.get("p").status, TaskStatus::Completed);
        assert_eq!(graph.get("next").status, TaskStatus::Pending);
    }

    #[test]
    fn delete_removes_subtree() {
        let mut graph = MemoryGraph::default();
        create(&mut graph, CreateTaskInput::new("p", "P").with_type(TaskType::Group));
        create(&mut graph, CreateTaskInput::new("p/a", "A"));
        let removed = delete_in(&mut graph, "p").unwrap();
        assert_eq!(removed.len(), 2);
        assert!(graph.tasks.is_empty());
        assert!(matches!(delete_in(&mut graph, "p"), Err(StorageError::TaskNotFound(_))));
    }
}
