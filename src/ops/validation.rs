//! Input and state-machine checks run before any write.
//!
//! Every rejection is a typed error; validation failures carry a hint telling
//! the caller how to recover.

use crate::libs::error::{Result, StorageError};
use crate::libs::task::{CreateTaskInput, Task, TaskStatus, TaskType, TaskUpdate, PATH_SEPARATOR};
use crate::ops::dependencies::find_cycle;
use crate::ops::graph::TaskGraph;

/// Maximum number of `/`-separated segments in a task path.
pub const MAX_PATH_DEPTH: usize = 8;

pub fn validate_path(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(StorageError::validation(
            "task path must not be empty",
            "use a path such as 'project/feature/task'",
        ));
    }
    let segments: Vec<&str> = path.split(PATH_SEPARATOR).collect();
    if segments.iter().any(|s| s.trim().is_empty()) {
        return Err(StorageError::validation(
            format!("task path '{path}' has an empty segment"),
            "remove leading, trailing or doubled '/' characters",
        ));
    }
    if segments.len() > MAX_PATH_DEPTH {
        return Err(StorageError::validation(
            format!("task path '{path}' is {} levels deep", segments.len()),
            format!("nest tasks at most {MAX_PATH_DEPTH} levels deep"),
        ));
    }
    Ok(())
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(StorageError::validation("task name must not be empty", "provide a short task name"));
    }
    Ok(())
}

/// The parent must exist and be able to hold subtasks.
pub fn validate_parent<G: TaskGraph + ?Sized>(graph: &G, parent_path: &str) -> Result<Task> {
    let Some(parent) = graph.task(parent_path)? else {
        return Err(StorageError::validation(
            format!("parent task '{parent_path}' does not exist"),
            "create the parent task first",
        ));
    };
    if !parent.task_type.can_hold_subtasks() {
        return Err(StorageError::validation(
            format!("parent '{parent_path}' is a {} and cannot hold subtasks", parent.task_type),
            "use a GROUP or MILESTONE as the parent",
        ));
    }
    Ok(parent)
}

/// Each dependency must exist, differ from `path` and not close a cycle.
pub fn validate_dependencies<G: TaskGraph + ?Sized>(graph: &G, path: &str, dependencies: &[String]) -> Result<()> {
    for dep in dependencies {
        if dep == path {
            return Err(StorageError::validation(
                format!("task '{path}' cannot depend on itself"),
                "remove the task's own path from its dependencies",
            ));
        }
        if graph.task(dep)?.is_none() {
            return Err(StorageError::validation(
                format!("dependency '{dep}' does not exist"),
                "create the dependency first or remove it from the list",
            ));
        }
    }
    if let Some(dependency) = find_cycle(graph, path, dependencies)? {
        return Err(StorageError::CircularDependency {
            path: path.to_string(),
            dependency,
        });
    }
    Ok(())
}

pub fn validate_transition(path: &str, from: TaskStatus, to: TaskStatus) -> Result<()> {
    if !from.can_transition_to(to) {
        return Err(StorageError::InvalidStatusTransition {
            path: path.to_string(),
            from,
            to,
        });
    }
    Ok(())
}

pub fn validate_create<G: TaskGraph + ?Sized>(graph: &G, input: &CreateTaskInput) -> Result<()> {
    validate_path(&input.path)?;
    validate_name(&input.name)?;
    if graph.task(&input.path)?.is_some() {
        return Err(StorageError::validation(
            format!("task '{}' already exists", input.path),
            "choose another path or update the existing task",
        ));
    }
    if let Some(parent) = &input.parent_path {
        validate_parent(graph, parent)?;
    }
    validate_dependencies(graph, &input.path, &input.dependencies)
}

/// Checks `update` against the stored `current` task.
pub fn validate_update<G: TaskGraph + ?Sized>(graph: &G, current: &Task, update: &TaskUpdate) -> Result<()> {
    if let Some(name) = &update.name {
        validate_name(name)?;
    }
    if update.task_type == Some(TaskType::Task) && current.task_type != TaskType::Task {
        let has_children = !current.subtasks.is_empty() || !graph.children(&current.path)?.is_empty();
        if has_children {
            return Err(StorageError::validation(
                format!("task '{}' has subtasks and cannot become a TASK", current.path),
                "move or delete the subtasks first",
            ));
        }
    }
    if let Some(dependencies) = &update.dependencies {
        validate_dependencies(graph, &current.path, dependencies)?;
    }

    let Some(next) = update.status else { return Ok(()) };
    if next == current.status {
        return Ok(());
    }
    validate_transition(&current.path, current.status, next)?;

    if next == TaskStatus::Completed {
        let dependencies = update.dependencies.as_ref().unwrap_or(&current.dependencies);
        for dep in dependencies {
            let done = graph.task(dep)?.map(|t| t.status == TaskStatus::Completed).unwrap_or(false);
            if !done {
                return Err(StorageError::validation(
                    format!("task '{}' depends on unfinished '{dep}'", current.path),
                    "complete every dependency first",
                ));
            }
        }
        if let Some(open) = graph
            .children(&current.path)?
            .into_iter()
            .find(|child| child.status != TaskStatus::Completed)
        {
            return Err(StorageError::validation(
                format!("task '{}' has unfinished subtask '{}'", current.path, open.path),
                "complete every subtask first",
            ));
        }
    }

    if current.status == TaskStatus::Completed && next == TaskStatus::InProgress {
        validate_reopen(graph, current)?;
    }
    Ok(())
}

/// A completed task may be reopened unless it has siblings and every one of
/// them is still completed.
fn validate_reopen<G: TaskGraph + ?Sized>(graph: &G, current: &Task) -> Result<()> {
    let Some(parent) = &current.parent_path else { return Ok(()) };
    let siblings: Vec<Task> = graph
        .children(parent)?
        .into_iter()
        .filter(|t| t.path != current.path)
        .collect();
    if !siblings.is_empty() && siblings.iter().all(|t| t.status == TaskStatus::Completed) {
        return Err(StorageError::validation(
            format!("cannot reopen '{}': every sibling under '{parent}' is completed", current.path),
            "reopen the parent or create a follow-up task instead",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::graph::memory::MemoryGraph;

    fn task(path: &str, task_type: TaskType, status: TaskStatus) -> Task {
        let mut task = Task::new(path, path, task_type);
        task.status = status;
        task.parent_path = crate::libs::task::parent_of(path);
        task
    }

    #[test]
    fn path_rules() {
        assert!(validate_path("a/b/c").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("a//b").is_err());
        assert!(validate_path("/a").is_err());
        assert!(validate_path("a/ /b").is_err());
        assert!(validate_path(&vec!["x"; MAX_PATH_DEPTH + 1].join("/")).is_err());
    }

    #[test]
    fn pending_cannot_jump_to_completed() {
        let graph = MemoryGraph::with([task("a", TaskType::Task, TaskStatus::Pending)]);
        let err = validate_update(&graph, graph.get("a"), &TaskUpdate::status(TaskStatus::Completed)).unwrap_err();
        assert!(matches!(err, StorageError::InvalidStatusTransition { .. }));
        assert!(err.hint().unwrap().contains("IN_PROGRESS"));
    }

    #[test]
    fn completion_requires_finished_dependencies() {
        let mut a = task("a", TaskType::Task, TaskStatus::InProgress);
        a.dependencies = vec!["b".into()];
        let graph = MemoryGraph::with([a, task("b", TaskType::Task, TaskStatus::InProgress)]);
        let err = validate_update(&graph, graph.get("a"), &TaskUpdate::status(TaskStatus::Completed)).unwrap_err();
        assert!(matches!(err, StorageError::Validation { .. }));
    }

    #[test]
    fn parent_must_hold_subtasks() {
        let graph = MemoryGraph::with([
            task("leaf", TaskType::Task, TaskStatus::Pending),
            task("group", TaskType::Group, TaskStatus::Pending),
        ]);
        let bad = CreateTaskInput::new("leaf/x", "x").with_parent("leaf");
        assert!(validate_create(&graph, &bad).is_err());
        let good = CreateTaskInput::new("group/x", "x").with_parent("group");
        assert!(validate_create(&graph, &good).is_ok());
        let missing = CreateTaskInput::new("nope/x", "x").with_parent("nope");
        assert!(validate_create(&graph, &missing).is_err());
    }

    #[test]
    fn reverse_dependency_is_circular() {
        let mut a = task("a", TaskType::Task, TaskStatus::Pending);
        a.dependencies = vec!["b".into()];
        let graph = MemoryGraph::with([a, task("b", TaskType::Task, TaskStatus::Pending)]);
        let err = validate_update(&graph, graph.get("b"), &TaskUpdate::dependencies(&["a"])).unwrap_err();
        assert!(matches!(err, StorageError::CircularDependency { ref path, ref dependency } if path == "b" && dependency == "a"));
        assert!(validate_update(&graph, graph.get("b"), &TaskUpdate::dependencies(&["b"])).is_err());
    }

    #[test]
    fn group_with_children_cannot_become_task() {
        let graph = MemoryGraph::with([
            task("g", TaskType::Group, TaskStatus::Pending),
            task("g/c", TaskType::Task, TaskStatus::Pending),
        ]);
        let update = TaskUpdate {
            task_type: Some(TaskType::Task),
            ..Default::default()
        };
        assert!(validate_update(&graph, graph.get("g"), &update).is_err());
    }

    #[test]
    fn reopen_blocked_when_all_siblings_completed() {
        let graph = MemoryGraph::with([
            task("p", TaskType::Group, TaskStatus::Completed),
            task("p/a", TaskType::Task, TaskStatus::Completed),
            task("p/b", TaskType::Task, TaskStatus::Completed),
            task("q", TaskType::Group, TaskStatus::InProgress),
            task("q/a", TaskType::Task, TaskStatus::Completed),
            task("q/b", TaskType::Task, TaskStatus::InProgress),
        ]);
        let reopen = TaskUpdate::status(TaskStatus::InProgress);
        assert!(validate_update(&graph, graph.get("p/a"), &reopen).is_err());
        assert!(validate_update(&graph, graph.get("q/a"), &reopen).is_ok());
    }
}
