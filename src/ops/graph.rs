//! Read/write access to the task graph used by the hierarchy engine.
//!
//! Validation, cycle detection and status propagation are written against
//! these traits rather than against storage directly, so they run unchanged
//! inside a [`StorageTransaction`] or over an in-memory map in unit tests.

use crate::db::storage::StorageTransaction;
use crate::libs::error::{Result, StorageError};
use crate::libs::task::{Task, TaskFilter};

pub trait TaskGraph {
    fn task(&self, path: &str) -> Result<Option<Task>>;

    /// Tasks whose `parent_path` is `path`.
    fn children(&self, path: &str) -> Result<Vec<Task>>;

    /// Tasks that list `path` among their dependencies.
    fn dependents(&self, path: &str) -> Result<Vec<Task>>;

    fn require(&self, path: &str) -> Result<Task> {
        self.task(path)?
            .ok_or_else(|| StorageError::TaskNotFound(path.to_string()))
    }
}

pub trait TaskStore: TaskGraph {
    fn insert(&mut self, task: &Task) -> Result<()>;

    /// Overwrites the row read as `before`. The caller has already bumped
    /// the version of `after`.
    fn write(&mut self, before: &Task, after: &Task) -> Result<()>;

    /// Removes `path` and its descendants; returns what was removed.
    fn remove_subtree(&mut self, path: &str) -> Result<Vec<Task>>;
}

impl TaskGraph for StorageTransaction<'_> {
    fn task(&self, path: &str) -> Result<Option<Task>> {
        self.get_task(path)
    }

    fn children(&self, path: &str) -> Result<Vec<Task>> {
        self.get_subtasks(path)
    }

    fn dependents(&self, path: &str) -> Result<Vec<Task>> {
        self.fetch(&TaskFilter::DependentsOf(path.to_string()))
    }
}

impl TaskStore for StorageTransaction<'_> {
    fn insert(&mut self, task: &Task) -> Result<()> {
        self.insert_task(task)
    }

    fn write(&mut self, before: &Task, after: &Task) -> Result<()> {
        self.replace_task(before, after)
    }

    fn remove_subtree(&mut self, path: &str) -> Result<Vec<Task>> {
        self.delete_task(path)
    }
}
