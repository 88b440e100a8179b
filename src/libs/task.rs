//! Task model shared by the storage engine and the hierarchy engine.
//!
//! A [`Task`] is identified by a path-like string whose segments are separated
//! by `/`. The parent of `project/backend/api` is `project/backend` unless the
//! task was created with an explicit parent.
//!
//! ## Persistence
//!
//! Every field maps onto one column of the `tasks` table. The list-valued and
//! record-valued fields (`notes`, `dependencies`, `subtasks`, `metadata`) are
//! stored as JSON text, while `version` and the timestamps live inside
//! `metadata` and are mirrored into the `created_at`/`updated_at` columns.
//!
//! ## Usage
//!
//! ```rust
//! use taskvault::libs::task::{Task, TaskStatus, TaskType};
//!
//! let task = Task::new("project/api", "API layer", TaskType::Task);
//! assert_eq!(task.status, TaskStatus::Pending);
//! assert_eq!(task.parent_from_path().as_deref(), Some("project"));
//! ```

use chrono::Utc;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between path segments.
pub const PATH_SEPARATOR: char = '/';

/// Kind of work item. Only [`TaskType::Group`] and [`TaskType::Milestone`]
/// may hold subtasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Task,
    Milestone,
    Group,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Task => "TASK",
            TaskType::Milestone => "MILESTONE",
            TaskType::Group => "GROUP",
        }
    }

    /// Whether tasks of this type may have children.
    pub fn can_hold_subtasks(&self) -> bool {
        matches!(self, TaskType::Group | TaskType::Milestone)
    }
}

/// Lifecycle status of a task.
///
/// The allowed user-initiated transitions are:
///
/// ```text
/// PENDING ──▶ IN_PROGRESS ──▶ COMPLETED
///    ▲             │   ▲          │
///    │             │   └──────────┘ (reopen)
///    │             ├──▶ FAILED ───┐
///    │             └──▶ BLOCKED ──┤
///    └────────────────────────────┘ (unblock)
/// ```
///
/// Cascading updates performed by the hierarchy engine are system transitions
/// and are not restricted by this table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Blocked => "BLOCKED",
        }
    }

    /// Returns `true` when `next` is reachable from `self` by a user update.
    /// Staying in the same status is always allowed.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Blocked)
                | (Blocked, Pending)
                | (Failed, Pending)
                | (Completed, InProgress)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status '{s}'"))
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TASK" => Ok(TaskType::Task),
            "MILESTONE" => Ok(TaskType::Milestone),
            "GROUP" => Ok(TaskType::Group),
            other => Err(format!("unknown task type '{other}'")),
        }
    }
}

impl ToSql for TaskStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TaskStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

impl ToSql for TaskType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TaskType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Categorized free-form notes attached to a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaskNotes {
    pub planning: Vec<String>,
    pub progress: Vec<String>,
    pub completion: Vec<String>,
    pub troubleshooting: Vec<String>,
}

impl TaskNotes {
    pub fn len(&self) -> usize {
        self.planning.len() + self.progress.len() + self.completion.len() + self.troubleshooting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bookkeeping stored in the `metadata` JSON column.
///
/// Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    pub version: u64,
    pub created: i64,
    pub updated: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unblocked_at: Option<i64>,
    /// Caller-defined keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskMetadata {
    pub fn new(now: i64) -> Self {
        TaskMetadata {
            version: 1,
            created: now,
            updated: now,
            blocked_by: None,
            blocked_at: None,
            block_reason: None,
            unblocked_at: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn clear_block(&mut self) {
        self.blocked_by = None;
        self.blocked_at = None;
        self.block_reason = None;
    }
}

/// The persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub path: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub parent_path: Option<String>,
    pub notes: TaskNotes,
    pub reasoning: Option<String>,
    pub dependencies: Vec<String>,
    pub subtasks: Vec<String>,
    pub metadata: TaskMetadata,
}

impl Task {
    /// Builds a fresh `PENDING` task at version 1 with no relationships.
    pub fn new(path: &str, name: &str, task_type: TaskType) -> Self {
        Task {
            path: path.to_string(),
            name: name.to_string(),
            description: None,
            task_type,
            status: TaskStatus::Pending,
            parent_path: None,
            notes: TaskNotes::default(),
            reasoning: None,
            dependencies: Vec::new(),
            subtasks: Vec::new(),
            metadata: TaskMetadata::new(now_millis()),
        }
    }

    /// Parent implied by the path itself, e.g. `a/b` for `a/b/c`.
    pub fn parent_from_path(&self) -> Option<String> {
        parent_of(&self.path)
    }

    /// Bumps the version and refreshes the `updated` timestamp.
    pub fn touch(&mut self) {
        self.metadata.version += 1;
        self.metadata.updated = now_millis().max(self.metadata.updated);
    }
}

/// Input accepted by task creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateTaskInput {
    pub path: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub task_type: Option<TaskType>,
    pub parent_path: Option<String>,
    pub dependencies: Vec<String>,
    pub notes: TaskNotes,
    pub reasoning: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl CreateTaskInput {
    pub fn new(path: &str, name: &str) -> Self {
        CreateTaskInput {
            path: path.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn with_parent(mut self, parent_path: &str) -> Self {
        self.parent_path = Some(parent_path.to_string());
        self
    }

    pub fn with_dependencies(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }
}

/// Every updatable field of a task. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub task_type: Option<TaskType>,
    pub status: Option<TaskStatus>,
    pub dependencies: Option<Vec<String>>,
    pub notes: Option<TaskNotes>,
    pub reasoning: Option<String>,
    /// Merged into `metadata.extra`; existing keys are overwritten.
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        TaskUpdate {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn dependencies(dependencies: &[&str]) -> Self {
        TaskUpdate {
            dependencies: Some(dependencies.iter().map(|d| d.to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == TaskUpdate::default()
    }

    /// Applies the update to `task` without touching version or timestamps.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(name) = &self.name {
            task.name = name.clone();
        }
        if let Some(description) = &self.description {
            task.description = Some(description.clone());
        }
        if let Some(task_type) = self.task_type {
            task.task_type = task_type;
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(dependencies) = &self.dependencies {
            task.dependencies = dependencies.clone();
        }
        if let Some(notes) = &self.notes {
            task.notes = notes.clone();
        }
        if let Some(reasoning) = &self.reasoning {
            task.reasoning = Some(reasoning.clone());
        }
        if let Some(extra) = &self.metadata {
            for (key, value) in extra {
                task.metadata.extra.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Selection used by the façade's bulk readers.
#[derive(Debug, Clone)]
pub enum TaskFilter {
    All,
    ByPaths(Vec<String>),
    ByPattern(String),
    ByStatus(TaskStatus),
    ByParent(String),
    /// Tasks whose dependency list contains the path.
    DependentsOf(String),
}

/// Returns the parent segment path of `path`, if any.
pub fn parent_of(path: &str) -> Option<String> {
    path.rfind(PATH_SEPARATOR).map(|idx| path[..idx].to_string()).filter(|p| !p.is_empty())
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_state_machine() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(!Pending.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Blocked));
        assert!(Blocked.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Pending));
        assert!(Completed.can_transition_to(InProgress));
        assert!(!Blocked.can_transition_to(InProgress));
        assert!(Completed.can_transition_to(Completed));
    }

    #[test]
    fn parent_is_derived_from_path() {
        assert_eq!(parent_of("a/b/c").as_deref(), Some("a/b"));
        assert_eq!(parent_of("a"), None);
        assert_eq!(parent_of("/a"), None);
    }

    #[test]
    fn metadata_keeps_extra_keys() {
        let mut task = Task::new("p", "P", TaskType::Group);
        task.metadata.extra.insert("owner".into(), serde_json::json!("ops"));
        let json = serde_json::to_string(&task.metadata).unwrap();
        let back: TaskMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.extra.get("owner"), Some(&serde_json::json!("ops")));
        assert_eq!(back.version, 1);
    }

    #[test]
    fn touch_increments_version() {
        let mut task = Task::new("p", "P", TaskType::Task);
        let before = task.metadata.updated;
        task.touch();
        assert_eq!(task.metadata.version, 2);
        assert!(task.metadata.updated >= before);
    }
}
