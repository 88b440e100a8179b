//! Row-level SQL for the `tasks` table.
//!
//! Every function works on a borrowed connection so the same statements serve
//! both single-shot reads and writes inside an open transaction.

use crate::libs::error::Result;
use crate::libs::task::{Task, TaskFilter, TaskMetadata, TaskNotes};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

const INSERT_TASK: &str = "INSERT INTO tasks (path, name, description, type, status, parent_path, notes, reasoning, dependencies, subtasks, metadata, created_at, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)";
const UPSERT_TASK: &str = "INSERT INTO tasks (path, name, description, type, status, parent_path, notes, reasoning, dependencies, subtasks, metadata, created_at, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
    ON CONFLICT(path) DO UPDATE SET
        name = excluded.name,
        description = excluded.description,
        type = excluded.type,
        status = excluded.status,
        parent_path = excluded.parent_path,
        notes = excluded.notes,
        reasoning = excluded.reasoning,
        dependencies = excluded.dependencies,
        subtasks = excluded.subtasks,
        metadata = excluded.metadata,
        created_at = excluded.created_at,
        updated_at = excluded.updated_at";
const UPDATE_TASK: &str = "UPDATE tasks SET name = ?2, description = ?3, type = ?4, status = ?5, parent_path = ?6,
    notes = ?7, reasoning = ?8, dependencies = ?9, subtasks = ?10, metadata = ?11, created_at = ?12, updated_at = ?13
    WHERE path = ?1";
const DELETE_TASK: &str = "DELETE FROM tasks WHERE path = ?";
const DELETE_ALL: &str = "DELETE FROM tasks";
const SELECT_TASKS: &str = "SELECT path, name, description, type, status, parent_path, notes, reasoning, dependencies, subtasks, metadata FROM tasks";
const WHERE_PATH: &str = "WHERE path = ?";
const WHERE_PATHS: &str = "WHERE path IN";
const WHERE_PATTERN: &str = "WHERE path GLOB ?";
const WHERE_STATUS: &str = "WHERE status = ?";
const WHERE_PARENT: &str = "WHERE parent_path = ?";
const WHERE_DEPENDS_ON: &str =
    "WHERE EXISTS (SELECT 1 FROM json_each(tasks.dependencies) WHERE json_each.value = ?)";
const ORDER_BY_PATH: &str = "ORDER BY path";

pub fn insert_task(conn: &Connection, task: &Task) -> Result<()> {
    write_row(conn, INSERT_TASK, task)?;
    Ok(())
}

/// Inserts `task` or replaces every column of the existing row.
pub fn upsert_task(conn: &Connection, task: &Task) -> Result<()> {
    write_row(conn, UPSERT_TASK, task)?;
    Ok(())
}

/// Rewrites the full row. Returns `false` when no row has `task.path`.
pub fn update_task(conn: &Connection, task: &Task) -> Result<bool> {
    Ok(write_row(conn, UPDATE_TASK, task)? > 0)
}

pub fn delete_task(conn: &Connection, path: &str) -> Result<bool> {
    Ok(conn.execute(DELETE_TASK, [path])? > 0)
}

pub fn delete_all(conn: &Connection) -> Result<usize> {
    Ok(conn.execute(DELETE_ALL, [])?)
}

pub fn select_task(conn: &Connection, path: &str) -> Result<Option<Task>> {
    let sql = format!("{} {}", SELECT_TASKS, WHERE_PATH);
    let task = conn.query_row(&sql, [path], read_row).optional()?;
    Ok(task)
}

/// Runs the query matching `filter`; results are ordered by path.
pub fn fetch(conn: &Connection, filter: &TaskFilter) -> Result<Vec<Task>> {
    let (sql, params): (String, Vec<String>) = match filter {
        TaskFilter::All => (format!("{} {}", SELECT_TASKS, ORDER_BY_PATH), vec![]),
        TaskFilter::ByPaths(paths) if paths.is_empty() => return Ok(Vec::new()),
        TaskFilter::ByPaths(paths) => (
            format!("{} {} ({}) {}", SELECT_TASKS, WHERE_PATHS, vec!["?"; paths.len()].join(", "), ORDER_BY_PATH),
            paths.clone(),
        ),
        TaskFilter::ByPattern(pattern) => (
            format!("{} {} {}", SELECT_TASKS, WHERE_PATTERN, ORDER_BY_PATH),
            vec![pattern.clone()],
        ),
        TaskFilter::ByStatus(status) => (
            format!("{} {} {}", SELECT_TASKS, WHERE_STATUS, ORDER_BY_PATH),
            vec![status.as_str().to_string()],
        ),
        TaskFilter::ByParent(parent) => (
            format!("{} {} {}", SELECT_TASKS, WHERE_PARENT, ORDER_BY_PATH),
            vec![parent.clone()],
        ),
        TaskFilter::DependentsOf(path) => (
            format!("{} {} {}", SELECT_TASKS, WHERE_DEPENDS_ON, ORDER_BY_PATH),
            vec![path.clone()],
        ),
    };

    let mut stmt = conn.prepare(&sql)?;
    let task_iter = stmt.query_map(params_from_iter(params.iter()), read_row)?;
    let mut tasks = Vec::new();
    for task_result in task_iter {
        tasks.push(task_result?);
    }

    Ok(tasks)
}

fn write_row(conn: &Connection, sql: &str, task: &Task) -> Result<usize> {
    let changed = conn.execute(
        sql,
        params![
            task.path,
            task.name,
            task.description,
            task.task_type,
            task.status,
            task.parent_path,
            serde_json::to_string(&task.notes)?,
            task.reasoning,
            serde_json::to_string(&task.dependencies)?,
            serde_json::to_string(&task.subtasks)?,
            serde_json::to_string(&task.metadata)?,
            task.metadata.created,
            task.metadata.updated,
        ],
    )?;
    Ok(changed)
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        path: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        task_type: row.get(3)?,
        status: row.get(4)?,
        parent_path: row.get(5)?,
        notes: json_column::<TaskNotes>(row, 6)?,
        reasoning: row.get(7)?,
        dependencies: json_column(row, 8)?,
        subtasks: json_column(row, 9)?,
        metadata: json_column::<TaskMetadata>(row, 10)?,
    })
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}
