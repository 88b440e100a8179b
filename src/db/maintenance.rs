//! Maintenance routines: compaction, statistics, integrity and relationship
//! repair.
//!
//! ## Relationship repair
//!
//! [`plan_repairs`] inspects a full snapshot of the table and reports, in path
//! order:
//!
//! - **Orphaned parents**: `parent_path` naming a task that does not exist
//! - **Dangling dependencies**: dependency entries naming missing tasks (or
//!   the task itself)
//! - **Dangling subtasks**: subtask entries naming missing tasks
//! - **Cycles**: for every dependency cycle, the edge that closes it
//!
//! The plan is deterministic: tasks are visited in path order and the
//! dependency lists in their stored order, so the same table always yields
//! the same report and the same edges removed.

use crate::db::schema::{self, PragmaValues};
use crate::libs::error::Result;
use crate::libs::task::Task;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Totals computed in one pass over the table.
const COUNT_RELATIONS: &str = "SELECT
    COUNT(*),
    COALESCE(SUM(json_array_length(dependencies)), 0),
    COALESCE(SUM(json_array_length(subtasks)), 0),
    COALESCE(SUM(
        COALESCE(json_array_length(notes, '$.planning'), 0) +
        COALESCE(json_array_length(notes, '$.progress'), 0) +
        COALESCE(json_array_length(notes, '$.completion'), 0) +
        COALESCE(json_array_length(notes, '$.troubleshooting'), 0)
    ), 0)
    FROM tasks";
const COUNT_BY_STATUS: &str = "SELECT status, COUNT(*) FROM tasks GROUP BY status ORDER BY status";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub ok: bool,
    /// Lines reported by `PRAGMA integrity_check` other than `ok`.
    pub problems: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub dry_run: bool,
    /// `(task, missing parent)`
    pub orphaned_parents: Vec<(String, String)>,
    /// `(task, missing dependency)`
    pub dangling_dependencies: Vec<(String, String)>,
    /// `(task, missing subtask)`
    pub dangling_subtasks: Vec<(String, String)>,
    /// `(task, dependency)` edges removed to break cycles.
    pub broken_cycles: Vec<(String, String)>,
    /// Tasks rewritten; always zero on a dry run.
    pub repaired: usize,
}

impl RepairReport {
    pub fn issue_count(&self) -> usize {
        self.orphaned_parents.len()
            + self.dangling_dependencies.len()
            + self.dangling_subtasks.len()
            + self.broken_cycles.len()
    }

    pub fn is_clean(&self) -> bool {
        self.issue_count() == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_tasks: u64,
    pub by_status: BTreeMap<String, u64>,
    pub dependency_count: u64,
    pub subtask_count: u64,
    pub note_count: u64,
    pub pragmas: PragmaValues,
    pub integrity: IntegrityReport,
}

pub fn vacuum(conn: &Connection) -> Result<()> {
    conn.execute_batch("VACUUM")?;
    Ok(())
}

pub fn analyze(conn: &Connection) -> Result<()> {
    conn.execute_batch("ANALYZE")?;
    Ok(())
}

pub fn integrity_check(conn: &Connection) -> Result<IntegrityReport> {
    let mut stmt = conn.prepare("PRAGMA integrity_check")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut problems = Vec::new();
    for row in rows {
        let line = row?;
        if line != "ok" {
            problems.push(line);
        }
    }
    Ok(IntegrityReport {
        ok: problems.is_empty(),
        problems,
    })
}

pub fn collect_stats(conn: &Connection) -> Result<DatabaseStats> {
    let (total_tasks, dependency_count, subtask_count, note_count) = conn.query_row(COUNT_RELATIONS, [], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?, row.get::<_, i64>(3)?))
    })?;

    let mut stmt = conn.prepare(COUNT_BY_STATUS)?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    let mut by_status = BTreeMap::new();
    for row in rows {
        let (status, count) = row?;
        by_status.insert(status, count as u64);
    }

    Ok(DatabaseStats {
        total_tasks: total_tasks as u64,
        by_status,
        dependency_count: dependency_count as u64,
        subtask_count: subtask_count as u64,
        note_count: note_count as u64,
        pragmas: schema::read_pragmas(conn)?,
        integrity: integrity_check(conn)?,
    })
}

/// Builds the repair report for `tasks` and the `(before, after)` pairs that
/// would fix it. Versions are not bumped here.
pub fn plan_repairs(tasks: Vec<Task>) -> (RepairReport, Vec<(Task, Task)>) {
    let originals: BTreeMap<String, Task> = tasks.into_iter().map(|t| (t.path.clone(), t)).collect();
    let mut working = originals.clone();
    let mut report = RepairReport::default();

    for (path, task) in working.iter_mut() {
        if let Some(parent) = task.parent_path.clone() {
            if !originals.contains_key(&parent) {
                report.orphaned_parents.push((path.clone(), parent));
                task.parent_path = None;
            }
        }
        task.dependencies.retain(|dep| {
            let keep = dep != path && originals.contains_key(dep);
            if !keep {
                report.dangling_dependencies.push((path.clone(), dep.clone()));
            }
            keep
        });
        task.subtasks.retain(|sub| {
            let keep = originals.contains_key(sub);
            if !keep {
                report.dangling_subtasks.push((path.clone(), sub.clone()));
            }
            keep
        });
    }

    while let Some((from, to)) = find_closing_edge(&working) {
        if let Some(task) = working.get_mut(&from) {
            task.dependencies.retain(|dep| dep != &to);
        }
        report.broken_cycles.push((from, to));
    }

    let repairs = working
        .into_iter()
        .filter_map(|(path, after)| {
            let before = originals.get(&path)?;
            (before != &after).then(|| (before.clone(), after))
        })
        .collect();
    (report, repairs)
}

/// First dependency edge `(task, dependency)` that points back onto the
/// current DFS stack, i.e. closes a cycle.
fn find_closing_edge(graph: &BTreeMap<String, Task>) -> Option<(String, String)> {
    let mut done: BTreeSet<&str> = BTreeSet::new();
    for root in graph.keys() {
        if done.contains(root.as_str()) {
            continue;
        }
        let mut on_stack: BTreeSet<&str> = BTreeSet::new();
        // (node, index of the next dependency to visit)
        let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
        on_stack.insert(root.as_str());

        while let Some((node, next)) = stack.last_mut() {
            let deps = graph.get(*node).map(|t| t.dependencies.as_slice()).unwrap_or(&[]);
            if let Some(dep) = deps.get(*next) {
                *next += 1;
                let from = *node;
                let dep = dep.as_str();
                if on_stack.contains(dep) {
                    return Some((from.to_string(), dep.to_string()));
                }
                if !done.contains(dep) && graph.contains_key(dep) {
                    on_stack.insert(dep);
                    stack.push((dep, 0));
                }
            } else {
                on_stack.remove(*node);
                done.insert(*node);
                stack.pop();
            }
        }
    }
    None
}
