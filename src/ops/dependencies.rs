//! Dependency cycle detection.

use crate::libs::error::Result;
use crate::ops::graph::TaskGraph;
use std::collections::HashSet;

/// Whether adding the edge `source -> target` ("source depends on target")
/// would close a cycle, i.e. whether `source` is already reachable from
/// `target` through dependency edges.
///
/// Depth-first with a visited set, so each task is expanded at most once.
/// Returns as soon as `source` is found. Missing tasks are treated as leaves.
pub fn would_create_cycle<G: TaskGraph + ?Sized>(graph: &G, source: &str, target: &str) -> Result<bool> {
    if source == target {
        return Ok(true);
    }
    let mut visited: HashSet<String> = HashSet::new();
    let mut stack = vec![target.to_string()];
    while let Some(path) = stack.pop() {
        if !visited.insert(path.clone()) {
            continue;
        }
        let Some(task) = graph.task(&path)? else { continue };
        for dep in task.dependencies {
            if dep == source {
                return Ok(true);
            }
            if !visited.contains(&dep) {
                stack.push(dep);
            }
        }
    }
    Ok(false)
}

/// First entry of `dependencies` that would close a cycle for `source`.
pub fn find_cycle<G: TaskGraph + ?Sized>(graph: &G, source: &str, dependencies: &[String]) -> Result<Option<String>> {
    for dep in dependencies {
        if would_create_cycle(graph, source, dep)? {
            return Ok(Some(dep.clone()));
        }
    }
    Ok(None)
}
