//! Hierarchy engine: validation, cycle detection and status propagation on
//! top of the storage transaction.

/// Dependency cycle detection.
pub mod dependencies;

/// Graph access traits shared by the engine and its tests.
pub mod graph;

/// Cascading status updates to parents and dependents.
pub mod propagation;

/// Transactional create, update and delete.
pub mod task_operations;

/// Input and status-transition checks.
pub mod validation;
