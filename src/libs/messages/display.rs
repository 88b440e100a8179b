//! Display implementation for engine log messages.
//!
//! All log text lives here so wording stays consistent between modules and
//! parameters are checked at compile time.

use super::types::Message;
use std::fmt;

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            // === POOL MESSAGES ===
            Message::PoolInitialized { path, max_connections } => {
                format!("Connection pool ready for {} (max {} connections)", path, max_connections)
            }
            Message::PoolClosed(count) => format!("Connection pool closed ({} connections)", count),
            Message::ConnectionCreated { id, pool_size } => {
                format!("Opened connection {} (pool size {})", id, pool_size)
            }
            Message::ConnectionCreateFailed(reason) => format!("Failed to open connection: {}", reason),
            Message::ConnectionRemoved { id, reason } => format!("Closed connection {} ({})", id, reason),
            Message::ConnectionCloseFailed { id, reason } => {
                format!("Failed to close connection {}: {}", id, reason)
            }
            Message::ConnectionTimeout { waited_ms, connections } => format!(
                "Timed out after {}ms waiting for a connection ({} connections busy)",
                waited_ms, connections
            ),
            Message::DanglingTransaction(id) => {
                format!("Connection {} returned with an open transaction; rolling back", id)
            }
            Message::RollbackFailed { id, reason } => {
                format!("Rollback on connection {} failed: {}", id, reason)
            }

            // === CONNECTION STATE MESSAGES ===
            Message::ConnectionRegistered(id) => format!("Tracking connection {}", id),
            Message::ConnectionUnregistered(id) => format!("Stopped tracking connection {}", id),
            Message::UnhealthyConnections(ids) => format!(
                "Unhealthy connections: {}",
                ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ")
            ),

            // === WAL MESSAGES ===
            Message::WalEnabled(path) => format!("WAL journaling enabled for {}", path),
            Message::CheckpointCompleted {
                busy,
                log_frames,
                checkpointed_frames,
            } => format!(
                "WAL checkpoint: {}/{} frames written back{}",
                checkpointed_frames,
                log_frames,
                if *busy { " (busy)" } else { "" }
            ),
            Message::CheckpointFailed(reason) => format!("Periodic WAL checkpoint failed: {}", reason),

            // === TRANSACTION MESSAGES ===
            Message::TransactionStarted { id, connection } => format!("Began {} on {}", id, connection),
            Message::TransactionFinished {
                id,
                committed,
                operations,
                elapsed_ms,
            } => format!(
                "{} {} after {}ms ({} operations)",
                if *committed { "Committed" } else { "Rolled back" },
                id,
                elapsed_ms,
                operations
            ),
            Message::TransactionRollbackFailed { id, reason } => {
                format!("Failed to roll back {}: {}", id, reason)
            }
            Message::TransactionAbandoned(id) => format!("Abandoned {} at shutdown", id),
            Message::TransactionsAbandoned(count) => format!("{} open transactions abandoned at shutdown", count),

            // === RETRY MESSAGES ===
            Message::RetryScheduled {
                context,
                attempt,
                max_attempts,
                delay_ms,
                reason,
            } => format!(
                "{} failed (attempt {}/{}), retrying in {}ms: {}",
                context, attempt, max_attempts, delay_ms, reason
            ),

            // === STORAGE MESSAGES ===
            Message::StorageReady(path) => format!("Task storage ready at {}", path),
            Message::TasksSaved(count) => format!("Saved {} tasks", count),
            Message::TasksCleared(count) => format!("Removed all {} tasks", count),
            Message::RelationshipsRepaired { issues, dry_run } => {
                if *dry_run {
                    format!("Relationship check found {} issues (dry run)", issues)
                } else {
                    format!("Repaired {} relationship issues", issues)
                }
            }

            // === TASK MESSAGES ===
            Message::TaskCreated(path) => format!("Task '{}' created", path),
            Message::TaskUpdated { path, version } => format!("Task '{}' updated to version {}", path, version),
            Message::TaskDeleted { path, removed } => {
                format!("Task '{}' deleted ({} tasks removed)", path, removed)
            }
            Message::StatusPropagated { path, cascaded } => {
                format!("Status change on '{}' cascaded to {} tasks", path, cascaded)
            }

            // === APPLICATION MESSAGES ===
            Message::ContextInitialized(path) => format!("Task engine started on {}", path),
            Message::ContextShutdown => "Task engine shut down".to_string(),
            Message::LoggingInitialized(filter) => format!("Logging initialized with filter '{}'", filter),
        };
        write!(f, "{}", s)
    }
}
