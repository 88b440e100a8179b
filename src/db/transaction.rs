//! Native transaction boundaries and per-transaction operation journals.
//!
//! The manager issues raw `BEGIN IMMEDIATE` / `COMMIT` / `ROLLBACK` statements
//! so it stays the only authority on transaction boundaries. It never touches
//! the pool: the caller owns the connection for the whole transaction and
//! returns it afterwards.
//!
//! Every transaction carries an ordered journal of the task writes made inside
//! it, with before/after snapshots, for diagnostics and compensation.

use crate::db::connection_state::{ConnectionId, ConnectionStateManager};
use crate::libs::error::{Result, StorageError};
use crate::libs::messages::Message;
use crate::libs::task::{now_millis, Task};
use crate::{msg_debug, msg_error};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    fn generate() -> Self {
        TransactionId(Uuid::new_v4())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationLogEntry {
    pub id: u64,
    pub kind: OperationKind,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub path: String,
    pub before: Option<Task>,
    pub after: Option<Task>,
}

#[derive(Debug)]
struct TransactionRecord {
    connection: ConnectionId,
    started_at: Instant,
    operations: Vec<OperationLogEntry>,
}

pub struct TransactionManager {
    states: Arc<ConnectionStateManager>,
    active: Mutex<HashMap<TransactionId, TransactionRecord>>,
}

impl TransactionManager {
    pub fn new(states: Arc<ConnectionStateManager>) -> Self {
        TransactionManager {
            states,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Opens a write transaction on `conn`.
    ///
    /// Fails with [`StorageError::TransactionActive`] when the connection is
    /// already transacting; in that case nothing is changed.
    pub fn begin_transaction(&self, conn: &Connection, connection: ConnectionId) -> Result<TransactionId> {
        self.states.start_transaction(connection)?;
        if let Err(err) = conn.execute_batch("BEGIN IMMEDIATE") {
            self.states.end_transaction(connection);
            return Err(err.into());
        }

        let id = TransactionId::generate();
        self.active.lock().insert(
            id,
            TransactionRecord {
                connection,
                started_at: Instant::now(),
                operations: Vec::new(),
            },
        );
        msg_debug!(Message::TransactionStarted { id, connection });
        Ok(id)
    }

    /// Commits `id`. A transaction that is unknown, or whose connection is no
    /// longer inside a native transaction, commits as a no-op. If `COMMIT`
    /// fails the transaction is rolled back and the commit error returned.
    pub fn commit_transaction(&self, conn: &Connection, id: TransactionId) -> Result<()> {
        let Some(record) = self.active.lock().remove(&id) else {
            return Ok(());
        };
        let outcome = if conn.is_autocommit() {
            Ok(())
        } else {
            conn.execute_batch("COMMIT").map_err(|err| {
                if !conn.is_autocommit() {
                    if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                        msg_error!(Message::TransactionRollbackFailed {
                            id,
                            reason: rollback.to_string()
                        });
                    }
                }
                StorageError::from(err)
            })
        };
        self.states.end_transaction(record.connection);
        msg_debug!(Message::TransactionFinished {
            id,
            committed: outcome.is_ok(),
            operations: record.operations.len(),
            elapsed_ms: record.started_at.elapsed().as_millis() as u64,
        });
        outcome
    }

    /// Rolls back `id`. Unknown transactions and connections already out of
    /// their native transaction are no-op successes.
    pub fn rollback_transaction(&self, conn: &Connection, id: TransactionId) -> Result<()> {
        let Some(record) = self.active.lock().remove(&id) else {
            return Ok(());
        };
        let outcome = if conn.is_autocommit() {
            Ok(())
        } else {
            conn.execute_batch("ROLLBACK").map_err(StorageError::from)
        };
        self.states.end_transaction(record.connection);
        msg_debug!(Message::TransactionFinished {
            id,
            committed: false,
            operations: record.operations.len(),
            elapsed_ms: record.started_at.elapsed().as_millis() as u64,
        });
        outcome
    }

    /// Appends a journal entry. Ignored for unknown transactions.
    pub fn record_operation(
        &self,
        id: TransactionId,
        kind: OperationKind,
        path: &str,
        before: Option<Task>,
        after: Option<Task>,
    ) {
        if let Some(record) = self.active.lock().get_mut(&id) {
            let entry = OperationLogEntry {
                id: record.operations.len() as u64 + 1,
                kind,
                timestamp: now_millis(),
                path: path.to_string(),
                before,
                after,
            };
            record.operations.push(entry);
        }
    }

    /// Journal of `id` so far; empty for unknown transactions.
    pub fn operations(&self, id: TransactionId) -> Vec<OperationLogEntry> {
        self.active
            .lock()
            .get(&id)
            .map(|record| record.operations.clone())
            .unwrap_or_default()
    }

    pub fn connection_of(&self, id: TransactionId) -> Option<ConnectionId> {
        self.active.lock().get(&id).map(|record| record.connection)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Forgets every open transaction and clears the transacting flags.
    /// Used at shutdown after the pool has rolled back its connections.
    pub fn abandon_all(&self) -> usize {
        let drained: Vec<(TransactionId, TransactionRecord)> = self.active.lock().drain().collect();
        for (id, record) in &drained {
            self.states.end_transaction(record.connection);
            msg_debug!(Message::TransactionAbandoned(*id));
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::config::HealthConfig;

    fn setup() -> (Connection, TransactionManager, ConnectionId) {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        let states = Arc::new(ConnectionStateManager::new(&HealthConfig::default()));
        let id = ConnectionId(1);
        states.register_connection(id);
        (conn, TransactionManager::new(states), id)
    }

    #[test]
    fn nested_begin_fails_and_leaves_first_intact() {
        let (conn, manager, id) = setup();
        let tx = manager.begin_transaction(&conn, id).unwrap();
        conn.execute("INSERT INTO t VALUES (1)", []).unwrap();

        let err = manager.begin_transaction(&conn, id).unwrap_err();
        assert!(matches!(err, StorageError::TransactionActive(_)));
        assert_eq!(manager.active_count(), 1);
        assert!(!conn.is_autocommit());

        manager.commit_transaction(&conn, tx).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
        assert!(!manager.states.has_active_transaction(id));
    }

    #[test]
    fn rollback_discards_writes_and_journal() {
        let (conn, manager, id) = setup();
        let tx = manager.begin_transaction(&conn, id).unwrap();
        conn.execute("INSERT INTO t VALUES (1)", []).unwrap();
        manager.record_operation(tx, OperationKind::Create, "a", None, None);
        assert_eq!(manager.operations(tx).len(), 1);

        manager.rollback_transaction(&conn, tx).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
        assert!(manager.operations(tx).is_empty());
    }

    #[test]
    fn finishing_twice_is_a_no_op() {
        let (conn, manager, id) = setup();
        let tx = manager.begin_transaction(&conn, id).unwrap();
        manager.commit_transaction(&conn, tx).unwrap();
        manager.commit_transaction(&conn, tx).unwrap();
        manager.rollback_transaction(&conn, tx).unwrap();
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn journal_keeps_program_order() {
        let (conn, manager, id) = setup();
        let tx = manager.begin_transaction(&conn, id).unwrap();
        manager.record_operation(tx, OperationKind::Create, "a", None, None);
        manager.record_operation(tx, OperationKind::Update, "p", None, None);
        manager.record_operation(tx, OperationKind::Delete, "b", None, None);

        let ops = manager.operations(tx);
        let order: Vec<_> = ops.iter().map(|op| (op.id, op.kind, op.path.as_str())).collect();
        assert_eq!(
            order,
            vec![
                (1, OperationKind::Create, "a"),
                (2, OperationKind::Update, "p"),
                (3, OperationKind::Delete, "b")
            ]
        );
        assert_eq!(manager.abandon_all(), 1);
        manager.rollback_transaction(&conn, tx).unwrap();
        conn.execute_batch("ROLLBACK").unwrap();
    }
}
