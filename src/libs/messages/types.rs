use crate::db::connection_state::ConnectionId;
use crate::db::transaction::TransactionId;

#[derive(Debug, Clone)]
pub enum Message {
    // === POOL MESSAGES ===
    PoolInitialized { path: String, max_connections: usize },
    PoolClosed(usize),
    ConnectionCreated { id: ConnectionId, pool_size: usize },
    ConnectionCreateFailed(String),
    ConnectionRemoved { id: ConnectionId, reason: &'static str },
    ConnectionCloseFailed { id: ConnectionId, reason: String },
    ConnectionTimeout { waited_ms: u64, connections: usize },
    DanglingTransaction(ConnectionId),
    RollbackFailed { id: ConnectionId, reason: String },

    // === CONNECTION STATE MESSAGES ===
    ConnectionRegistered(ConnectionId),
    ConnectionUnregistered(ConnectionId),
    UnhealthyConnections(Vec<ConnectionId>),

    // === WAL MESSAGES ===
    WalEnabled(String),
    CheckpointCompleted { busy: bool, log_frames: i64, checkpointed_frames: i64 },
    CheckpointFailed(String),

    // === TRANSACTION MESSAGES ===
    TransactionStarted { id: TransactionId, connection: ConnectionId },
    TransactionFinished { id: TransactionId, committed: bool, operations: usize, elapsed_ms: u64 },
    TransactionRollbackFailed { id: TransactionId, reason: String },
    TransactionAbandoned(TransactionId),
    TransactionsAbandoned(usize),

    // === RETRY MESSAGES ===
    RetryScheduled { context: String, attempt: u32, max_attempts: u32, delay_ms: u64, reason: String },

    // === STORAGE MESSAGES ===
    StorageReady(String),
    TasksSaved(usize),
    TasksCleared(usize),
    RelationshipsRepaired { issues: usize, dry_run: bool },

    // === TASK MESSAGES ===
    TaskCreated(String),
    TaskUpdated { path: String, version: u64 },
    TaskDeleted { path: String, removed: usize },
    StatusPropagated { path: String, cascaded: usize },

    // === APPLICATION MESSAGES ===
    ContextInitialized(String),
    ContextShutdown,
    LoggingInitialized(String),
}
