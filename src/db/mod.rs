//! SQLite storage engine.
//!
//! Connections come from a bounded [`pool::ConnectionPool`] whose per-connection
//! health and transaction flags live in [`connection_state`]. Every connection
//! runs in WAL mode ([`wal`]). [`storage::Storage`] is the façade callers use;
//! it combines the pool, the [`transaction`] manager and the [`cache`].

/// Task read cache with entry and memory caps.
pub mod cache;

/// Per-connection health, usage and transaction tracking.
pub mod connection_state;

/// Vacuum, analyze, integrity checks, statistics and relationship repair.
pub mod maintenance;

/// Bounded SQLite connection pool.
pub mod pool;

/// Table definition and per-connection pragmas.
pub mod schema;

/// Storage façade and the transaction handle it hands out.
pub mod storage;

/// Row-level SQL for the `tasks` table.
pub mod tasks;

/// Transaction boundaries and the per-transaction operation log.
pub mod transaction;

/// WAL mode and checkpoints.
pub mod wal;
