//! Table layout and per-connection pragmas.

use crate::libs::config::{ConnectionConfig, PerformanceConfig};
use crate::libs::error::Result;
use rusqlite::{Connection, OptionalExtension};

/// Single-table layout. List and record fields are JSON text; `version` and
/// timestamps live in `metadata` and are mirrored into the integer columns.
pub const SCHEMA_TASKS: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    path TEXT PRIMARY KEY NOT NULL CHECK (length(path) > 0),
    name TEXT NOT NULL CHECK (length(name) > 0),
    description TEXT,
    type TEXT NOT NULL CHECK (type IN ('TASK', 'MILESTONE', 'GROUP')),
    status TEXT NOT NULL CHECK (status IN ('PENDING', 'IN_PROGRESS', 'COMPLETED', 'FAILED', 'BLOCKED')),
    parent_path TEXT,
    notes TEXT NOT NULL DEFAULT '{}',
    reasoning TEXT,
    dependencies TEXT NOT NULL DEFAULT '[]',
    subtasks TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_parent_path ON tasks(parent_path);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
";

/// Creates the table and indexes if they are missing.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_TASKS)?;
    Ok(())
}

/// Performance and safety pragmas applied to every pooled connection.
///
/// `read_uncommitted` is forced off so readers only ever observe committed
/// rows, even on connections sharing the page cache.
pub fn apply_pragmas(conn: &Connection, connection: &ConnectionConfig, performance: &PerformanceConfig) -> Result<()> {
    conn.busy_timeout(std::time::Duration::from_millis(connection.busy_timeout_ms))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "page_size", performance.page_size)?;
    conn.pragma_update(None, "cache_size", performance.cache_size)?;
    conn.pragma_update(None, "mmap_size", performance.mmap_size as i64)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "read_uncommitted", false)?;
    Ok(())
}

/// Current pragma values, reported with storage metrics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PragmaValues {
    pub journal_mode: String,
    pub synchronous: i64,
    pub foreign_keys: bool,
    pub page_size: i64,
    pub page_count: i64,
    pub cache_size: i64,
    pub mmap_size: i64,
    pub busy_timeout: i64,
    pub temp_store: i64,
}

/// Reads the effective pragmas. Some pragmas return no row on certain
/// connections (`mmap_size` on an in-memory database); those read as zero.
pub fn read_pragmas(conn: &Connection) -> Result<PragmaValues> {
    let int = |name: &str| -> Result<i64> {
        Ok(conn
            .pragma_query_value(None, name, |row| row.get(0))
            .optional()?
            .unwrap_or(0))
    };
    Ok(PragmaValues {
        journal_mode: conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .optional()?
            .unwrap_or_default(),
        synchronous: int("synchronous")?,
        foreign_keys: int("foreign_keys")? != 0,
        page_size: int("page_size")?,
        page_count: int("page_count")?,
        cache_size: int("cache_size")?,
        mmap_size: int("mmap_size")?,
        busy_timeout: int("busy_timeout")?,
        temp_store: int("temp_store")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pragmas_of_in_memory_database_are_readable() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let pragmas = read_pragmas(&conn).unwrap();
        assert_eq!(pragmas.journal_mode.to_lowercase(), "memory");
        assert_eq!(pragmas.mmap_size, 0);
        assert!(pragmas.page_size > 0);
    }
}
