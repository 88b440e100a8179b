//! Write-ahead-log journaling for one database file.
//!
//! WAL mode lets any number of readers proceed alongside the single writer,
//! which is what makes a multi-connection pool worthwhile for SQLite. Under
//! sustained writes the `-wal` file only shrinks when it is checkpointed, so
//! the pool truncates it at startup and the storage façade exposes an
//! on-demand (and optionally periodic) checkpoint.

use crate::libs::error::{Result, StorageError};
use crate::libs::messages::Message;
use crate::{msg_debug, msg_info};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Outcome of `PRAGMA wal_checkpoint(TRUNCATE)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointResult {
    /// `true` when a reader or writer prevented a full checkpoint.
    pub busy: bool,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalMetrics {
    pub enabled: bool,
    pub wal_size_bytes: u64,
    pub last_checkpoint: Option<DateTime<Utc>>,
    pub checkpoint_count: u64,
}

pub struct WalManager {
    db_path: PathBuf,
    enabled: AtomicBool,
    checkpoints: AtomicU64,
    last_checkpoint: Mutex<Option<DateTime<Utc>>>,
}

impl WalManager {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        WalManager {
            db_path: db_path.into(),
            enabled: AtomicBool::new(false),
            checkpoints: AtomicU64::new(0),
            last_checkpoint: Mutex::new(None),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn wal_path(&self) -> PathBuf {
        let mut name = self.db_path.as_os_str().to_owned();
        name.push("-wal");
        PathBuf::from(name)
    }

    /// Switches `conn` to WAL journaling with `synchronous = NORMAL`.
    ///
    /// Safe to call repeatedly; the journal mode is persistent in the file, so
    /// later calls only confirm it.
    pub fn enable_wal(&self, conn: &Connection) -> Result<()> {
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            return Err(StorageError::Wal(format!(
                "journal mode is '{mode}' after requesting WAL for {}",
                self.db_path.display()
            )));
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        if !self.enabled.swap(true, Ordering::SeqCst) {
            msg_info!(Message::WalEnabled(self.db_path.display().to_string()));
        }
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Folds the WAL back into the main file and truncates it.
    pub fn checkpoint(&self, conn: &Connection) -> Result<CheckpointResult> {
        let result = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
            Ok(CheckpointResult {
                busy: row.get::<_, i64>(0)? != 0,
                log_frames: row.get(1)?,
                checkpointed_frames: row.get(2)?,
            })
        })?;

        *self.last_checkpoint.lock() = Some(Utc::now());
        self.checkpoints.fetch_add(1, Ordering::SeqCst);
        msg_debug!(Message::CheckpointCompleted {
            busy: result.busy,
            log_frames: result.log_frames,
            checkpointed_frames: result.checkpointed_frames,
        });
        Ok(result)
    }

    pub fn metrics(&self) -> WalMetrics {
        WalMetrics {
            enabled: self.is_enabled(),
            wal_size_bytes: fs::metadata(self.wal_path()).map(|m| m.len()).unwrap_or(0),
            last_checkpoint: *self.last_checkpoint.lock(),
            checkpoint_count: self.checkpoints.load(Ordering::SeqCst),
        }
    }
}
