//! Typed errors for the storage engine.
//!
//! Driver failures are classified by SQLite result code when they are
//! converted from [`rusqlite::Error`]:
//!
//! | Class | Codes | Retried |
//! |-------|-------|---------|
//! | Transient | `SQLITE_BUSY`, `SQLITE_LOCKED`, `SQLITE_IOERR` | yes |
//! | WAL contention | journal-mode / `-wal` failures | yes, longer backoff |
//! | Structural | `SQLITE_CORRUPT`, `SQLITE_NOTADB`, `SQLITE_READONLY`, `SQLITE_CANTOPEN` | no |
//! | Application | not found, validation, transitions, cycles | no |
//! | Resource exhaustion | pool timeout | no (the caller may retry) |
//!
//! Callers outside the engine should use [`StorageError::to_external`], which
//! keeps the message but never exposes raw driver codes.

use crate::db::connection_state::ConnectionId;
use crate::db::pool::ConnectionDiagnostics;
use crate::libs::task::TaskStatus;
use rusqlite::ErrorCode;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database is busy: {0}")]
    Busy(String),

    #[error("database I/O failure: {0}")]
    Io(String),

    #[error("WAL journal failure: {0}")]
    Wal(String),

    #[error("database is unusable: {0}")]
    Structural(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("{message}")]
    Validation { message: String, hint: Option<String> },

    #[error("invalid status transition for '{path}': {from} -> {to}")]
    InvalidStatusTransition { path: String, from: TaskStatus, to: TaskStatus },

    #[error("circular dependency: '{path}' cannot depend on '{dependency}'")]
    CircularDependency { path: String, dependency: String },

    #[error("transaction already active on connection {0}")]
    TransactionActive(ConnectionId),

    #[error("connection timeout after {}ms; pool state: {}", .waited.as_millis(), format_diagnostics(.connections))]
    ConnectionTimeout {
        waited: Duration,
        connections: Vec<ConnectionDiagnostics>,
    },

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("{context} failed after {attempts} attempts: {last}")]
    RetryExhausted { context: String, attempts: u32, last: String },

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Retry-relevant classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    WalContention,
    Structural,
    Application,
    ResourceExhausted,
    Internal,
}

/// Error kinds visible to callers of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotFound,
    Validation,
    InvalidStatusTransition,
    CircularDependency,
    Timeout,
    Unavailable,
    Internal,
}

/// Error record handed to the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl StorageError {
    pub fn validation(message: impl Into<String>, hint: impl Into<String>) -> Self {
        StorageError::Validation {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            StorageError::Busy(_) | StorageError::Io(_) => ErrorClass::Transient,
            StorageError::Wal(_) => ErrorClass::WalContention,
            StorageError::Structural(_) => ErrorClass::Structural,
            StorageError::TaskNotFound(_)
            | StorageError::Validation { .. }
            | StorageError::InvalidStatusTransition { .. }
            | StorageError::CircularDependency { .. }
            | StorageError::TransactionActive(_) => ErrorClass::Application,
            StorageError::ConnectionTimeout { .. } | StorageError::PoolClosed => ErrorClass::ResourceExhausted,
            StorageError::RetryExhausted { .. }
            | StorageError::Constraint(_)
            | StorageError::Serialization(_)
            | StorageError::Database(_)
            | StorageError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Only transient and WAL-contention failures are retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::WalContention)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::TaskNotFound(_) => ErrorKind::NotFound,
            StorageError::Validation { .. } | StorageError::TransactionActive(_) => ErrorKind::Validation,
            StorageError::InvalidStatusTransition { .. } => ErrorKind::InvalidStatusTransition,
            StorageError::CircularDependency { .. } => ErrorKind::CircularDependency,
            StorageError::ConnectionTimeout { .. } => ErrorKind::Timeout,
            StorageError::PoolClosed | StorageError::Structural(_) => ErrorKind::Unavailable,
            _ => ErrorKind::Internal,
        }
    }

    pub fn hint(&self) -> Option<String> {
        match self {
            StorageError::Validation { hint, .. } => hint.clone(),
            StorageError::InvalidStatusTransition { from, .. } => Some(format!(
                "allowed transitions from {from}: {}",
                TaskStatus::ALL
                    .iter()
                    .filter(|next| **next != *from && from.can_transition_to(**next))
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
            StorageError::CircularDependency { .. } => {
                Some("remove the reverse dependency before adding this one".to_string())
            }
            StorageError::TaskNotFound(_) => Some("check the task path or create the task first".to_string()),
            StorageError::ConnectionTimeout { .. } => Some("retry the request once load decreases".to_string()),
            _ => None,
        }
    }

    pub fn to_external(&self) -> ExternalError {
        let message = match self.kind() {
            ErrorKind::Internal => match self {
                StorageError::Database(e) => format!("internal storage error: {}", driver_message(e)),
                other => format!("internal storage error: {other}"),
            },
            _ => self.to_string(),
        };
        ExternalError {
            kind: self.kind(),
            message,
            hint: self.hint(),
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        let message = driver_message(&err);
        if let rusqlite::Error::SqliteFailure(failure, _) = &err {
            return match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StorageError::Busy(message),
                ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::ReadOnly
                | ErrorCode::CannotOpen => StorageError::Structural(message),
                ErrorCode::ConstraintViolation => StorageError::Constraint(message),
                _ if is_wal_message(&message) => StorageError::Wal(message),
                ErrorCode::SystemIoFailure => StorageError::Io(message),
                _ => StorageError::Database(err),
            };
        }
        StorageError::Database(err)
    }
}

/// Message text of a driver error without its numeric result code.
fn driver_message(err: &rusqlite::Error) -> String {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(msg)) => msg.clone(),
        rusqlite::Error::SqliteFailure(failure, None) => failure.to_string(),
        other => other.to_string(),
    }
}

fn is_wal_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("wal") || lower.contains("journal_mode") || lower.contains("journal mode")
}

fn format_diagnostics(connections: &[ConnectionDiagnostics]) -> String {
    if connections.is_empty() {
        return "no connections".to_string();
    }
    connections.iter().map(|c| c.to_string()).collect::<Vec<_>>().join("; ")
}
