//! Bounded pool of SQLite connections.
//!
//! ## Acquisition
//!
//! [`ConnectionPool::get_connection`] scans for an idle connection that the
//! state manager reports healthy and not transacting. If none qualifies and
//! the pool is below its limit, a new connection is opened (with retries on
//! transient failures). Otherwise the caller polls every 100ms until a slot
//! frees or the acquisition timeout fires, in which case the error carries the
//! state of every pooled connection.
//!
//! ## Ownership
//!
//! A borrowed connection is moved out of its slot into a [`PoolConnection`]
//! guard; nobody else can reach it until the guard is dropped (or passed to
//! [`ConnectionPool::release_connection`]), which moves it back. Release is
//! therefore guaranteed on every exit path, including errors.
//!
//! ## Limits
//!
//! The pool never holds more than [`MAX_POOL_CONNECTIONS`] connections, even if
//! configured higher: SQLite has a single writer, so extra connections only
//! add lock contention.

use crate::db::connection_state::{ConnectionId, ConnectionStateManager};
use crate::db::schema;
use crate::db::wal::WalManager;
use crate::libs::config::{ConnectionConfig, PerformanceConfig, MAX_POOL_CONNECTIONS};
use crate::libs::error::{Result, StorageError};
use crate::libs::messages::Message;
use crate::libs::retry::RetryPolicy;
use crate::{msg_debug, msg_error, msg_info, msg_warning};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Interval between acquisition attempts while the pool is saturated.
pub const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Snapshot of one pooled connection, used in timeout errors and metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionDiagnostics {
    pub id: ConnectionId,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub in_use: bool,
    pub has_active_transaction: bool,
    pub error_count: u32,
    pub usage_count: u64,
}

impl fmt::Display for ConnectionDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} age={}ms idle={}ms in_use={} transaction={} errors={} uses={}",
            self.id, self.age_ms, self.idle_ms, self.in_use, self.has_active_transaction, self.error_count, self.usage_count
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolMetrics {
    pub size: usize,
    pub in_use: usize,
    pub idle: usize,
    pub max_connections: usize,
    pub total_acquisitions: u64,
    pub total_busy_time_ms: u64,
    pub connections: Vec<ConnectionDiagnostics>,
}

struct Slot {
    /// `None` while the connection is lent out.
    conn: Option<Connection>,
    in_use: bool,
    created_at: Instant,
    last_used: Instant,
    acquired_at: Option<Instant>,
    usage_count: u64,
    busy_time: Duration,
}

#[derive(Default)]
struct Slots {
    entries: HashMap<ConnectionId, Slot>,
    /// Connections being opened; counted against the limit.
    pending: usize,
}

struct PoolInner {
    db_path: PathBuf,
    connection: ConnectionConfig,
    performance: PerformanceConfig,
    states: Arc<ConnectionStateManager>,
    wal: Arc<WalManager>,
    retry: RetryPolicy,
    slots: Mutex<Slots>,
    next_id: AtomicU64,
    acquisitions: AtomicU64,
    busy_nanos: AtomicU64,
    initialized: AtomicBool,
    closed: AtomicBool,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

/// A borrowed connection. Returns itself to the pool when dropped.
pub struct PoolConnection {
    id: ConnectionId,
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl PoolConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Deref for PoolConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only taken in `drop`.
        self.conn.as_ref().expect("pooled connection used after release")
    }
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(self.id, conn);
        }
    }
}

impl fmt::Debug for PoolConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConnection").field("id", &self.id).finish()
    }
}

enum Acquire {
    Ready(PoolConnection),
    Reserved(Reservation),
    Saturated,
}

/// A slot counted against the pool limit while its connection is opened.
/// Dropped unsettled (the acquiring future was cancelled), it hands the
/// slot back.
struct Reservation {
    id: ConnectionId,
    pool: Arc<PoolInner>,
    settled: bool,
}

impl Reservation {
    fn new(pool: &Arc<PoolInner>, slots: &mut Slots) -> Self {
        slots.pending += 1;
        Reservation {
            id: ConnectionId(pool.next_id.fetch_add(1, Ordering::SeqCst)),
            pool: Arc::clone(pool),
            settled: false,
        }
    }

    /// Releases the pending count under a lock the caller already holds.
    fn settle(mut self, slots: &mut Slots) -> ConnectionId {
        slots.pending = slots.pending.saturating_sub(1);
        self.settled = true;
        self.id
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            let mut slots = self.pool.slots.lock();
            slots.pending = slots.pending.saturating_sub(1);
        }
    }
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        db_path: impl Into<PathBuf>,
        connection: ConnectionConfig,
        performance: PerformanceConfig,
        states: Arc<ConnectionStateManager>,
        wal: Arc<WalManager>,
        retry: RetryPolicy,
    ) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                db_path: db_path.into(),
                connection,
                performance,
                states,
                wal,
                retry,
                slots: Mutex::new(Slots::default()),
                next_id: AtomicU64::new(1),
                acquisitions: AtomicU64::new(0),
                busy_nanos: AtomicU64::new(0),
                initialized: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                cleanup_task: Mutex::new(None),
            }),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.inner.connection.effective_max()
    }

    pub fn states(&self) -> &Arc<ConnectionStateManager> {
        &self.inner.states
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.inner.wal
    }

    /// Prepares the database file and the first pooled connection.
    ///
    /// A throwaway bootstrap connection switches the file to WAL, truncates
    /// any leftover log and proves the file is readable before the pool
    /// starts handing out connections. Starts the idle-cleanup timer.
    pub async fn initialize(&self) -> Result<()> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(dir) = self.inner.db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| StorageError::Structural(format!("{}: {e}", dir.display())))?;
        }

        let inner = &*self.inner;
        let bootstrap = inner
            .retry
            .run("bootstrap connection", || async move { inner.bootstrap() })
            .await;
        if let Err(err) = bootstrap {
            self.inner.initialized.store(false, Ordering::SeqCst);
            return Err(err);
        }

        let first = self.reserve_and_create().await?;
        self.release_connection(first);

        self.start_cleanup_timer();
        msg_info!(Message::PoolInitialized {
            path: self.inner.db_path.display().to_string(),
            max_connections: self.max_connections(),
        });
        Ok(())
    }

    /// Waits up to the configured acquisition timeout for a connection.
    pub async fn get_connection(&self) -> Result<PoolConnection> {
        self.get_connection_with_timeout(self.inner.connection.acquire_timeout()).await
    }

    pub async fn get_connection_with_timeout(&self, timeout: Duration) -> Result<PoolConnection> {
        let started = Instant::now();
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(StorageError::PoolClosed);
            }
            match self.try_acquire() {
                Acquire::Ready(conn) => return Ok(conn),
                Acquire::Reserved(reservation) => return self.create_reserved(reservation).await,
                Acquire::Saturated => {}
            }

            let waited = started.elapsed();
            if waited >= timeout {
                let connections = self.diagnostics();
                msg_warning!(Message::ConnectionTimeout {
                    waited_ms: waited.as_millis() as u64,
                    connections: connections.len(),
                });
                return Err(StorageError::ConnectionTimeout { waited, connections });
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL.min(timeout - waited)).await;
        }
    }

    /// Returns a borrowed connection. Unknown or already-removed connections
    /// are closed instead of being pooled.
    pub fn release_connection(&self, conn: PoolConnection) {
        drop(conn);
    }

    fn try_acquire(&self) -> Acquire {
        let mut slots = self.inner.slots.lock();
        let candidate = slots
            .entries
            .iter()
            .filter(|(id, slot)| {
                !slot.in_use
                    && slot.conn.is_some()
                    && self.inner.states.is_healthy(**id)
                    && !self.inner.states.has_active_transaction(**id)
            })
            .min_by_key(|(_, slot)| slot.created_at)
            .map(|(id, _)| *id);

        if let Some(id) = candidate {
            if let Some(slot) = slots.entries.get_mut(&id) {
                let now = Instant::now();
                slot.in_use = true;
                slot.acquired_at = Some(now);
                slot.last_used = now;
                slot.usage_count += 1;
                if let Some(conn) = slot.conn.take() {
                    drop(slots);
                    self.inner.states.mark_in_use(id);
                    self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
                    return Acquire::Ready(PoolConnection {
                        id,
                        conn: Some(conn),
                        pool: Arc::clone(&self.inner),
                    });
                }
            }
        }

        if slots.entries.len() + slots.pending < self.max_connections() {
            return Acquire::Reserved(Reservation::new(&self.inner, &mut slots));
        }
        Acquire::Saturated
    }

    async fn reserve_and_create(&self) -> Result<PoolConnection> {
        let reservation = {
            let mut slots = self.inner.slots.lock();
            Reservation::new(&self.inner, &mut slots)
        };
        self.create_reserved(reservation).await
    }

    /// Opens the connection for a reserved slot and hands it out in use.
    async fn create_reserved(&self, reservation: Reservation) -> Result<PoolConnection> {
        let inner = &*self.inner;
        let opened = inner
            .retry
            .run("open connection", || async move { inner.open_connection() })
            .await;

        let mut slots = self.inner.slots.lock();
        let id = reservation.settle(&mut slots);
        let conn = match opened {
            Ok(conn) => conn,
            Err(err) => {
                drop(slots);
                msg_error!(Message::ConnectionCreateFailed(err.to_string()));
                return Err(err);
            }
        };
        if self.inner.closed.load(Ordering::SeqCst) {
            drop(slots);
            close_quietly(id, conn);
            return Err(StorageError::PoolClosed);
        }

        let now = Instant::now();
        slots.entries.insert(
            id,
            Slot {
                conn: None,
                in_use: true,
                created_at: now,
                last_used: now,
                acquired_at: Some(now),
                usage_count: 1,
                busy_time: Duration::ZERO,
            },
        );
        let size = slots.entries.len();
        drop(slots);

        self.inner.states.register_connection(id);
        self.inner.states.mark_in_use(id);
        self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
        msg_debug!(Message::ConnectionCreated { id, pool_size: size });
        Ok(PoolConnection {
            id,
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Drops idle connections past the idle timeout or maximum age while the
    /// pool stays at or above its minimum size. Unhealthy idle connections are
    /// always dropped. Returns how many were closed.
    pub fn cleanup_idle_connections(&self) -> usize {
        self.inner.cleanup_idle_connections()
    }

    pub fn diagnostics(&self) -> Vec<ConnectionDiagnostics> {
        self.inner.diagnostics()
    }

    pub fn metrics(&self) -> PoolMetrics {
        let connections = self.diagnostics();
        let in_use = connections.iter().filter(|c| c.in_use).count();
        PoolMetrics {
            size: connections.len(),
            in_use,
            idle: connections.len() - in_use,
            max_connections: self.max_connections(),
            total_acquisitions: self.inner.acquisitions.load(Ordering::Relaxed),
            total_busy_time_ms: self.inner.busy_nanos.load(Ordering::Relaxed) / 1_000_000,
            connections,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Rolls back dangling transactions and closes every pooled connection.
    /// Individual failures are logged and do not stop the sweep. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.inner.cleanup_task.lock().take() {
            task.abort();
        }

        let drained: Vec<(ConnectionId, Option<Connection>)> = {
            let mut slots = self.inner.slots.lock();
            slots.entries.drain().map(|(id, slot)| (id, slot.conn)).collect()
        };
        let count = drained.len();
        for (id, conn) in drained {
            if let Some(conn) = conn {
                if self.inner.states.has_active_transaction(id) || !conn.is_autocommit() {
                    rollback_quietly(id, &conn);
                    self.inner.states.end_transaction(id);
                }
                close_quietly(id, conn);
            }
            self.inner.states.unregister_connection(id);
        }
        msg_info!(Message::PoolClosed(count));
    }

    fn start_cleanup_timer(&self) {
        let period = self.inner.connection.cleanup_interval().max(Duration::from_millis(10));
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                inner.cleanup_idle_connections();
            }
        });
        *self.inner.cleanup_task.lock() = Some(task);
    }
}

impl PoolInner {
    fn bootstrap(&self) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_millis(self.connection.busy_timeout_ms))?;
        self.wal.enable_wal(&conn)?;
        self.wal.checkpoint(&conn)?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        conn.close().map_err(|(_, e)| StorageError::from(e))?;
        Ok(())
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        schema::apply_pragmas(&conn, &self.connection, &self.performance)?;
        self.wal.enable_wal(&conn)?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(conn)
    }

    fn give_back(&self, id: ConnectionId, conn: Connection) {
        if !conn.is_autocommit() {
            msg_warning!(Message::DanglingTransaction(id));
            rollback_quietly(id, &conn);
            self.states.end_transaction(id);
        }

        let mut slots = self.slots.lock();
        let closed = self.closed.load(Ordering::SeqCst);
        match slots.entries.get_mut(&id) {
            Some(slot) if !closed => {
                let now = Instant::now();
                if let Some(acquired) = slot.acquired_at.take() {
                    let busy = now.duration_since(acquired);
                    slot.busy_time += busy;
                    self.busy_nanos.fetch_add(busy.as_nanos() as u64, Ordering::Relaxed);
                }
                slot.in_use = false;
                slot.last_used = now;
                slot.conn = Some(conn);
                drop(slots);
                self.states.mark_available(id);
            }
            _ => {
                slots.entries.remove(&id);
                drop(slots);
                self.states.unregister_connection(id);
                close_quietly(id, conn);
            }
        }
    }

    fn cleanup_idle_connections(&self) -> usize {
        let min = self.connection.effective_min();
        let idle_timeout = self.connection.idle_timeout();
        let max_age = self.connection.max_connection_age();

        let removed: Vec<(ConnectionId, Connection, &'static str)> = {
            let mut slots = self.slots.lock();
            let mut idle: Vec<(ConnectionId, Instant)> = slots
                .entries
                .iter()
                .filter(|(id, slot)| !slot.in_use && slot.conn.is_some() && !self.states.has_active_transaction(**id))
                .map(|(id, slot)| (*id, slot.created_at))
                .collect();
            idle.sort_by_key(|(_, created)| *created);

            let mut removed = Vec::new();
            for (id, _) in idle {
                let Some(slot) = slots.entries.get(&id) else { continue };
                let reason = if !self.states.is_healthy(id) {
                    Some("unhealthy")
                } else if slots.entries.len() <= min {
                    None
                } else if slot.created_at.elapsed() > max_age {
                    Some("max age")
                } else if slot.last_used.elapsed() > idle_timeout {
                    Some("idle")
                } else {
                    None
                };
                if let Some(reason) = reason {
                    if let Some(conn) = slots.entries.remove(&id).and_then(|slot| slot.conn) {
                        removed.push((id, conn, reason));
                    }
                }
            }
            removed
        };

        let count = removed.len();
        for (id, conn, reason) in removed {
            self.states.unregister_connection(id);
            close_quietly(id, conn);
            msg_debug!(Message::ConnectionRemoved { id, reason });
        }
        count
    }

    fn diagnostics(&self) -> Vec<ConnectionDiagnostics> {
        let slots = self.slots.lock();
        let mut list: Vec<ConnectionDiagnostics> = slots
            .entries
            .iter()
            .map(|(id, slot)| {
                let state = self.states.state(*id);
                ConnectionDiagnostics {
                    id: *id,
                    age_ms: slot.created_at.elapsed().as_millis() as u64,
                    idle_ms: if slot.in_use { 0 } else { slot.last_used.elapsed().as_millis() as u64 },
                    in_use: slot.in_use,
                    has_active_transaction: state.as_ref().map(|s| s.has_active_transaction).unwrap_or(false),
                    error_count: state.as_ref().map(|s| s.error_count).unwrap_or(0),
                    usage_count: slot.usage_count,
                }
            })
            .collect();
        list.sort_by_key(|c| c.id);
        list
    }
}

fn rollback_quietly(id: ConnectionId, conn: &Connection) {
    if conn.is_autocommit() {
        return;
    }
    if let Err(err) = conn.execute_batch("ROLLBACK") {
        msg_error!(Message::RollbackFailed {
            id,
            reason: err.to_string()
        });
    }
}

fn close_quietly(id: ConnectionId, conn: Connection) {
    if let Err((_, err)) = conn.close() {
        msg_error!(Message::ConnectionCloseFailed {
            id,
            reason: err.to_string()
        });
    }
}
