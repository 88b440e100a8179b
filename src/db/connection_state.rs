//! Per-connection liveness and health tracking.
//!
//! The manager keeps a shadow [`ConnectionState`] for every pooled connection,
//! registered when the pool opens the connection and removed when the pool
//! closes it. The pool consults it before handing a connection out, and the
//! transaction manager uses it to enforce one transaction per connection.
//!
//! Health is a verdict, not an action: [`ConnectionStateManager::check_connections`]
//! reports and logs unhealthy connections, and the pool's idle cleanup is what
//! actually replaces them.

use crate::libs::config::HealthConfig;
use crate::libs::error::{Result, StorageError};
use crate::libs::messages::Message;
use crate::{msg_debug, msg_warning};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Identity of a pooled connection. Owned by the connection wrapper itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub in_use: bool,
    pub has_active_transaction: bool,
    pub error_count: u32,
    pub total_queries: u64,
    pub total_response_time: Duration,
    pub registered_at: Instant,
    pub last_used: Instant,
}

impl ConnectionState {
    fn new() -> Self {
        let now = Instant::now();
        ConnectionState {
            in_use: false,
            has_active_transaction: false,
            error_count: 0,
            total_queries: 0,
            total_response_time: Duration::ZERO,
            registered_at: now,
            last_used: now,
        }
    }

    pub fn average_response_time(&self) -> Duration {
        if self.total_queries == 0 {
            return Duration::ZERO;
        }
        self.total_response_time / self.total_queries.min(u32::MAX as u64) as u32
    }
}

/// Summary produced by a health sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: Vec<ConnectionId>,
    pub in_use: usize,
    pub in_transaction: usize,
}

pub struct ConnectionStateManager {
    states: Mutex<HashMap<ConnectionId, ConnectionState>>,
    max_errors: u32,
    max_response_time: Duration,
    check_interval: Duration,
}

impl ConnectionStateManager {
    pub fn new(config: &HealthConfig) -> Self {
        ConnectionStateManager {
            states: Mutex::new(HashMap::new()),
            max_errors: config.max_errors,
            max_response_time: Duration::from_millis(config.max_response_time_ms),
            check_interval: Duration::from_millis(config.check_interval_ms),
        }
    }

    pub fn register_connection(&self, id: ConnectionId) {
        self.states.lock().insert(id, ConnectionState::new());
        msg_debug!(Message::ConnectionRegistered(id));
    }

    pub fn unregister_connection(&self, id: ConnectionId) {
        if self.states.lock().remove(&id).is_some() {
            msg_debug!(Message::ConnectionUnregistered(id));
        }
    }

    pub fn mark_in_use(&self, id: ConnectionId) {
        if let Some(state) = self.states.lock().get_mut(&id) {
            state.in_use = true;
            state.last_used = Instant::now();
        }
    }

    pub fn mark_available(&self, id: ConnectionId) {
        if let Some(state) = self.states.lock().get_mut(&id) {
            state.in_use = false;
            state.last_used = Instant::now();
        }
    }

    /// Flags `id` as transacting. Fails without touching any state when the
    /// connection already has an open transaction or is unknown.
    pub fn start_transaction(&self, id: ConnectionId) -> Result<()> {
        let mut states = self.states.lock();
        let state = states
            .get_mut(&id)
            .ok_or_else(|| StorageError::Internal(format!("unknown connection {id}")))?;
        if state.has_active_transaction {
            return Err(StorageError::TransactionActive(id));
        }
        state.has_active_transaction = true;
        Ok(())
    }

    pub fn end_transaction(&self, id: ConnectionId) {
        if let Some(state) = self.states.lock().get_mut(&id) {
            state.has_active_transaction = false;
        }
    }

    pub fn has_active_transaction(&self, id: ConnectionId) -> bool {
        self.states
            .lock()
            .get(&id)
            .map(|state| state.has_active_transaction)
            .unwrap_or(false)
    }

    pub fn record_query(&self, id: ConnectionId, duration: Duration, failed: bool) {
        if let Some(state) = self.states.lock().get_mut(&id) {
            state.total_queries += 1;
            state.total_response_time += duration;
            state.last_used = Instant::now();
            if failed {
                state.error_count += 1;
            }
        }
    }

    /// An unknown connection is never healthy.
    pub fn is_healthy(&self, id: ConnectionId) -> bool {
        self.states
            .lock()
            .get(&id)
            .map(|state| self.verdict(state))
            .unwrap_or(false)
    }

    pub fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.states.lock().get(&id).cloned()
    }

    pub fn tracked(&self) -> usize {
        self.states.lock().len()
    }

    fn verdict(&self, state: &ConnectionState) -> bool {
        state.error_count < self.max_errors && state.average_response_time() < self.max_response_time
    }

    /// Recomputes health for every tracked connection and logs the outcome.
    pub fn check_connections(&self) -> HealthReport {
        let mut report = {
            let states = self.states.lock();
            let mut report = HealthReport {
                total: states.len(),
                ..Default::default()
            };
            for (id, state) in states.iter() {
                if self.verdict(state) {
                    report.healthy += 1;
                } else {
                    report.unhealthy.push(*id);
                }
                if state.in_use {
                    report.in_use += 1;
                }
                if state.has_active_transaction {
                    report.in_transaction += 1;
                }
            }
            report
        };
        report.unhealthy.sort();

        tracing::info!(
            total = report.total,
            healthy = report.healthy,
            unhealthy = report.unhealthy.len(),
            in_use = report.in_use,
            in_transaction = report.in_transaction,
            "connection health check"
        );
        if !report.unhealthy.is_empty() {
            msg_warning!(Message::UnhealthyConnections(report.unhealthy.clone()));
        }
        report
    }

    /// Spawns the periodic health sweep. Abort the handle to stop it.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = manager.check_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.check_connections();
            }
        })
    }
}
