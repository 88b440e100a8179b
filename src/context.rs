//! Explicit construction and shutdown of the engine.
//!
//! [`AppContext`] owns one instance of every manager and hands shared
//! handles to the components that need them. Startup runs in a fixed order:
//! connection state manager, WAL manager, pool, transaction manager, cache,
//! storage (schema), operations, then the background timers.

use crate::db::cache::TaskCache;
use crate::db::connection_state::ConnectionStateManager;
use crate::db::pool::ConnectionPool;
use crate::db::storage::Storage;
use crate::db::transaction::TransactionManager;
use crate::db::wal::WalManager;
use crate::libs::config::StorageConfig;
use crate::libs::error::Result;
use crate::libs::events::EventBus;
use crate::libs::messages::Message;
use crate::libs::retry::RetryPolicy;
use crate::msg_info;
use crate::ops::task_operations::TaskOperations;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct AppContext {
    config: StorageConfig,
    states: Arc<ConnectionStateManager>,
    storage: Arc<Storage>,
    operations: TaskOperations,
    health_monitor: Mutex<Option<JoinHandle<()>>>,
}

impl AppContext {
    /// Opens (or creates) the database described by `config` and starts the
    /// background timers. Must be called inside a tokio runtime.
    pub async fn initialize(config: StorageConfig) -> Result<AppContext> {
        let db_path = config.database_path();

        let states = Arc::new(ConnectionStateManager::new(&config.health));
        let wal = Arc::new(WalManager::new(db_path.clone()));
        let pool = ConnectionPool::new(
            db_path.clone(),
            config.connection.clone(),
            config.performance.clone(),
            Arc::clone(&states),
            wal,
            RetryPolicy::from(&config.retry),
        );
        pool.initialize().await?;

        let transactions = Arc::new(TransactionManager::new(Arc::clone(&states)));
        let cache = TaskCache::new(&config.cache);
        let storage = Arc::new(Storage::new(config.clone(), pool, transactions, cache, EventBus::new()));
        if let Err(err) = storage.initialize().await {
            storage.close();
            return Err(err);
        }

        let operations = TaskOperations::new(Arc::clone(&storage));

        storage.start_timers();
        let health_monitor = states.spawn_health_monitor();

        msg_info!(Message::ContextInitialized(db_path.display().to_string()));
        Ok(AppContext {
            config,
            states,
            storage,
            operations,
            health_monitor: Mutex::new(Some(health_monitor)),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn operations(&self) -> &TaskOperations {
        &self.operations
    }

    pub fn connection_states(&self) -> &Arc<ConnectionStateManager> {
        &self.states
    }

    /// Stops the timers, rolls back open transactions and closes the pool.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        let Some(monitor) = self.health_monitor.lock().take() else {
            return;
        };
        monitor.abort();
        self.storage.close();
        msg_info!(Message::ContextShutdown);
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
