//! Storage façade over the pool, transaction manager and task cache.
//!
//! Every operation borrows a pooled connection through a [`PoolConnection`]
//! guard, so the connection goes back to the pool on every exit path. Reads
//! are cache-first; writes run inside a native transaction and only touch the
//! cache and publish events after that transaction commits.
//!
//! ## Transactions
//!
//! [`Storage::in_transaction`] runs a synchronous body against a
//! [`StorageTransaction`], committing on `Ok` and rolling back on `Err`. When
//! the failure is transient (busy, locked, WAL contention) the whole body is
//! retried on a fresh transaction. [`Storage::begin_transaction`] hands out the
//! transaction directly for callers that need to drive it themselves; dropping
//! it without committing rolls it back.

use crate::db::cache::{CacheStats, TaskCache};
use crate::db::maintenance::{self, DatabaseStats, IntegrityReport, RepairReport};
use crate::db::pool::{ConnectionPool, PoolConnection, PoolMetrics};
use crate::db::schema;
use crate::db::tasks;
use crate::db::transaction::{OperationKind, OperationLogEntry, TransactionId, TransactionManager};
use crate::db::wal::{CheckpointResult, WalMetrics};
use crate::libs::config::StorageConfig;
use crate::libs::error::{ErrorClass, Result, StorageError};
use crate::libs::events::{EventBus, TaskEvent};
use crate::libs::messages::Message;
use crate::libs::retry::RetryPolicy;
use crate::libs::task::{now_millis, Task, TaskFilter, TaskStatus, TaskUpdate};
use crate::{msg_debug, msg_error, msg_info, msg_warning};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Everything [`Storage::get_metrics`] reports.
#[derive(Debug, Clone, Serialize)]
pub struct StorageMetrics {
    pub database: DatabaseStats,
    pub cache: CacheStats,
    pub wal: WalMetrics,
    pub pool: PoolMetrics,
}

pub struct Storage {
    config: StorageConfig,
    pool: ConnectionPool,
    transactions: Arc<TransactionManager>,
    cache: TaskCache,
    events: EventBus,
    retry: RetryPolicy,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl Storage {
    pub fn new(
        config: StorageConfig,
        pool: ConnectionPool,
        transactions: Arc<TransactionManager>,
        cache: TaskCache,
        events: EventBus,
    ) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        Storage {
            config,
            pool,
            transactions,
            cache,
            events,
            retry,
            timers: Mutex::new(Vec::new()),
        }
    }

    /// Creates the schema if missing. The pool must already be initialized.
    pub async fn initialize(&self) -> Result<()> {
        self.with_connection("initialize schema", schema::init_schema).await?;
        msg_info!(Message::StorageReady(self.config.database_path().display().to_string()));
        Ok(())
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Borrows a connection, runs `op`, records its timing with the state
    /// manager and releases the connection. Transient failures are retried.
    async fn with_connection<T, F>(&self, context: &str, op: F) -> Result<T>
    where
        F: Fn(&Connection) -> Result<T> + Sync,
        T: Send,
    {
        let pool = &self.pool;
        let op = &op;
        self.retry
            .run(context, || async move {
                let conn = pool.get_connection().await?;
                let started = Instant::now();
                let result = op(&*conn);
                pool.states()
                    .record_query(conn.id(), started.elapsed(), counts_against_connection(&result));
                pool.release_connection(conn);
                result
            })
            .await
    }

    /// Opens a transaction on a freshly borrowed connection.
    pub async fn begin_transaction(&self) -> Result<StorageTransaction<'_>> {
        let conn = self.pool.get_connection().await?;
        let id = self.transactions.begin_transaction(&conn, conn.id())?;
        Ok(StorageTransaction {
            storage: self,
            conn,
            id,
            started: Instant::now(),
            events: Vec::new(),
            cache_actions: Vec::new(),
            finished: false,
        })
    }

    /// Runs `body` in one transaction: commit on `Ok`, rollback on `Err`.
    /// Transient failures re-run the body on a new transaction.
    pub async fn in_transaction<T, F>(&self, context: &str, body: F) -> Result<T>
    where
        F: Fn(&mut StorageTransaction<'_>) -> Result<T> + Sync,
        T: Send,
    {
        let body = &body;
        self.retry
            .run(context, || async move {
                let mut tx = self.begin_transaction().await?;
                match body(&mut tx) {
                    Ok(value) => {
                        tx.commit()?;
                        Ok(value)
                    }
                    Err(err) => {
                        let id = tx.id();
                        if let Err(rollback) = tx.rollback() {
                            msg_error!(Message::TransactionRollbackFailed {
                                id,
                                reason: rollback.to_string()
                            });
                        }
                        Err(err)
                    }
                }
            })
            .await
    }

    // Reads

    /// Cache-first lookup. Cached copies older than the TTL are re-read.
    pub async fn get_task(&self, path: &str) -> Result<Option<Task>> {
        if let Some(task) = self.cache.get(path) {
            return Ok(Some(task));
        }
        let task = self.with_connection("get task", |conn| tasks::select_task(conn, path)).await?;
        if let Some(task) = &task {
            self.cache.put_if_newer(task);
        }
        Ok(task)
    }

    pub async fn require_task(&self, path: &str) -> Result<Task> {
        self.get_task(path)
            .await?
            .ok_or_else(|| StorageError::TaskNotFound(path.to_string()))
    }

    pub async fn get_tasks(&self, paths: &[String]) -> Result<Vec<Task>> {
        self.fetch(TaskFilter::ByPaths(paths.to_vec())).await
    }

    /// `pattern` is a SQLite GLOB, e.g. `project/*`.
    pub async fn get_tasks_by_pattern(&self, pattern: &str) -> Result<Vec<Task>> {
        self.fetch(TaskFilter::ByPattern(pattern.to_string())).await
    }

    pub async fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.fetch(TaskFilter::ByStatus(status)).await
    }

    pub async fn get_subtasks(&self, parent_path: &str) -> Result<Vec<Task>> {
        self.fetch(TaskFilter::ByParent(parent_path.to_string())).await
    }

    /// Tasks whose dependency list contains `path`.
    pub async fn get_dependent_tasks(&self, path: &str) -> Result<Vec<Task>> {
        self.fetch(TaskFilter::DependentsOf(path.to_string())).await
    }

    pub async fn get_all_tasks(&self) -> Result<Vec<Task>> {
        self.fetch(TaskFilter::All).await
    }

    pub async fn fetch(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        let filter = &filter;
        let found = self.with_connection("fetch tasks", |conn| tasks::fetch(conn, filter)).await?;
        for task in &found {
            self.cache.put_if_newer(task);
        }
        Ok(found)
    }

    // Writes

    /// Inserts a new row. No hierarchy bookkeeping happens here.
    pub async fn create_task(&self, task: &Task) -> Result<Task> {
        self.in_transaction("create task", |tx| {
            tx.insert_task(task)?;
            Ok(task.clone())
        })
        .await
    }

    /// Applies `update` to the stored row, bumping its version.
    pub async fn update_task(&self, path: &str, update: &TaskUpdate) -> Result<Task> {
        self.in_transaction("update task", |tx| {
            let before = tx.require_task(path)?;
            let mut after = before.clone();
            update.apply_to(&mut after);
            after.touch();
            tx.replace_task(&before, &after)?;
            Ok(after)
        })
        .await
    }

    /// Deletes `path` and its whole subtree, detaching every deleted task
    /// from surviving parents and dependents. Returns the deleted tasks.
    pub async fn delete_task(&self, path: &str) -> Result<Vec<Task>> {
        self.in_transaction("delete task", |tx| tx.delete_task(path)).await
    }

    pub async fn save_task(&self, task: &Task) -> Result<()> {
        self.save_tasks(std::slice::from_ref(task)).await
    }

    /// Upserts every task in one transaction. Any failure rolls back all of them.
    pub async fn save_tasks(&self, batch: &[Task]) -> Result<()> {
        self.in_transaction("save tasks", |tx| {
            for task in batch {
                tx.save_task(task)?;
            }
            Ok(())
        })
        .await?;
        msg_debug!(Message::TasksSaved(batch.len()));
        Ok(())
    }

    pub async fn clear_all_tasks(&self) -> Result<usize> {
        let removed = self.with_connection("clear tasks", tasks::delete_all).await?;
        self.cache.clear();
        msg_warning!(Message::TasksCleared(removed));
        Ok(removed)
    }

    // Maintenance

    pub async fn vacuum(&self) -> Result<()> {
        self.with_connection("vacuum", maintenance::vacuum).await
    }

    pub async fn analyze(&self) -> Result<()> {
        self.with_connection("analyze", maintenance::analyze).await
    }

    pub async fn checkpoint(&self) -> Result<CheckpointResult> {
        let wal = self.pool.wal();
        self.with_connection("checkpoint", |conn| wal.checkpoint(conn)).await
    }

    pub async fn verify_integrity(&self) -> Result<IntegrityReport> {
        self.with_connection("integrity check", maintenance::integrity_check).await
    }

    /// Finds orphaned parents, dangling dependency and subtask references and
    /// dependency cycles. Unless `dry_run`, fixes them in one transaction.
    pub async fn repair_relationships(&self, dry_run: bool) -> Result<RepairReport> {
        let report = self
            .in_transaction("repair relationships", |tx| {
                let all = tx.fetch(&TaskFilter::All)?;
                let (mut report, repairs) = maintenance::plan_repairs(all);
                report.dry_run = dry_run;
                if !dry_run {
                    for (before, mut after) in repairs {
                        after.touch();
                        tx.replace_task(&before, &after)?;
                        report.repaired += 1;
                    }
                }
                Ok(report)
            })
            .await?;
        msg_info!(Message::RelationshipsRepaired {
            issues: report.issue_count(),
            dry_run,
        });
        Ok(report)
    }

    pub async fn get_metrics(&self) -> Result<StorageMetrics> {
        let database = self.with_connection("metrics", maintenance::collect_stats).await?;
        Ok(StorageMetrics {
            database,
            cache: self.cache.stats(),
            wal: self.pool.wal().metrics(),
            pool: self.pool.metrics(),
        })
    }

    /// Starts the periodic WAL checkpoint when an interval is configured.
    pub fn start_timers(&self) {
        let interval = self.config.performance.checkpoint_interval_ms;
        if interval == 0 {
            return;
        }
        let pool = self.pool.clone();
        let period = Duration::from_millis(interval);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if pool.is_closed() {
                    break;
                }
                match pool.get_connection().await {
                    Ok(conn) => {
                        if let Err(err) = pool.wal().checkpoint(&conn) {
                            msg_warning!(Message::CheckpointFailed(err.to_string()));
                        }
                    }
                    Err(err) => msg_warning!(Message::CheckpointFailed(err.to_string())),
                }
            }
        });
        self.timers.lock().push(handle);
    }

    /// Stops timers, forgets open transactions and closes the pool.
    pub fn close(&self) {
        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
        self.pool.close();
        let abandoned = self.transactions.abandon_all();
        if abandoned > 0 {
            msg_warning!(Message::TransactionsAbandoned(abandoned));
        }
        self.cache.clear();
    }
}

/// Application-level failures say nothing about the connection's health.
fn counts_against_connection<T>(result: &Result<T>) -> bool {
    match result {
        Ok(_) => false,
        Err(err) => !matches!(err.class(), ErrorClass::Application),
    }
}

enum CacheAction {
    Put(Task),
    Invalidate(String),
}

/// An open write transaction bound to one pooled connection.
///
/// Reads see the transaction's own uncommitted writes. Cache updates and
/// events are queued and applied only by [`StorageTransaction::commit`].
pub struct StorageTransaction<'s> {
    storage: &'s Storage,
    conn: PoolConnection,
    id: TransactionId,
    started: Instant,
    events: Vec<TaskEvent>,
    cache_actions: Vec<CacheAction>,
    finished: bool,
}

impl<'s> StorageTransaction<'s> {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Journal of the writes made so far.
    pub fn operations(&self) -> Vec<OperationLogEntry> {
        self.storage.transactions.operations(self.id)
    }

    pub fn get_task(&self, path: &str) -> Result<Option<Task>> {
        tasks::select_task(&self.conn, path)
    }

    pub fn require_task(&self, path: &str) -> Result<Task> {
        self.get_task(path)?
            .ok_or_else(|| StorageError::TaskNotFound(path.to_string()))
    }

    pub fn fetch(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        tasks::fetch(&self.conn, filter)
    }

    pub fn get_subtasks(&self, parent_path: &str) -> Result<Vec<Task>> {
        self.fetch(&TaskFilter::ByParent(parent_path.to_string()))
    }

    pub fn get_dependent_tasks(&self, path: &str) -> Result<Vec<Task>> {
        self.fetch(&TaskFilter::DependentsOf(path.to_string()))
    }

    pub fn insert_task(&mut self, task: &Task) -> Result<()> {
        tasks::insert_task(&self.conn, task)?;
        self.journal(OperationKind::Create, &task.path, None, Some(task.clone()));
        self.events.push(TaskEvent::Created { task: task.clone() });
        self.cache_actions.push(CacheAction::Put(task.clone()));
        Ok(())
    }

    /// Writes `after` over the stored row previously read as `before`.
    /// Callers bump the version before calling.
    pub fn replace_task(&mut self, before: &Task, after: &Task) -> Result<()> {
        if !tasks::update_task(&self.conn, after)? {
            return Err(StorageError::TaskNotFound(after.path.clone()));
        }
        self.journal(OperationKind::Update, &after.path, Some(before.clone()), Some(after.clone()));
        if before.status != after.status {
            self.events.push(TaskEvent::StatusChanged {
                path: after.path.clone(),
                from: before.status,
                to: after.status,
            });
        }
        self.events.push(TaskEvent::Updated { task: after.clone() });
        self.cache_actions.push(CacheAction::Put(after.clone()));
        Ok(())
    }

    /// Inserts or fully replaces `task` as given.
    pub fn save_task(&mut self, task: &Task) -> Result<()> {
        let before = self.get_task(&task.path)?;
        tasks::upsert_task(&self.conn, task)?;
        let kind = if before.is_some() {
            OperationKind::Update
        } else {
            OperationKind::Create
        };
        let event = match before {
            Some(_) => TaskEvent::Updated { task: task.clone() },
            None => TaskEvent::Created { task: task.clone() },
        };
        self.journal(kind, &task.path, before, Some(task.clone()));
        self.events.push(event);
        self.cache_actions.push(CacheAction::Put(task.clone()));
        Ok(())
    }

    /// Deletes `path` with all of its descendants.
    ///
    /// Surviving parents lose the deleted paths from their `subtasks` and
    /// surviving dependents lose them from their `dependencies`; each such
    /// task gets a version bump. A dependent blocked by a deleted task is
    /// re-blocked by another failed or blocked dependency, or returns to
    /// `PENDING` when none is left. Returns the deleted tasks, root first.
    pub fn delete_task(&mut self, path: &str) -> Result<Vec<Task>> {
        let root = self.require_task(path)?;
        let doomed = self.collect_subtree(&root)?;
        let doomed_paths: HashSet<String> = doomed.iter().map(|t| t.path.clone()).collect();

        for task in &doomed {
            if let Some(parent_path) = &task.parent_path {
                if !doomed_paths.contains(parent_path) {
                    if let Some(parent) = self.get_task(parent_path)? {
                        let mut detached = parent.clone();
                        detached.subtasks.retain(|p| p != &task.path);
                        if detached.subtasks != parent.subtasks {
                            detached.touch();
                            self.replace_task(&parent, &detached)?;
                        }
                    }
                }
            }
            for dependent in self.get_dependent_tasks(&task.path)? {
                if doomed_paths.contains(&dependent.path) {
                    continue;
                }
                let mut detached = dependent.clone();
                detached.dependencies.retain(|p| p != &task.path);
                if detached.metadata.blocked_by.as_deref() == Some(task.path.as_str()) {
                    self.release_block(&mut detached, &doomed_paths)?;
                }
                detached.touch();
                self.replace_task(&dependent, &detached)?;
            }
        }

        for task in &doomed {
            tasks::delete_task(&self.conn, &task.path)?;
            self.journal(OperationKind::Delete, &task.path, Some(task.clone()), None);
            self.events.push(TaskEvent::Deleted { task: task.clone() });
            self.cache_actions.push(CacheAction::Invalidate(task.path.clone()));
        }
        Ok(doomed)
    }

    fn release_block(&self, task: &mut Task, doomed: &HashSet<String>) -> Result<()> {
        for path in task.dependencies.iter().filter(|p| !doomed.contains(*p)) {
            let Some(dependency) = self.get_task(path)? else { continue };
            if matches!(dependency.status, TaskStatus::Failed | TaskStatus::Blocked) {
                task.metadata.blocked_by = Some(dependency.path.clone());
                task.metadata.blocked_at = Some(now_millis());
                task.metadata.block_reason = (dependency.status == TaskStatus::Failed)
                    .then(|| format!("dependency '{}' failed", dependency.path));
                return Ok(());
            }
        }
        task.metadata.clear_block();
        if task.status == TaskStatus::Blocked {
            task.status = TaskStatus::Pending;
            task.metadata.unblocked_at = Some(now_millis());
        }
        Ok(())
    }

    fn collect_subtree(&self, root: &Task) -> Result<Vec<Task>> {
        let mut seen = BTreeSet::from([root.path.clone()]);
        let mut queue = VecDeque::from([root.clone()]);
        let mut subtree = Vec::new();
        while let Some(task) = queue.pop_front() {
            let mut children: Vec<Task> = self.get_subtasks(&task.path)?;
            for listed in &task.subtasks {
                if !children.iter().any(|c| &c.path == listed) {
                    if let Some(child) = self.get_task(listed)? {
                        children.push(child);
                    }
                }
            }
            for child in children {
                if seen.insert(child.path.clone()) {
                    queue.push_back(child);
                }
            }
            subtree.push(task);
        }
        Ok(subtree)
    }

    fn journal(&self, kind: OperationKind, path: &str, before: Option<Task>, after: Option<Task>) {
        self.storage
            .transactions
            .record_operation(self.id, kind, path, before, after);
    }

    /// Commits, then applies queued cache updates and publishes events.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let outcome = self.storage.transactions.commit_transaction(&self.conn, self.id);
        self.storage
            .pool
            .states()
            .record_query(self.conn.id(), self.started.elapsed(), counts_against_connection(&outcome));
        outcome?;

        for action in self.cache_actions.drain(..) {
            match action {
                CacheAction::Put(task) => self.storage.cache.put(&task),
                CacheAction::Invalidate(path) => self.storage.cache.invalidate(&path),
            }
        }
        self.storage.events.publish_all(self.events.drain(..));
        Ok(())
    }

    /// Discards every write made in this transaction.
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.events.clear();
        self.cache_actions.clear();
        self.storage.transactions.rollback_transaction(&self.conn, self.id)
    }
}

impl Drop for StorageTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.storage.transactions.rollback_transaction(&self.conn, self.id) {
            msg_error!(Message::TransactionRollbackFailed {
                id: self.id,
                reason: err.to_string()
            });
        }
    }
}
