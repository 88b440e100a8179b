//! # Taskvault - embedded task storage with a hierarchy engine
//!
//! Stores hierarchical tasks in a single SQLite file and keeps their
//! relationships consistent.
//!
//! ## Features
//!
//! - **Connection Pool**: At most five WAL-mode connections with health tracking
//! - **Transactions**: Explicit boundaries with an operation log per transaction
//! - **Task Cache**: TTL-bound reads capped by entry count and memory
//! - **Hierarchy Engine**: Status cascades to parents and dependents, cycle-free dependencies
//! - **Maintenance**: Vacuum, analyze, checkpoints, integrity checks and relationship repair
//!
//! ## Usage
//!
//! ```rust,no_run
//! use taskvault::context::AppContext;
//! use taskvault::libs::config::StorageConfig;
//! use taskvault::libs::task::{CreateTaskInput, TaskStatus, TaskUpdate};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     taskvault::libs::logging::try_init();
//!     let ctx = AppContext::initialize(StorageConfig::in_dir("./data")).await?;
//!     let ops = ctx.operations();
//!     ops.create_task(&CreateTaskInput::new("release", "Ship it")).await?;
//!     ops.update_task("release", &TaskUpdate::status(TaskStatus::InProgress)).await?;
//!     ctx.shutdown();
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod db;
pub mod libs;
pub mod ops;
