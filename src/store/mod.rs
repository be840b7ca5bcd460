//! Durable task storage.
//!
//! The store is the only channel between the ingress side and the
//! background processor; the two never share memory. All status
//! transitions go through it, and the queued->processing transition is
//! atomic: a task claimed by one caller is never handed to another.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::task::{NewTask, Task, TaskPriority, TaskStatus, TaskUpdate};
use crate::Result;

pub mod sqlite;

pub use sqlite::SqliteTaskStore;

/// Filter for [`TaskStore::query`]. Unset fields do not constrain.
#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub language: Option<String>,
    pub engine_name: Option<String>,
    /// Only tasks with (`true`) or without (`false`) a stored result.
    pub has_result: Option<bool>,
    /// Only tasks with (`true`) or without (`false`) an error message.
    pub has_error: Option<bool>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            priority: None,
            created_after: None,
            created_before: None,
            language: None,
            engine_name: None,
            has_result: None,
            has_error: None,
            limit: 20,
            offset: 0,
        }
    }
}

/// One page of query results.
#[derive(Debug, Clone)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total_count: i64,
    pub has_more: bool,
    pub next_offset: Option<i64>,
}

/// Persistent, concurrency-safe storage of [`Task`] records.
///
/// Every mutation refreshes `updated_at` and is applied atomically;
/// partially-applied updates are forbidden.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task with status `Queued`; returns the assigned id.
    async fn create(&self, task: NewTask) -> Result<i64>;

    /// Point lookup.
    async fn get(&self, id: i64) -> Result<Option<Task>>;

    /// Atomically claim up to `n` queued tasks, flipping each to
    /// `Processing`.
    ///
    /// Tasks come back in claim order: priority high->low, then earliest
    /// `created_at`, then lowest id. A task returned to one caller is never
    /// returned to any other caller.
    async fn claim_queued(&self, n: usize) -> Result<Vec<Task>>;

    /// Apply a partial update; returns `false` when the row is missing.
    async fn update(&self, id: i64, update: TaskUpdate) -> Result<bool>;

    /// Remove the row if present.
    async fn delete(&self, id: i64) -> Result<bool>;

    /// Filtered, paginated listing.
    async fn query(&self, filter: &TaskFilter) -> Result<TaskPage>;

    /// Record the outcome of a callback attempt.
    async fn record_callback(
        &self,
        id: i64,
        status_code: Option<i32>,
        message: &str,
        time: DateTime<Utc>,
    ) -> Result<()>;
}
