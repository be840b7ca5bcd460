//! SQLite task store backend.
//!
//! Single-table layout: every [`Task`] field lives in one `tasks` row, with
//! `decode_options`, `result` and the info tree stored as JSON text. The
//! queued->processing claim is a single conditional `UPDATE … RETURNING`
//! statement, so SQLite's writer serialization gives the atomicity the
//! store contract requires.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use log::{debug, info, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::config::StoreConfig;
use crate::core::task::{
    DecodeOptions, NewTask, Task, TaskPriority, TaskStatus, TaskUpdate, TranscriptionResult,
};
use crate::error::WhisperdError;
use crate::store::{TaskFilter, TaskPage, TaskStore};
use crate::Result;

/// Initial reconnect backoff; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
/// Backoff ceiling.
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// SQLite-backed [`TaskStore`] implementation.
pub struct SqliteTaskStore {
    pool: SqlitePool,
    retry_attempts: u32,
}

impl SqliteTaskStore {
    /// Connect and migrate, retrying transient connection failures with
    /// bounded exponential backoff before surfacing a fatal error.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let mut delay = RETRY_BASE_DELAY;
        let attempts = config.connect_retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match Self::try_connect(config).await {
                Ok(store) => {
                    info!(
                        "task store connected at {:?}",
                        config.database_path
                    );
                    return Ok(store);
                }
                Err(e) => {
                    warn!(
                        "task store connection attempt {}/{} failed: {}",
                        attempt, attempts, e
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(RETRY_MAX_DELAY);
                    }
                }
            }
        }
        Err(WhisperdError::store(format!(
            "could not connect to task store after {} attempts: {}",
            attempts,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string())
        )))
    }

    async fn try_connect(config: &StoreConfig) -> std::result::Result<Self, sqlx::Error> {
        let db_path = config.database_path.to_string_lossy();
        let pool = if db_path == ":memory:" {
            // A named in-memory database with shared cache so every pool
            // connection sees the same instance.
            let uri = format!(
                "file:whisperd-{}?mode=memory&cache=shared",
                uuid::Uuid::new_v4().simple()
            );
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .connect(&uri)
                .await?
        } else {
            if let Some(parent) = config.database_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        sqlx::Error::Io(std::io::Error::other(format!(
                            "failed to create database directory: {}",
                            e
                        )))
                    })?;
                }
            }
            let options = SqliteConnectOptions::new()
                .filename(&config.database_path)
                .create_if_missing(true)
                .busy_timeout(Duration::from_secs(config.busy_timeout_seconds));
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .connect_with(options)
                .await?
        };

        let store = Self {
            pool,
            retry_attempts: config.connect_retry_attempts.max(1),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> std::result::Result<(), sqlx::Error> {
        debug!("running task store migrations");
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status TEXT NOT NULL DEFAULT 'queued',
                priority INTEGER NOT NULL DEFAULT 1,
                engine_name TEXT,
                task_type TEXT NOT NULL DEFAULT 'transcribe',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                task_processing_time REAL,
                file_path TEXT,
                file_url TEXT,
                file_name TEXT,
                file_size_bytes INTEGER,
                file_duration REAL,
                platform TEXT,
                decode_options TEXT NOT NULL DEFAULT '{}',
                language TEXT,
                result TEXT,
                error_message TEXT,
                output_url TEXT,
                callback_url TEXT,
                callback_status_code INTEGER,
                callback_message TEXT,
                callback_time TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_claim \
             ON tasks (status, priority, created_at, id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks (created_at)")
            .execute(&self.pool)
            .await?;

        debug!("task store migrations completed");
        Ok(())
    }

    /// Run an operation, retrying transient transport failures with
    /// exponential backoff; non-transient errors surface immediately.
    async fn with_retry<'a, T>(
        &'a self,
        op: impl Fn() -> BoxFuture<'a, std::result::Result<T, sqlx::Error>>,
    ) -> Result<T> {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt < self.retry_attempts => {
                    warn!(
                        "transient task store error (attempt {}/{}): {}",
                        attempt, self.retry_attempts, e
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_MAX_DELAY);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            let message = db.message().to_ascii_lowercase();
            message.contains("locked") || message.contains("busy")
        }
        _ => false,
    }
}

fn fmt_time(time: DateTime<Utc>) -> String {
    // Fixed-width UTC timestamps so lexicographic ordering matches
    // chronological ordering.
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(value: &str) -> std::result::Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(format!("invalid timestamp '{}': {}", value, e).into()))
}

fn row_to_task(row: &SqliteRow) -> std::result::Result<Task, sqlx::Error> {
    let status_str: String = row.get("status");
    let status = TaskStatus::from_str(&status_str)
        .map_err(|e| sqlx::Error::Decode(e.to_string().into()))?;
    let priority = TaskPriority::from_rank(row.get::<i64, _>("priority"))
        .map_err(|e| sqlx::Error::Decode(e.to_string().into()))?;
    let task_type_str: String = row.get("task_type");
    let task_type = task_type_str
        .parse()
        .map_err(|e: WhisperdError| sqlx::Error::Decode(e.to_string().into()))?;

    let decode_options: DecodeOptions =
        serde_json::from_str(&row.get::<String, _>("decode_options"))
            .map_err(|e| sqlx::Error::Decode(e.to_string().into()))?;
    let result: Option<TranscriptionResult> = match row.get::<Option<String>, _>("result") {
        Some(raw) => Some(
            serde_json::from_str(&raw).map_err(|e| sqlx::Error::Decode(e.to_string().into()))?,
        ),
        None => None,
    };

    let created_at = parse_time(&row.get::<String, _>("created_at"))?;
    let updated_at = parse_time(&row.get::<String, _>("updated_at"))?;
    let callback_time = match row.get::<Option<String>, _>("callback_time") {
        Some(raw) => Some(parse_time(&raw)?),
        None => None,
    };

    Ok(Task {
        id: row.get("id"),
        status,
        priority,
        engine_name: row.get("engine_name"),
        task_type,
        created_at,
        updated_at,
        task_processing_time: row.get("task_processing_time"),
        file_path: row
            .get::<Option<String>, _>("file_path")
            .map(PathBuf::from),
        file_url: row.get("file_url"),
        file_name: row.get("file_name"),
        file_size_bytes: row.get("file_size_bytes"),
        file_duration: row.get("file_duration"),
        platform: row.get("platform"),
        decode_options,
        language: row.get("language"),
        result,
        error_message: row.get("error_message"),
        output_url: row.get("output_url"),
        callback_url: row.get("callback_url"),
        callback_status_code: row.get("callback_status_code"),
        callback_message: row.get("callback_message"),
        callback_time,
    })
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &TaskFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(priority) = filter.priority {
        qb.push(" AND priority = ").push_bind(priority.rank());
    }
    if let Some(after) = filter.created_after {
        qb.push(" AND created_at >= ").push_bind(fmt_time(after));
    }
    if let Some(before) = filter.created_before {
        qb.push(" AND created_at <= ").push_bind(fmt_time(before));
    }
    if let Some(language) = &filter.language {
        qb.push(" AND language = ").push_bind(language.clone());
    }
    if let Some(engine) = &filter.engine_name {
        qb.push(" AND engine_name = ").push_bind(engine.clone());
    }
    if let Some(has_result) = filter.has_result {
        qb.push(if has_result {
            " AND result IS NOT NULL"
        } else {
            " AND result IS NULL"
        });
    }
    if let Some(has_error) = filter.has_error {
        qb.push(if has_error {
            " AND error_message IS NOT NULL"
        } else {
            " AND error_message IS NULL"
        });
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, task: NewTask) -> Result<i64> {
        let now = fmt_time(Utc::now());
        let decode_options = serde_json::to_string(&task.decode_options)?;
        let file_path = task
            .file_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string());

        let id = self
            .with_retry(|| {
                let now = now.clone();
                let decode_options = decode_options.clone();
                let file_path = file_path.clone();
                let task = task.clone();
                Box::pin(async move {
                    sqlx::query_scalar::<_, i64>(
                        r#"
                        INSERT INTO tasks (
                            status, priority, task_type, created_at, updated_at,
                            file_path, file_url, file_name, file_size_bytes,
                            file_duration, platform, decode_options, language,
                            callback_url
                        )
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                        RETURNING id
                        "#,
                    )
                    .bind(TaskStatus::Queued.as_str())
                    .bind(task.priority.rank())
                    .bind(task.task_type.as_str())
                    .bind(&now)
                    .bind(&now)
                    .bind(&file_path)
                    .bind(&task.file_url)
                    .bind(&task.file_name)
                    .bind(task.file_size_bytes)
                    .bind(task.file_duration)
                    .bind(&task.platform)
                    .bind(&decode_options)
                    .bind(&task.language)
                    .bind(&task.callback_url)
                    .fetch_one(&self.pool)
                    .await
                })
            })
            .await?;
        debug!("task {} created (queued)", id);
        Ok(id)
    }

    async fn get(&self, id: i64) -> Result<Option<Task>> {
        let row = self
            .with_retry(|| {
                Box::pin(async move {
                    sqlx::query("SELECT * FROM tasks WHERE id = ?")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await
                })
            })
            .await?;
        match row {
            Some(row) => Ok(Some(row_to_task(&row).map_err(WhisperdError::from)?)),
            None => Ok(None),
        }
    }

    async fn claim_queued(&self, n: usize) -> Result<Vec<Task>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let now = fmt_time(Utc::now());
        let limit = n as i64;

        let rows = self
            .with_retry(|| {
                let now = now.clone();
                Box::pin(async move {
                    sqlx::query(
                        r#"
                        UPDATE tasks
                        SET status = 'processing', updated_at = ?
                        WHERE status = 'queued' AND id IN (
                            SELECT id FROM tasks
                            WHERE status = 'queued'
                            ORDER BY priority DESC, created_at ASC, id ASC
                            LIMIT ?
                        )
                        RETURNING *
                        "#,
                    )
                    .bind(&now)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
                })
            })
            .await?;

        let mut tasks = rows
            .iter()
            .map(row_to_task)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(WhisperdError::from)?;
        // RETURNING does not promise an ordering; restore claim order.
        tasks.sort_by(|a, b| {
            b.priority
                .rank()
                .cmp(&a.priority.rank())
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        if !tasks.is_empty() {
            debug!(
                "claimed {} task(s): {:?}",
                tasks.len(),
                tasks.iter().map(|t| t.id).collect::<Vec<_>>()
            );
        }
        Ok(tasks)
    }

    async fn update(&self, id: i64, update: TaskUpdate) -> Result<bool> {
        let now = fmt_time(Utc::now());
        let result_json = match &update.result {
            Some(result) => Some(serde_json::to_string(result)?),
            None => None,
        };

        let rows_affected = self
            .with_retry(|| {
                let now = now.clone();
                let update = update.clone();
                let result_json = result_json.clone();
                Box::pin(async move {
                    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE tasks SET updated_at = ");
                    qb.push_bind(now);
                    if let Some(status) = update.status {
                        qb.push(", status = ").push_bind(status.as_str());
                    }
                    if let Some(engine_name) = &update.engine_name {
                        qb.push(", engine_name = ").push_bind(engine_name.clone());
                    }
                    if let Some(language) = &update.language {
                        qb.push(", language = ").push_bind(language.clone());
                    }
                    if let Some(result_json) = &result_json {
                        qb.push(", result = ").push_bind(result_json.clone());
                    }
                    if let Some(error_message) = &update.error_message {
                        qb.push(", error_message = ")
                            .push_bind(error_message.clone());
                    }
                    if let Some(file_path) = &update.file_path {
                        qb.push(", file_path = ")
                            .push_bind(file_path.to_string_lossy().to_string());
                    }
                    if let Some(file_name) = &update.file_name {
                        qb.push(", file_name = ").push_bind(file_name.clone());
                    }
                    if let Some(file_size_bytes) = update.file_size_bytes {
                        qb.push(", file_size_bytes = ").push_bind(file_size_bytes);
                    }
                    if let Some(file_duration) = update.file_duration {
                        qb.push(", file_duration = ").push_bind(file_duration);
                    }
                    if let Some(processing_time) = update.task_processing_time {
                        qb.push(", task_processing_time = ")
                            .push_bind(processing_time);
                    }
                    if let Some(output_url) = &update.output_url {
                        qb.push(", output_url = ").push_bind(output_url.clone());
                    }
                    qb.push(" WHERE id = ").push_bind(id);
                    let result = qb.build().execute(&self.pool).await?;
                    Ok(result.rows_affected())
                })
            })
            .await?;
        Ok(rows_affected > 0)
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        let rows_affected = self
            .with_retry(|| {
                Box::pin(async move {
                    let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
                        .bind(id)
                        .execute(&self.pool)
                        .await?;
                    Ok(result.rows_affected())
                })
            })
            .await?;
        Ok(rows_affected > 0)
    }

    async fn query(&self, filter: &TaskFilter) -> Result<TaskPage> {
        let limit = filter.limit.max(0);
        let offset = filter.offset.max(0);

        let total_count = self
            .with_retry(|| {
                Box::pin(async move {
                    let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM tasks");
                    push_filters(&mut qb, filter);
                    qb.build_query_scalar::<i64>().fetch_one(&self.pool).await
                })
            })
            .await?;

        let rows = self
            .with_retry(|| {
                Box::pin(async move {
                    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM tasks");
                    push_filters(&mut qb, filter);
                    qb.push(" ORDER BY created_at DESC, id DESC");
                    qb.push(" LIMIT ").push_bind(limit);
                    qb.push(" OFFSET ").push_bind(offset);
                    qb.build().fetch_all(&self.pool).await
                })
            })
            .await?;

        let tasks = rows
            .iter()
            .map(row_to_task)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(WhisperdError::from)?;

        let has_more = offset + limit < total_count;
        Ok(TaskPage {
            tasks,
            total_count,
            has_more,
            next_offset: has_more.then_some(offset + limit),
        })
    }

    async fn record_callback(
        &self,
        id: i64,
        status_code: Option<i32>,
        message: &str,
        time: DateTime<Utc>,
    ) -> Result<()> {
        let now = fmt_time(Utc::now());
        let time_str = fmt_time(time);
        let message = message.to_string();
        self.with_retry(|| {
            let now = now.clone();
            let time_str = time_str.clone();
            let message = message.clone();
            Box::pin(async move {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET callback_status_code = ?, callback_message = ?,
                        callback_time = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(status_code)
                .bind(&message)
                .bind(&time_str)
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await?;
                Ok(())
            })
        })
        .await
    }
}
