/// SQLite-backed implementation of the DispatchStore trait
/// Timestamps are stored as milliseconds since the epoch; list-valued columns as JSON text.

use crate::errors::{DaemonError, DaemonResult};
use crate::model::{
    from_millis, to_millis, CaseResult, Environment, ExecutionLog, SuiteDefinition, SuiteStatus,
    Task,
};
use crate::store::DispatchStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use testmesh_core::{CaseOutcome, SystemSnapshot, TaskStatus};

const TASK_COLUMNS: &str = "execution_id, environment_id, suite_id, requester_id, status, \
     priority, created_at, started_at, completed_at, expected_case_ids, error";

/// SQLite-backed dispatch store
pub struct SqliteStore {
    /// Connection pool to SQLite database
    pool: SqlitePool,

    /// Path to the SQLite database file
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path`
    pub async fn new(db_path: impl AsRef<Path>) -> DaemonResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let connect_options = SqliteConnectOptions::from_str(db_path.to_string_lossy().as_ref())
            .map_err(|e| DaemonError::StorageError(format!("Failed to parse database path: {}", e)))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        // Single writer: every compare-and-set runs on the same connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .map_err(|e| {
                DaemonError::StorageError(format!("Failed to create database pool: {}", e))
            })?;

        Ok(SqliteStore { pool, db_path })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Initialize the database schema
    pub async fn initialize(&self) -> DaemonResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS environments (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                token TEXT NOT NULL,
                max_concurrent_tasks INTEGER,
                work_dir TEXT,
                online INTEGER NOT NULL DEFAULT 0,
                last_heartbeat INTEGER,
                last_snapshot TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_environments_token ON environments(token);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            DaemonError::StorageError(format!("Failed to create environments table: {}", e))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS suites (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                plan_id TEXT,
                environment_id TEXT NOT NULL,
                execution_command TEXT NOT NULL,
                cases TEXT NOT NULL DEFAULT '[]',
                git TEXT,
                status TEXT NOT NULL DEFAULT 'idle',
                last_execution_id TEXT,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DaemonError::StorageError(format!("Failed to create suites table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                execution_id TEXT PRIMARY KEY NOT NULL,
                environment_id TEXT NOT NULL,
                suite_id TEXT NOT NULL,
                requester_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                expected_case_ids TEXT NOT NULL DEFAULT '[]',
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_env_status ON tasks(environment_id, status);
            CREATE INDEX IF NOT EXISTS idx_tasks_suite ON tasks(suite_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DaemonError::StorageError(format!("Failed to create tasks table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_logs (
                execution_id TEXT PRIMARY KEY NOT NULL,
                suite_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                finished_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_execution_logs_suite ON execution_logs(suite_id);

            CREATE TABLE IF NOT EXISTS case_results (
                execution_id TEXT NOT NULL,
                suite_id TEXT NOT NULL,
                case_id TEXT NOT NULL,
                outcome TEXT NOT NULL,
                duration_secs REAL NOT NULL DEFAULT 0,
                log_output TEXT,
                error_message TEXT,
                executor_id TEXT,
                recorded_at INTEGER NOT NULL,
                PRIMARY KEY (execution_id, case_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            DaemonError::StorageError(format!("Failed to create log/result tables: {}", e))
        })?;

        Ok(())
    }

    /// Close the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn storage_err(context: &str, e: impl std::fmt::Display) -> DaemonError {
    DaemonError::StorageError(format!("{}: {}", context, e))
}

fn opt_millis(value: Option<i64>) -> Option<DateTime<Utc>> {
    value.map(from_millis)
}

fn environment_from_row(row: &SqliteRow) -> DaemonResult<Environment> {
    let snapshot: Option<String> = row.try_get("last_snapshot")?;
    let max_concurrent: Option<i64> = row.try_get("max_concurrent_tasks")?;
    Ok(Environment {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        token: row.try_get("token")?,
        max_concurrent_tasks: max_concurrent.map(|v| v.max(0) as u32),
        work_dir: row.try_get("work_dir")?,
        online: row.try_get::<i64, _>("online")? != 0,
        last_heartbeat: opt_millis(row.try_get("last_heartbeat")?),
        last_snapshot: match snapshot {
            Some(json) => Some(serde_json::from_str::<SystemSnapshot>(&json)?),
            None => None,
        },
    })
}

fn suite_from_row(row: &SqliteRow) -> DaemonResult<SuiteDefinition> {
    let cases: String = row.try_get("cases")?;
    let git: Option<String> = row.try_get("git")?;
    let status: String = row.try_get("status")?;
    Ok(SuiteDefinition {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        plan_id: row.try_get("plan_id")?,
        environment_id: row.try_get("environment_id")?,
        execution_command: row.try_get("execution_command")?,
        cases: serde_json::from_str(&cases)?,
        git: match git {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        },
        status: SuiteStatus::from_str(&status).map_err(|e| storage_err("suite status", e))?,
        last_execution_id: row.try_get("last_execution_id")?,
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

fn task_from_row(row: &SqliteRow) -> DaemonResult<Task> {
    let status: String = row.try_get("status")?;
    let expected: String = row.try_get("expected_case_ids")?;
    Ok(Task {
        execution_id: row.try_get("execution_id")?,
        environment_id: row.try_get("environment_id")?,
        suite_id: row.try_get("suite_id")?,
        requester_id: row.try_get("requester_id")?,
        status: TaskStatus::from_str(&status).map_err(|e| storage_err("task status", e))?,
        priority: row.try_get::<i64, _>("priority")? as i32,
        created_at: from_millis(row.try_get("created_at")?),
        started_at: opt_millis(row.try_get("started_at")?),
        completed_at: opt_millis(row.try_get("completed_at")?),
        expected_case_ids: serde_json::from_str(&expected)?,
        error: row.try_get("error")?,
    })
}

fn log_from_row(row: &SqliteRow) -> DaemonResult<ExecutionLog> {
    Ok(ExecutionLog {
        execution_id: row.try_get("execution_id")?,
        suite_id: row.try_get("suite_id")?,
        sequence: row.try_get::<i64, _>("sequence")? as u64,
        message: row.try_get("message")?,
        created_at: from_millis(row.try_get("created_at")?),
        finished_at: opt_millis(row.try_get("finished_at")?),
    })
}

fn result_from_row(row: &SqliteRow) -> DaemonResult<CaseResult> {
    let outcome: String = row.try_get("outcome")?;
    Ok(CaseResult {
        execution_id: row.try_get("execution_id")?,
        suite_id: row.try_get("suite_id")?,
        case_id: row.try_get("case_id")?,
        outcome: CaseOutcome::from_str(&outcome).map_err(|e| storage_err("case outcome", e))?,
        duration_secs: row.try_get("duration_secs")?,
        log_output: row.try_get("log_output")?,
        error_message: row.try_get("error_message")?,
        executor_id: row.try_get("executor_id")?,
        recorded_at: from_millis(row.try_get("recorded_at")?),
    })
}

fn status_placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

#[async_trait]
impl DispatchStore for SqliteStore {
    async fn upsert_environment(&self, env: Environment) -> DaemonResult<()> {
        let snapshot = match &env.last_snapshot {
            Some(s) => Some(serde_json::to_string(s)?),
            None => None,
        };
        sqlx::query(
            r#"
            INSERT INTO environments
                (id, name, token, max_concurrent_tasks, work_dir, online, last_heartbeat, last_snapshot)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                token = excluded.token,
                max_concurrent_tasks = excluded.max_concurrent_tasks,
                work_dir = excluded.work_dir
            "#,
        )
        .bind(&env.id)
        .bind(&env.name)
        .bind(&env.token)
        .bind(env.max_concurrent_tasks.map(i64::from))
        .bind(&env.work_dir)
        .bind(env.online)
        .bind(env.last_heartbeat.map(to_millis))
        .bind(snapshot)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_err("Failed to upsert environment", e))?;
        Ok(())
    }

    async fn get_environment(&self, id: &str) -> DaemonResult<Option<Environment>> {
        let row = sqlx::query("SELECT * FROM environments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(environment_from_row).transpose()
    }

    async fn find_environment_by_token(&self, token: &str) -> DaemonResult<Option<Environment>> {
        let row = sqlx::query("SELECT * FROM environments WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(environment_from_row).transpose()
    }

    async fn list_environments(&self) -> DaemonResult<Vec<Environment>> {
        let rows = sqlx::query("SELECT * FROM environments ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(environment_from_row).collect()
    }

    async fn set_environment_online(&self, id: &str, online: bool) -> DaemonResult<()> {
        let result = sqlx::query("UPDATE environments SET online = ? WHERE id = ?")
            .bind(online)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DaemonError::EnvironmentNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn set_environment_token(&self, id: &str, token: &str) -> DaemonResult<()> {
        let result = sqlx::query("UPDATE environments SET token = ? WHERE id = ?")
            .bind(token)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DaemonError::EnvironmentNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn record_heartbeat(&self, id: &str, snapshot: &SystemSnapshot) -> DaemonResult<()> {
        let json = serde_json::to_string(snapshot)?;
        sqlx::query("UPDATE environments SET last_heartbeat = ?, last_snapshot = ? WHERE id = ?")
            .bind(to_millis(Utc::now()))
            .bind(json)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_task(&self, task: Task) -> DaemonResult<()> {
        let expected = serde_json::to_string(&task.expected_case_ids)?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO tasks
                (execution_id, environment_id, suite_id, requester_id, status, priority,
                 created_at, started_at, completed_at, expected_case_ids, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.execution_id)
        .bind(&task.environment_id)
        .bind(&task.suite_id)
        .bind(&task.requester_id)
        .bind(task.status.as_str())
        .bind(i64::from(task.priority))
        .bind(to_millis(task.created_at))
        .bind(task.started_at.map(to_millis))
        .bind(task.completed_at.map(to_millis))
        .bind(expected)
        .bind(&task.error)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_err("Failed to insert task", e))?;

        if result.rows_affected() == 0 {
            return Err(DaemonError::InvalidRequest(format!(
                "Execution id already exists: {}",
                task.execution_id
            )));
        }
        Ok(())
    }

    async fn get_task(&self, execution_id: &str) -> DaemonResult<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE execution_id = ?", TASK_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn transition_task(
        &self,
        execution_id: &str,
        from: &[TaskStatus],
        to: TaskStatus,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> DaemonResult<bool> {
        if from.is_empty() {
            return Ok(false);
        }

        let sql = format!(
            r#"
            UPDATE tasks SET
                status = ?,
                started_at = CASE WHEN ? THEN ? ELSE started_at END,
                completed_at = CASE WHEN ? THEN ? ELSE completed_at END,
                error = COALESCE(?, error)
            WHERE execution_id = ? AND status IN ({})
            "#,
            status_placeholders(from.len())
        );

        let at_ms = to_millis(at);
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(to == TaskStatus::Running)
            .bind(at_ms)
            .bind(to.is_terminal())
            .bind(at_ms)
            .bind(error)
            .bind(execution_id);
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| storage_err("Failed to update task", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_tasks(&self, environment_id: &str, status: TaskStatus) -> DaemonResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE environment_id = ? AND status = ?",
        )
        .bind(environment_id)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }

    async fn next_pending(&self, environment_id: &str) -> DaemonResult<Option<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE environment_id = ? AND status = 'pending' \
             ORDER BY priority DESC, created_at ASC, rowid ASC LIMIT 1",
            TASK_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(environment_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn tasks_for_suite(&self, suite_id: &str) -> DaemonResult<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE suite_id = ? ORDER BY created_at ASC, rowid ASC",
            TASK_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(suite_id).fetch_all(&self.pool).await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn tasks_for_environment(
        &self,
        environment_id: &str,
        statuses: &[TaskStatus],
    ) -> DaemonResult<Vec<Task>> {
        let filter = if statuses.is_empty() {
            String::new()
        } else {
            format!(" AND status IN ({})", status_placeholders(statuses.len()))
        };
        let sql = format!(
            "SELECT {} FROM tasks WHERE environment_id = ?{} ORDER BY created_at ASC, rowid ASC",
            TASK_COLUMNS, filter
        );

        let mut query = sqlx::query(&sql).bind(environment_id);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn upsert_suite(&self, suite: SuiteDefinition) -> DaemonResult<()> {
        let cases = serde_json::to_string(&suite.cases)?;
        let git = match &suite.git {
            Some(g) => Some(serde_json::to_string(g)?),
            None => None,
        };
        sqlx::query(
            r#"
            INSERT INTO suites
                (id, name, plan_id, environment_id, execution_command, cases, git, status,
                 last_execution_id, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                plan_id = excluded.plan_id,
                environment_id = excluded.environment_id,
                execution_command = excluded.execution_command,
                cases = excluded.cases,
                git = excluded.git,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&suite.id)
        .bind(&suite.name)
        .bind(&suite.plan_id)
        .bind(&suite.environment_id)
        .bind(&suite.execution_command)
        .bind(cases)
        .bind(git)
        .bind(suite.status.as_str())
        .bind(&suite.last_execution_id)
        .bind(to_millis(suite.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| storage_err("Failed to upsert suite", e))?;
        Ok(())
    }

    async fn get_suite(&self, id: &str) -> DaemonResult<Option<SuiteDefinition>> {
        let row = sqlx::query("SELECT * FROM suites WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(suite_from_row).transpose()
    }

    async fn list_suites(&self) -> DaemonResult<Vec<SuiteDefinition>> {
        let rows = sqlx::query("SELECT * FROM suites ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(suite_from_row).collect()
    }

    async fn set_suite_status(
        &self,
        id: &str,
        status: SuiteStatus,
        last_execution_id: Option<&str>,
    ) -> DaemonResult<()> {
        let result = sqlx::query(
            "UPDATE suites SET status = ?, last_execution_id = COALESCE(?, last_execution_id), \
             updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(last_execution_id)
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DaemonError::SuiteNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn append_log(
        &self,
        execution_id: &str,
        suite_id: &str,
        chunk: &str,
        at: DateTime<Utc>,
    ) -> DaemonResult<ExecutionLog> {
        let mut line = String::new();
        crate::store::append_line(&mut line, chunk);

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE execution_logs SET message = message || ? WHERE execution_id = ?",
        )
        .bind(&line)
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let next: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM execution_logs WHERE suite_id = ?",
            )
            .bind(suite_id)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO execution_logs (execution_id, suite_id, sequence, message, created_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(execution_id)
            .bind(suite_id)
            .bind(next)
            .bind(&line)
            .bind(to_millis(at))
            .execute(&mut *tx)
            .await?;
        }

        let row = sqlx::query("SELECT * FROM execution_logs WHERE execution_id = ?")
            .bind(execution_id)
            .fetch_one(&mut *tx)
            .await?;
        let log = log_from_row(&row)?;

        tx.commit().await?;
        Ok(log)
    }

    async fn finish_log(&self, execution_id: &str, at: DateTime<Utc>) -> DaemonResult<()> {
        sqlx::query(
            "UPDATE execution_logs SET finished_at = ? WHERE execution_id = ? AND finished_at IS NULL",
        )
        .bind(to_millis(at))
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_log(&self, execution_id: &str) -> DaemonResult<Option<ExecutionLog>> {
        let row = sqlx::query("SELECT * FROM execution_logs WHERE execution_id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(log_from_row).transpose()
    }

    async fn insert_result(&self, result: CaseResult) -> DaemonResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO case_results
                (execution_id, suite_id, case_id, outcome, duration_secs, log_output,
                 error_message, executor_id, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&result.execution_id)
        .bind(&result.suite_id)
        .bind(&result.case_id)
        .bind(result.outcome.as_str())
        .bind(result.duration_secs)
        .bind(&result.log_output)
        .bind(&result.error_message)
        .bind(&result.executor_id)
        .bind(to_millis(result.recorded_at))
        .execute(&self.pool)
        .await
        .map_err(|e| storage_err("Failed to insert result", e))?;
        Ok(inserted.rows_affected() > 0)
    }

    async fn results_for_execution(&self, execution_id: &str) -> DaemonResult<Vec<CaseResult>> {
        let rows = sqlx::query(
            "SELECT * FROM case_results WHERE execution_id = ? ORDER BY recorded_at ASC, rowid ASC",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(result_from_row).collect()
    }
}
