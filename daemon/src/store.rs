/// Persistence seam for the dispatch core.
///
/// The daemon only needs a narrow slice of the platform database: environment
/// lookup, task-queue rows, suite status, execution logs and case results.
/// [`DispatchStore`] captures that slice; [`MemoryStore`] keeps everything in
/// process memory and [`crate::sqlite_store::SqliteStore`] persists it.
use crate::errors::{DaemonError, DaemonResult};
use crate::model::{CaseResult, Environment, ExecutionLog, SuiteDefinition, SuiteStatus, Task};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use testmesh_core::{SystemSnapshot, TaskStatus};

#[async_trait]
pub trait DispatchStore: Send + Sync {
    // Environments
    async fn upsert_environment(&self, env: Environment) -> DaemonResult<()>;
    async fn get_environment(&self, id: &str) -> DaemonResult<Option<Environment>>;
    async fn find_environment_by_token(&self, token: &str) -> DaemonResult<Option<Environment>>;
    async fn list_environments(&self) -> DaemonResult<Vec<Environment>>;
    async fn set_environment_online(&self, id: &str, online: bool) -> DaemonResult<()>;
    async fn set_environment_token(&self, id: &str, token: &str) -> DaemonResult<()>;
    async fn record_heartbeat(&self, id: &str, snapshot: &SystemSnapshot) -> DaemonResult<()>;

    // Tasks
    /// Fails if the execution id already exists.
    async fn insert_task(&self, task: Task) -> DaemonResult<()>;
    async fn get_task(&self, execution_id: &str) -> DaemonResult<Option<Task>>;
    /// Compare-and-set: moves the task to `to` only if its status is in
    /// `from`. Stamps `started_at` for running and `completed_at` for terminal
    /// states. Returns whether a row changed.
    async fn transition_task(
        &self,
        execution_id: &str,
        from: &[TaskStatus],
        to: TaskStatus,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> DaemonResult<bool>;
    async fn count_tasks(&self, environment_id: &str, status: TaskStatus) -> DaemonResult<usize>;
    /// Highest priority first, then oldest.
    async fn next_pending(&self, environment_id: &str) -> DaemonResult<Option<Task>>;
    async fn tasks_for_suite(&self, suite_id: &str) -> DaemonResult<Vec<Task>>;
    /// Empty `statuses` matches every status. Ordered oldest first.
    async fn tasks_for_environment(
        &self,
        environment_id: &str,
        statuses: &[TaskStatus],
    ) -> DaemonResult<Vec<Task>>;

    // Suites
    async fn upsert_suite(&self, suite: SuiteDefinition) -> DaemonResult<()>;
    async fn get_suite(&self, id: &str) -> DaemonResult<Option<SuiteDefinition>>;
    async fn list_suites(&self) -> DaemonResult<Vec<SuiteDefinition>>;
    async fn set_suite_status(
        &self,
        id: &str,
        status: SuiteStatus,
        last_execution_id: Option<&str>,
    ) -> DaemonResult<()>;

    // Logs
    /// Appends to the execution's log, creating it (with the next sequence
    /// number for the suite) on the first chunk.
    async fn append_log(
        &self,
        execution_id: &str,
        suite_id: &str,
        chunk: &str,
        at: DateTime<Utc>,
    ) -> DaemonResult<ExecutionLog>;
    async fn finish_log(&self, execution_id: &str, at: DateTime<Utc>) -> DaemonResult<()>;
    async fn get_log(&self, execution_id: &str) -> DaemonResult<Option<ExecutionLog>>;

    // Results
    /// First write wins per `(execution_id, case_id)`; returns false for a
    /// duplicate.
    async fn insert_result(&self, result: CaseResult) -> DaemonResult<bool>;
    async fn results_for_execution(&self, execution_id: &str) -> DaemonResult<Vec<CaseResult>>;
}

/// Appends `chunk` as one line.
pub(crate) fn append_line(body: &mut String, chunk: &str) {
    body.push_str(chunk);
    if !chunk.ends_with('\n') {
        body.push('\n');
    }
}

pub(crate) fn apply_transition(task: &mut Task, to: TaskStatus, at: DateTime<Utc>, error: Option<String>) {
    task.status = to;
    if to == TaskStatus::Running {
        task.started_at = Some(at);
    }
    if to.is_terminal() {
        task.completed_at = Some(at);
    }
    if error.is_some() {
        task.error = error;
    }
}

#[derive(Default)]
struct MemoryState {
    environments: HashMap<String, Environment>,
    suites: HashMap<String, SuiteDefinition>,
    tasks: HashMap<String, Task>,
    /// Insertion order of execution ids; breaks `created_at` ties.
    task_order: Vec<String>,
    logs: HashMap<String, ExecutionLog>,
    results: Vec<CaseResult>,
}

impl MemoryState {
    fn ordered_tasks(&self) -> impl Iterator<Item = &Task> {
        self.task_order.iter().filter_map(|id| self.tasks.get(id))
    }
}

/// In-process store used by tests and by daemons without a database.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DispatchStore for MemoryStore {
    async fn upsert_environment(&self, env: Environment) -> DaemonResult<()> {
        self.state.lock().environments.insert(env.id.clone(), env);
        Ok(())
    }

    async fn get_environment(&self, id: &str) -> DaemonResult<Option<Environment>> {
        Ok(self.state.lock().environments.get(id).cloned())
    }

    async fn find_environment_by_token(&self, token: &str) -> DaemonResult<Option<Environment>> {
        Ok(self
            .state
            .lock()
            .environments
            .values()
            .find(|env| env.token == token)
            .cloned())
    }

    async fn list_environments(&self) -> DaemonResult<Vec<Environment>> {
        let mut envs: Vec<Environment> =
            self.state.lock().environments.values().cloned().collect();
        envs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(envs)
    }

    async fn set_environment_online(&self, id: &str, online: bool) -> DaemonResult<()> {
        let mut state = self.state.lock();
        let env = state
            .environments
            .get_mut(id)
            .ok_or_else(|| DaemonError::EnvironmentNotFound(id.to_string()))?;
        env.online = online;
        Ok(())
    }

    async fn set_environment_token(&self, id: &str, token: &str) -> DaemonResult<()> {
        let mut state = self.state.lock();
        let env = state
            .environments
            .get_mut(id)
            .ok_or_else(|| DaemonError::EnvironmentNotFound(id.to_string()))?;
        env.token = token.to_string();
        Ok(())
    }

    async fn record_heartbeat(&self, id: &str, snapshot: &SystemSnapshot) -> DaemonResult<()> {
        let mut state = self.state.lock();
        let env = state
            .environments
            .get_mut(id)
            .ok_or_else(|| DaemonError::EnvironmentNotFound(id.to_string()))?;
        env.last_heartbeat = Some(Utc::now());
        env.last_snapshot = Some(snapshot.clone());
        Ok(())
    }

    async fn insert_task(&self, task: Task) -> DaemonResult<()> {
        let mut state = self.state.lock();
        if state.tasks.contains_key(&task.execution_id) {
            return Err(DaemonError::InvalidRequest(format!(
                "Execution id already exists: {}",
                task.execution_id
            )));
        }
        state.task_order.push(task.execution_id.clone());
        state.tasks.insert(task.execution_id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, execution_id: &str) -> DaemonResult<Option<Task>> {
        Ok(self.state.lock().tasks.get(execution_id).cloned())
    }

    async fn transition_task(
        &self,
        execution_id: &str,
        from: &[TaskStatus],
        to: TaskStatus,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> DaemonResult<bool> {
        let mut state = self.state.lock();
        match state.tasks.get_mut(execution_id) {
            Some(task) if from.contains(&task.status) => {
                apply_transition(task, to, at, error);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_tasks(&self, environment_id: &str, status: TaskStatus) -> DaemonResult<usize> {
        Ok(self
            .state
            .lock()
            .tasks
            .values()
            .filter(|t| t.environment_id == environment_id && t.status == status)
            .count())
    }

    async fn next_pending(&self, environment_id: &str) -> DaemonResult<Option<Task>> {
        let state = self.state.lock();
        let mut best: Option<&Task> = None;
        for task in state.ordered_tasks() {
            if task.environment_id != environment_id || task.status != TaskStatus::Pending {
                continue;
            }
            best = match best {
                Some(current)
                    if (current.priority, std::cmp::Reverse(current.created_at))
                        >= (task.priority, std::cmp::Reverse(task.created_at)) =>
                {
                    Some(current)
                }
                _ => Some(task),
            };
        }
        Ok(best.cloned())
    }

    async fn tasks_for_suite(&self, suite_id: &str) -> DaemonResult<Vec<Task>> {
        Ok(self
            .state
            .lock()
            .ordered_tasks()
            .filter(|t| t.suite_id == suite_id)
            .cloned()
            .collect())
    }

    async fn tasks_for_environment(
        &self,
        environment_id: &str,
        statuses: &[TaskStatus],
    ) -> DaemonResult<Vec<Task>> {
        Ok(self
            .state
            .lock()
            .ordered_tasks()
            .filter(|t| t.environment_id == environment_id)
            .filter(|t| statuses.is_empty() || statuses.contains(&t.status))
            .cloned()
            .collect())
    }

    async fn upsert_suite(&self, suite: SuiteDefinition) -> DaemonResult<()> {
        self.state.lock().suites.insert(suite.id.clone(), suite);
        Ok(())
    }

    async fn get_suite(&self, id: &str) -> DaemonResult<Option<SuiteDefinition>> {
        Ok(self.state.lock().suites.get(id).cloned())
    }

    async fn list_suites(&self) -> DaemonResult<Vec<SuiteDefinition>> {
        let mut suites: Vec<SuiteDefinition> = self.state.lock().suites.values().cloned().collect();
        suites.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(suites)
    }

    async fn set_suite_status(
        &self,
        id: &str,
        status: SuiteStatus,
        last_execution_id: Option<&str>,
    ) -> DaemonResult<()> {
        let mut state = self.state.lock();
        let suite = state
            .suites
            .get_mut(id)
            .ok_or_else(|| DaemonError::SuiteNotFound(id.to_string()))?;
        suite.status = status;
        if let Some(execution_id) = last_execution_id {
            suite.last_execution_id = Some(execution_id.to_string());
        }
        suite.updated_at = Utc::now();
        Ok(())
    }

    async fn append_log(
        &self,
        execution_id: &str,
        suite_id: &str,
        chunk: &str,
        at: DateTime<Utc>,
    ) -> DaemonResult<ExecutionLog> {
        let mut state = self.state.lock();
        if !state.logs.contains_key(execution_id) {
            let sequence = state
                .logs
                .values()
                .filter(|log| log.suite_id == suite_id)
                .map(|log| log.sequence)
                .max()
                .unwrap_or(0)
                + 1;
            state.logs.insert(
                execution_id.to_string(),
                ExecutionLog {
                    execution_id: execution_id.to_string(),
                    suite_id: suite_id.to_string(),
                    sequence,
                    message: String::new(),
                    created_at: at,
                    finished_at: None,
                },
            );
        }

        let log = state
            .logs
            .get_mut(execution_id)
            .ok_or_else(|| DaemonError::StorageError("log vanished".to_string()))?;
        append_line(&mut log.message, chunk);
        Ok(log.clone())
    }

    async fn finish_log(&self, execution_id: &str, at: DateTime<Utc>) -> DaemonResult<()> {
        if let Some(log) = self.state.lock().logs.get_mut(execution_id) {
            if log.finished_at.is_none() {
                log.finished_at = Some(at);
            }
        }
        Ok(())
    }

    async fn get_log(&self, execution_id: &str) -> DaemonResult<Option<ExecutionLog>> {
        Ok(self.state.lock().logs.get(execution_id).cloned())
    }

    async fn insert_result(&self, result: CaseResult) -> DaemonResult<bool> {
        let mut state = self.state.lock();
        let duplicate = state
            .results
            .iter()
            .any(|r| r.execution_id == result.execution_id && r.case_id == result.case_id);
        if duplicate {
            return Ok(false);
        }
        state.results.push(result);
        Ok(true)
    }

    async fn results_for_execution(&self, execution_id: &str) -> DaemonResult<Vec<CaseResult>> {
        Ok(self
            .state
            .lock()
            .results
            .iter()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect())
    }
}
