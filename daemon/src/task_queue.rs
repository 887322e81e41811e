/// Per-environment admission control for suite executions.
///
/// Every task is inserted as `pending`; moving it to `running` is a separate,
/// explicit step so callers can order side effects around dispatch. The
/// check-then-start sequence must run under [`TaskQueue::lock_environment`] so
/// two callers cannot both claim the last free slot.
use crate::errors::{DaemonError, DaemonResult};
use crate::model::Task;
use crate::store::DispatchStore;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use testmesh_core::TaskStatus;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Concurrency limit when neither the environment nor the config sets one.
pub const DEFAULT_MAX_CONCURRENT_TASKS: u32 = 1;

/// Parameters for a new queue entry.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub environment_id: String,
    pub suite_id: String,
    /// Caller-supplied and globally unique.
    pub execution_id: String,
    pub requester_id: Option<String>,
    pub priority: i32,
    pub expected_case_ids: Vec<String>,
}

pub struct TaskQueue {
    store: Arc<dyn DispatchStore>,
    default_max_concurrent: u32,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn DispatchStore>, default_max_concurrent: u32) -> Self {
        Self {
            store,
            default_max_concurrent: default_max_concurrent.max(1),
            locks: DashMap::new(),
        }
    }

    /// Serializes admission decisions for one environment.
    pub async fn lock_environment(&self, environment_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(environment_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub async fn max_concurrent(&self, environment_id: &str) -> DaemonResult<u32> {
        let configured = self
            .store
            .get_environment(environment_id)
            .await?
            .and_then(|env| env.max_concurrent_tasks)
            .filter(|max| *max > 0);
        Ok(configured.unwrap_or(self.default_max_concurrent))
    }

    pub async fn running_count(&self, environment_id: &str) -> DaemonResult<usize> {
        self.store
            .count_tasks(environment_id, TaskStatus::Running)
            .await
    }

    /// True iff fewer tasks are running than the environment allows.
    pub async fn can_execute_immediately(&self, environment_id: &str) -> DaemonResult<bool> {
        let running = self.running_count(environment_id).await?;
        let max = self.max_concurrent(environment_id).await?;
        Ok(running < max as usize)
    }

    /// Insert a `pending` task.
    pub async fn enqueue(&self, request: EnqueueRequest) -> DaemonResult<Task> {
        if request.execution_id.is_empty() {
            return Err(DaemonError::InvalidRequest(
                "execution id must not be empty".to_string(),
            ));
        }

        let task = Task {
            execution_id: request.execution_id,
            environment_id: request.environment_id,
            suite_id: request.suite_id,
            requester_id: request.requester_id,
            status: TaskStatus::Pending,
            priority: request.priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            expected_case_ids: request.expected_case_ids,
            error: None,
        };
        self.store.insert_task(task.clone()).await?;

        debug!(
            execution_id = %task.execution_id,
            environment_id = %task.environment_id,
            priority = task.priority,
            "Task enqueued"
        );
        Ok(task)
    }

    /// `pending -> running`. Returns the updated task, or `None` when the
    /// task was not pending.
    pub async fn start(&self, execution_id: &str) -> DaemonResult<Option<Task>> {
        let changed = self
            .store
            .transition_task(
                execution_id,
                &[TaskStatus::Pending],
                TaskStatus::Running,
                Utc::now(),
                None,
            )
            .await?;
        if !changed {
            debug!(execution_id, "Start ignored, task not pending");
            return Ok(None);
        }
        self.store.get_task(execution_id).await
    }

    /// `pending | running -> terminal`. Returns the updated task, or `None`
    /// when the task was already terminal (or unknown).
    pub async fn complete(
        &self,
        execution_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> DaemonResult<Option<Task>> {
        if !status.is_terminal() {
            return Err(DaemonError::InvalidRequest(format!(
                "{} is not a terminal status",
                status
            )));
        }

        let changed = self
            .store
            .transition_task(
                execution_id,
                &[TaskStatus::Pending, TaskStatus::Running],
                status,
                Utc::now(),
                error,
            )
            .await?;
        if !changed {
            debug!(execution_id, %status, "Completion ignored, task already terminal");
            return Ok(None);
        }
        self.store.get_task(execution_id).await
    }

    /// Highest-priority, then oldest, pending task for the environment.
    pub async fn next_pending(&self, environment_id: &str) -> DaemonResult<Option<Task>> {
        self.store.next_pending(environment_id).await
    }

    pub async fn get(&self, execution_id: &str) -> DaemonResult<Option<Task>> {
        self.store.get_task(execution_id).await
    }

    /// Active tasks for an environment: running first, then pending in
    /// dispatch order.
    pub async fn active(&self, environment_id: &str) -> DaemonResult<Vec<Task>> {
        let mut running = self
            .store
            .tasks_for_environment(environment_id, &[TaskStatus::Running])
            .await?;
        let mut pending = self
            .store
            .tasks_for_environment(environment_id, &[TaskStatus::Pending])
            .await?;
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        running.append(&mut pending);
        Ok(running)
    }
}
