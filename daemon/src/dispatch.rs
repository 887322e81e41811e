/// Suite dispatch: bridges execute/cancel requests onto the task queue and
/// the connection registry, and folds agent reports back into stored state.
///
/// Every path that can free a concurrency slot (explicit completion, inferred
/// completion, cancellation, send failure, reconnect) ends in
/// `drain_locked`, which keeps starting the next pending task while the
/// environment is connected and below its limit. All of it runs under the
/// environment's queue lock, including the suite status recompute, so the
/// displayed suite status never lags the queue.
use crate::errors::{DaemonError, DaemonResult};
use crate::events::{DispatchEvent, EventBus};
use crate::metrics::MetricsCollector;
use crate::model::{CaseResult, SuiteDefinition, SuiteStatus, Task};
use crate::registry::ConnectionRegistry;
use crate::store::DispatchStore;
use crate::task_queue::{EnqueueRequest, TaskQueue};
use crate::types::{CancelResponse, ExecuteResponse};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use testmesh_core::{
    ServerMessage, SuiteCaseResult, SuiteCompletion, SuiteExecutionRequest, SuiteLogChunk,
    SuiteRunStatus, TaskStatus, CAPABILITY_SUITE_COMPLETED,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Error recorded on tasks whose dispatch message could not be delivered.
pub const AGENT_UNREACHABLE: &str = "agent unreachable";

/// Error recorded on executions a reconnecting agent no longer reports.
pub const AGENT_LOST_EXECUTION: &str = "agent connection lost: execution unknown to reconnected agent";

/// Outcome of one start-and-send step during a drain.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchAttempt {
    pub execution_id: String,
    pub delivered: bool,
}

pub struct SuiteDispatcher {
    store: Arc<dyn DispatchStore>,
    queue: Arc<TaskQueue>,
    registry: Arc<ConnectionRegistry>,
    events: Arc<EventBus>,
    metrics: Arc<MetricsCollector>,
}

impl SuiteDispatcher {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        queue: Arc<TaskQueue>,
        registry: Arc<ConnectionRegistry>,
        events: Arc<EventBus>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            events,
            metrics,
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Enqueue a new execution of `suite_id` and dispatch it if a slot is
    /// free. A full environment is not an error: the execution stays queued.
    pub async fn execute_suite(
        &self,
        suite_id: &str,
        requester_id: Option<String>,
        priority: i32,
    ) -> DaemonResult<ExecuteResponse> {
        let suite = self
            .store
            .get_suite(suite_id)
            .await?
            .ok_or_else(|| DaemonError::SuiteNotFound(suite_id.to_string()))?;
        let environment_id = suite.environment_id.clone();

        if self.store.get_environment(&environment_id).await?.is_none() {
            return Err(DaemonError::EnvironmentNotFound(environment_id));
        }
        if !self.registry.is_connected(&environment_id) {
            return Err(DaemonError::EnvironmentOffline(environment_id));
        }

        let execution_id = Uuid::new_v4().to_string();
        let _guard = self.queue.lock_environment(&environment_id).await;

        let task = self
            .queue
            .enqueue(EnqueueRequest {
                environment_id: environment_id.clone(),
                suite_id: suite.id.clone(),
                execution_id: execution_id.clone(),
                requester_id,
                priority,
                expected_case_ids: suite.case_ids(),
            })
            .await?;
        self.metrics.tasks_enqueued.inc();
        self.publish_task(&task);
        self.refresh_suite_status(&suite.id).await?;

        let attempts = self.drain_locked(&environment_id).await?;
        let own = attempts.iter().find(|a| a.execution_id == execution_id);

        match own {
            Some(attempt) if !attempt.delivered => {
                Err(DaemonError::AgentUnreachable(format!(
                    "environment {} did not accept execution {}",
                    environment_id, execution_id
                )))
            }
            Some(_) => {
                info!(
                    suite_id = %suite.id,
                    execution_id = %execution_id,
                    environment_id = %environment_id,
                    "Suite execution dispatched"
                );
                Ok(ExecuteResponse {
                    execution_id,
                    suite_id: suite.id,
                    environment_id,
                    status: TaskStatus::Running,
                    queued: false,
                    message: "Execution dispatched to agent".to_string(),
                })
            }
            None => {
                let ahead = self.queue.running_count(&environment_id).await?;
                info!(
                    suite_id = %suite.id,
                    execution_id = %execution_id,
                    environment_id = %environment_id,
                    running = ahead,
                    "Suite execution queued"
                );
                Ok(ExecuteResponse {
                    execution_id,
                    suite_id: suite.id,
                    environment_id,
                    status: TaskStatus::Pending,
                    queued: true,
                    message: format!("Queued behind {} running execution(s)", ahead),
                })
            }
        }
    }

    /// Cancel one execution. Running executions get a `cancel_test_suite`
    /// and are marked cancelled without waiting for the agent; pending ones
    /// are cancelled locally.
    pub async fn cancel_suite_execution(
        &self,
        suite_id: &str,
        execution_id: &str,
    ) -> DaemonResult<CancelResponse> {
        let task = self
            .queue
            .get(execution_id)
            .await?
            .ok_or_else(|| DaemonError::TaskNotFound(execution_id.to_string()))?;
        if task.suite_id != suite_id {
            return Err(DaemonError::InvalidRequest(format!(
                "execution {} does not belong to suite {}",
                execution_id, suite_id
            )));
        }

        let environment_id = task.environment_id.clone();
        let _guard = self.queue.lock_environment(&environment_id).await;

        // The task may have moved while we waited for the lock.
        let task = self
            .queue
            .get(execution_id)
            .await?
            .ok_or_else(|| DaemonError::TaskNotFound(execution_id.to_string()))?;

        let (agent_notified, message) = match task.status {
            TaskStatus::Running => {
                let notice = ServerMessage::CancelTestSuite {
                    suite_id: suite_id.to_string(),
                    execution_id: execution_id.to_string(),
                };
                let notified = self.registry.send(&environment_id, &notice).await;
                if !notified {
                    warn!(
                        execution_id,
                        environment_id = %environment_id,
                        "Cancel could not reach agent, marking cancelled anyway"
                    );
                }
                self.finish_task(execution_id, TaskStatus::Cancelled, None)
                    .await?;
                let message = if notified {
                    "Cancellation sent to agent"
                } else {
                    "Agent unreachable, execution marked cancelled"
                };
                (notified, message.to_string())
            }
            TaskStatus::Pending => {
                self.finish_task(execution_id, TaskStatus::Cancelled, None)
                    .await?;
                (false, "Cancelled before dispatch".to_string())
            }
            status => {
                debug!(execution_id, %status, "Cancel ignored, execution already finished");
                return Ok(CancelResponse {
                    execution_id: execution_id.to_string(),
                    suite_id: suite_id.to_string(),
                    status,
                    agent_notified: false,
                    message: "Execution already finished".to_string(),
                });
            }
        };

        info!(execution_id, suite_id, agent_notified, "Suite execution cancelled");
        self.refresh_suite_status(suite_id).await?;
        self.drain_locked(&environment_id).await?;

        Ok(CancelResponse {
            execution_id: execution_id.to_string(),
            suite_id: suite_id.to_string(),
            status: TaskStatus::Cancelled,
            agent_notified,
            message,
        })
    }

    /// One case verdict from the agent. Without the explicit-completion
    /// capability, the execution completes once every dispatched case id
    /// has been reported.
    pub async fn on_suite_result(
        &self,
        environment_id: &str,
        report: SuiteCaseResult,
    ) -> DaemonResult<()> {
        let _guard = self.queue.lock_environment(environment_id).await;

        let Some(task) = self
            .resolve_execution(environment_id, &report.suite_id, report.execution_id.as_deref())
            .await?
        else {
            warn!(
                environment_id,
                suite_id = %report.suite_id,
                case_id = %report.case_id,
                "Result for unknown execution dropped"
            );
            return Ok(());
        };
        if task.environment_id != environment_id {
            warn!(
                environment_id,
                execution_id = %task.execution_id,
                "Result from an environment that does not own the execution dropped"
            );
            return Ok(());
        }
        if matches!(task.status, TaskStatus::Cancelled | TaskStatus::Pending) {
            debug!(
                execution_id = %task.execution_id,
                status = %task.status,
                "Result dropped"
            );
            return Ok(());
        }

        let inserted = self
            .store
            .insert_result(CaseResult {
                execution_id: task.execution_id.clone(),
                suite_id: task.suite_id.clone(),
                case_id: report.case_id.clone(),
                outcome: report.result,
                duration_secs: report.duration,
                log_output: report.log_output,
                error_message: report.error_message,
                executor_id: report.executor_id,
                recorded_at: Utc::now(),
            })
            .await?;
        if !inserted {
            debug!(
                execution_id = %task.execution_id,
                case_id = %report.case_id,
                "Duplicate case result ignored"
            );
            return Ok(());
        }

        if task.status != TaskStatus::Running {
            // A late verdict can still flip the suite to failed.
            self.refresh_suite_status(&task.suite_id).await?;
            return Ok(());
        }

        let explicit_completion = self
            .registry
            .get(environment_id)
            .map(|handle| handle.has_capability(CAPABILITY_SUITE_COMPLETED))
            .unwrap_or(false);
        if explicit_completion || task.expected_case_ids.is_empty() {
            return Ok(());
        }

        let reported: HashSet<String> = self
            .store
            .results_for_execution(&task.execution_id)
            .await?
            .into_iter()
            .map(|r| r.case_id)
            .collect();
        if task.expected_case_ids.iter().all(|id| reported.contains(id)) {
            info!(
                execution_id = %task.execution_id,
                cases = reported.len(),
                "All dispatched cases reported, completing execution"
            );
            self.finish_task(&task.execution_id, TaskStatus::Completed, None)
                .await?;
            self.refresh_suite_status(&task.suite_id).await?;
            self.drain_locked(environment_id).await?;
        }
        Ok(())
    }

    /// Append an output chunk and announce it to event subscribers.
    pub async fn on_suite_log(
        &self,
        environment_id: &str,
        chunk: SuiteLogChunk,
    ) -> DaemonResult<()> {
        let Some(task) = self.queue.get(&chunk.execution_id).await? else {
            debug!(execution_id = %chunk.execution_id, "Log for unknown execution dropped");
            return Ok(());
        };
        if task.environment_id != environment_id || task.suite_id != chunk.suite_id {
            warn!(
                environment_id,
                execution_id = %chunk.execution_id,
                "Log chunk does not match the execution, dropped"
            );
            return Ok(());
        }
        if task.status.is_terminal() {
            debug!(
                execution_id = %chunk.execution_id,
                status = %task.status,
                "Log for finished execution dropped"
            );
            return Ok(());
        }

        let log = self
            .store
            .append_log(
                &chunk.execution_id,
                &chunk.suite_id,
                &chunk.message,
                chunk.timestamp,
            )
            .await?;

        self.events.publish(DispatchEvent::SuiteLog {
            suite_id: chunk.suite_id,
            execution_id: chunk.execution_id,
            sequence: log.sequence,
            message: chunk.message,
            timestamp: chunk.timestamp,
        });
        Ok(())
    }

    /// Explicit end-of-run signal. Takes precedence over inference and is a
    /// no-op against an execution that is already terminal.
    pub async fn on_suite_completed(
        &self,
        environment_id: &str,
        completion: SuiteCompletion,
    ) -> DaemonResult<()> {
        let _guard = self.queue.lock_environment(environment_id).await;

        let Some(task) = self.queue.get(&completion.execution_id).await? else {
            warn!(
                environment_id,
                execution_id = %completion.execution_id,
                "Completion for unknown execution dropped"
            );
            return Ok(());
        };
        if task.environment_id != environment_id {
            warn!(
                environment_id,
                execution_id = %completion.execution_id,
                "Completion from an environment that does not own the execution dropped"
            );
            return Ok(());
        }

        let error = match completion.status {
            SuiteRunStatus::Timeout => Some("execution timed out on agent".to_string()),
            SuiteRunStatus::Error => Some("agent reported an execution error".to_string()),
            SuiteRunStatus::Failed if completion.total == 0 => {
                Some("execution command failed".to_string())
            }
            _ => None,
        };

        info!(
            execution_id = %completion.execution_id,
            status = ?completion.status,
            total = completion.total,
            passed = completion.passed,
            failed = completion.failed,
            errors = completion.errors,
            skipped = completion.skipped,
            duration_secs = completion.duration,
            "Suite execution finished on agent"
        );

        let changed = self
            .finish_task(
                &completion.execution_id,
                completion.status.to_task_status(),
                error,
            )
            .await?;
        if changed.is_none() {
            debug!(
                execution_id = %completion.execution_id,
                "Completion ignored, execution already terminal"
            );
        }

        self.refresh_suite_status(&task.suite_id).await?;
        self.drain_locked(environment_id).await?;
        Ok(())
    }

    /// An agent registered: flag it online and start whatever queued while
    /// it was away.
    pub async fn on_agent_connected(&self, environment_id: &str) -> DaemonResult<Vec<DispatchAttempt>> {
        self.store.set_environment_online(environment_id, true).await?;
        let _guard = self.queue.lock_environment(environment_id).await;
        self.drain_locked(environment_id).await
    }

    /// The agent's connection was lost. Running executions that belonged to
    /// it are failed; pending ones stay queued for the next connection.
    /// Returns how many executions were failed.
    pub async fn on_agent_disconnected(
        &self,
        environment_id: &str,
        reason: &str,
    ) -> DaemonResult<usize> {
        let _guard = self.queue.lock_environment(environment_id).await;

        // A replacement may already be registered; leave its work alone.
        let replacement_since = self.registry.get(environment_id).map(|h| h.connected_at);
        if replacement_since.is_none() {
            self.store
                .set_environment_online(environment_id, false)
                .await?;
        }

        let error = format!("agent connection lost: {}", reason);
        let failed = self
            .fail_running_locked(environment_id, &error, |task| {
                matches!(
                    (replacement_since, task.started_at),
                    (Some(since), Some(started)) if started_on_or_after(started, since)
                )
            })
            .await?;

        if failed > 0 {
            warn!(environment_id, failed, reason, "Failed executions of disconnected agent");
        }
        Ok(failed)
    }

    /// An agent authenticated on `connection_id` and reported what it is
    /// still running. Executions started on earlier connections that it no
    /// longer knows about are failed and the freed slots drained; the agent
    /// behind the old connection is gone even if its socket never closed.
    pub async fn on_agent_authenticated(
        &self,
        environment_id: &str,
        connection_id: &str,
        still_running: &[String],
    ) -> DaemonResult<usize> {
        let _guard = self.queue.lock_environment(environment_id).await;

        let Some(current) = self.registry.get(environment_id) else {
            return Ok(0);
        };
        if current.connection_id != connection_id {
            debug!(environment_id, connection_id, "Auth from a superseded connection ignored");
            return Ok(0);
        }
        let since = current.connected_at;
        let still_running: HashSet<&str> = still_running.iter().map(String::as_str).collect();

        let failed = self
            .fail_running_locked(environment_id, AGENT_LOST_EXECUTION, |task| {
                task.started_at
                    .map_or(false, |started| started_on_or_after(started, since))
                    || still_running.contains(task.execution_id.as_str())
            })
            .await?;

        if failed > 0 {
            warn!(environment_id, failed, "Agent reconnected without executions it was running");
            self.drain_locked(environment_id).await?;
        }
        Ok(failed)
    }

    /// Fail every running task of the environment that `keep` does not
    /// claim, then recompute the affected suites. Caller must hold the
    /// environment lock.
    async fn fail_running_locked<F>(
        &self,
        environment_id: &str,
        error: &str,
        keep: F,
    ) -> DaemonResult<usize>
    where
        F: Fn(&Task) -> bool,
    {
        let running = self
            .store
            .tasks_for_environment(environment_id, &[TaskStatus::Running])
            .await?;

        let mut suites = BTreeSet::new();
        let mut failed = 0;
        for task in running {
            if keep(&task) {
                continue;
            }
            if self
                .finish_task(&task.execution_id, TaskStatus::Failed, Some(error.to_string()))
                .await?
                .is_some()
            {
                failed += 1;
                suites.insert(task.suite_id);
            }
        }

        for suite_id in &suites {
            self.refresh_suite_status(suite_id).await?;
        }
        Ok(failed)
    }

    /// Start pending tasks while the environment is connected and has a free
    /// slot. Caller must hold the environment lock.
    async fn drain_locked(&self, environment_id: &str) -> DaemonResult<Vec<DispatchAttempt>> {
        let mut attempts = Vec::new();

        while self.registry.is_connected(environment_id)
            && self.queue.can_execute_immediately(environment_id).await?
        {
            let Some(next) = self.queue.next_pending(environment_id).await? else {
                break;
            };
            match self.start_and_send(next).await? {
                Some(attempt) => attempts.push(attempt),
                None => break,
            }
        }

        Ok(attempts)
    }

    async fn start_and_send(&self, task: Task) -> DaemonResult<Option<DispatchAttempt>> {
        let Some(task) = self.queue.start(&task.execution_id).await? else {
            return Ok(None);
        };
        self.publish_task(&task);

        let delivered = match self.store.get_suite(&task.suite_id).await? {
            Some(suite) => {
                let message = ServerMessage::ExecuteTestSuite(execution_request(&suite, &task));
                self.registry.send(&task.environment_id, &message).await
            }
            None => {
                warn!(
                    execution_id = %task.execution_id,
                    suite_id = %task.suite_id,
                    "Suite disappeared before dispatch"
                );
                false
            }
        };

        if delivered {
            self.metrics.tasks_dispatched.inc();
            debug!(
                execution_id = %task.execution_id,
                environment_id = %task.environment_id,
                "Execution sent to agent"
            );
        } else {
            self.metrics.dispatch_failures.inc();
            warn!(
                execution_id = %task.execution_id,
                environment_id = %task.environment_id,
                "Dispatch failed, failing execution"
            );
            self.finish_task(
                &task.execution_id,
                TaskStatus::Failed,
                Some(AGENT_UNREACHABLE.to_string()),
            )
            .await?;
        }
        self.refresh_suite_status(&task.suite_id).await?;

        Ok(Some(DispatchAttempt {
            execution_id: task.execution_id,
            delivered,
        }))
    }

    /// Terminal transition plus its bookkeeping. Does not drain.
    async fn finish_task(
        &self,
        execution_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> DaemonResult<Option<Task>> {
        let Some(task) = self.queue.complete(execution_id, status, error).await? else {
            return Ok(None);
        };
        self.metrics.record_task_completed(status);
        self.store.finish_log(execution_id, Utc::now()).await?;
        self.publish_task(&task);
        Ok(Some(task))
    }

    /// Re-derive the suite's displayed status from its tasks.
    async fn refresh_suite_status(&self, suite_id: &str) -> DaemonResult<SuiteStatus> {
        let Some(suite) = self.store.get_suite(suite_id).await? else {
            return Ok(SuiteStatus::Idle);
        };
        let tasks = self.store.tasks_for_suite(suite_id).await?;

        let (status, execution_id) = if let Some(task) =
            tasks.iter().find(|t| t.status == TaskStatus::Running)
        {
            (SuiteStatus::Running, Some(task.execution_id.clone()))
        } else if let Some(task) = tasks.iter().find(|t| t.status == TaskStatus::Pending) {
            (SuiteStatus::Pending, Some(task.execution_id.clone()))
        } else {
            let latest = tasks
                .iter()
                .filter(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Failed))
                .fold(None::<&Task>, |best, t| match best {
                    Some(b) if b.completed_at > t.completed_at => Some(b),
                    _ => Some(t),
                });
            match latest {
                Some(task) if task.status == TaskStatus::Failed => {
                    (SuiteStatus::Failed, Some(task.execution_id.clone()))
                }
                Some(task) => {
                    let any_failed = self
                        .store
                        .results_for_execution(&task.execution_id)
                        .await?
                        .iter()
                        .any(|r| r.outcome.is_failure());
                    let status = if any_failed {
                        SuiteStatus::Failed
                    } else {
                        SuiteStatus::Completed
                    };
                    (status, Some(task.execution_id.clone()))
                }
                None => (SuiteStatus::Idle, None),
            }
        };

        let same_execution = execution_id.is_none() || execution_id == suite.last_execution_id;
        if status == suite.status && same_execution {
            return Ok(status);
        }

        self.store
            .set_suite_status(suite_id, status, execution_id.as_deref())
            .await?;
        debug!(suite_id, %status, "Suite status changed");
        self.events.publish(DispatchEvent::SuiteStatus {
            suite_id: suite_id.to_string(),
            status,
            execution_id,
            timestamp: Utc::now(),
        });
        Ok(status)
    }

    /// Execution named by the agent, or for older agents the oldest running
    /// execution of the suite on that environment.
    async fn resolve_execution(
        &self,
        environment_id: &str,
        suite_id: &str,
        execution_id: Option<&str>,
    ) -> DaemonResult<Option<Task>> {
        if let Some(execution_id) = execution_id {
            return self.queue.get(execution_id).await;
        }
        let tasks = self.store.tasks_for_suite(suite_id).await?;
        Ok(tasks
            .into_iter()
            .filter(|t| t.environment_id == environment_id && t.status == TaskStatus::Running)
            .min_by_key(|t| t.started_at))
    }

    fn publish_task(&self, task: &Task) {
        self.events.publish(DispatchEvent::TaskStatus {
            execution_id: task.execution_id.clone(),
            suite_id: task.suite_id.clone(),
            environment_id: task.environment_id.clone(),
            status: task.status,
            error: task.error.clone(),
            timestamp: Utc::now(),
        });
    }
}

/// Stores keep millisecond timestamps, so compare at that precision.
fn started_on_or_after(started: DateTime<Utc>, since: DateTime<Utc>) -> bool {
    started.timestamp_millis() >= since.timestamp_millis()
}

/// Build the `execute_test_suite` payload for a started task.
pub fn execution_request(suite: &SuiteDefinition, task: &Task) -> SuiteExecutionRequest {
    SuiteExecutionRequest {
        suite_id: suite.id.clone(),
        plan_id: suite.plan_id.clone(),
        execution_id: task.execution_id.clone(),
        git_enabled: suite.git.is_some(),
        git_repo_url: suite.git.as_ref().map(|g| g.repo_url.clone()),
        git_branch: suite.git.as_ref().and_then(|g| g.branch.clone()),
        execution_command: suite.execution_command.clone(),
        case_ids: suite.case_ids(),
        case_codes: suite.case_codes(),
        executor_id: task.requester_id.clone(),
        timeout: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Environment, GitSource};
    use crate::registry::tests::RecordingLink;
    use crate::registry::ConnectionHandle;
    use crate::store::MemoryStore;
    use crate::task_queue::DEFAULT_MAX_CONCURRENT_TASKS;
    use std::sync::atomic::Ordering;
    use testmesh_core::CaseOutcome;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<ConnectionRegistry>,
        events: Arc<EventBus>,
        dispatcher: Arc<SuiteDispatcher>,
    }

    async fn fixture(max_concurrent: Option<u32>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let mut env = Environment::new("env-1", "token-1");
        env.max_concurrent_tasks = max_concurrent;
        store.upsert_environment(env).await.unwrap();
        for suite_id in ["suite-a", "suite-b", "suite-c"] {
            store
                .upsert_suite(
                    SuiteDefinition::new(suite_id, "env-1", "pytest")
                        .with_case("case-1", "TC-1")
                        .with_case("case-2", "TC-2"),
                )
                .await
                .unwrap();
        }

        let registry = Arc::new(ConnectionRegistry::new());
        let events = Arc::new(EventBus::new());
        let queue = Arc::new(TaskQueue::new(store.clone(), DEFAULT_MAX_CONCURRENT_TASKS));
        let dispatcher = Arc::new(SuiteDispatcher::new(
            store.clone(),
            queue,
            registry.clone(),
            events.clone(),
            Arc::new(MetricsCollector::new().unwrap()),
        ));
        Fixture {
            store,
            registry,
            events,
            dispatcher,
        }
    }

    fn connect(f: &Fixture, capabilities: &[&str]) -> Arc<RecordingLink> {
        let link = Arc::new(RecordingLink::default());
        let handle = Arc::new(ConnectionHandle::new(
            Uuid::new_v4().to_string(),
            "env-1",
            link.clone(),
        ));
        handle.set_capabilities(capabilities.iter().map(|c| c.to_string()).collect());
        f.registry.register(handle);
        link
    }

    fn sent_of_type(link: &RecordingLink, kind: &str) -> Vec<serde_json::Value> {
        link.sent
            .lock()
            .iter()
            .filter_map(|text| serde_json::from_str::<serde_json::Value>(text).ok())
            .filter(|v| v["type"] == kind)
            .collect()
    }

    async fn status(f: &Fixture, execution_id: &str) -> TaskStatus {
        f.store.get_task(execution_id).await.unwrap().unwrap().status
    }

    fn completion(suite_id: &str, execution_id: &str, status: SuiteRunStatus) -> SuiteCompletion {
        SuiteCompletion {
            suite_id: suite_id.to_string(),
            execution_id: execution_id.to_string(),
            status,
            total: 2,
            passed: 2,
            failed: 0,
            errors: 0,
            skipped: 0,
            duration: 1.5,
        }
    }

    fn case_result(suite_id: &str, execution_id: Option<&str>, case_id: &str, outcome: CaseOutcome) -> SuiteCaseResult {
        SuiteCaseResult {
            suite_id: suite_id.to_string(),
            execution_id: execution_id.map(str::to_string),
            case_id: case_id.to_string(),
            result: outcome,
            duration: 0.2,
            log_output: None,
            error_message: None,
            executor_id: Some("user-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_completion_drains_next_pending() {
        let f = fixture(Some(1)).await;
        let link = connect(&f, &[CAPABILITY_SUITE_COMPLETED]);

        let a = f
            .dispatcher
            .execute_suite("suite-a", Some("user-1".to_string()), 0)
            .await
            .unwrap();
        let b = f
            .dispatcher
            .execute_suite("suite-b", None, 0)
            .await
            .unwrap();

        assert_eq!(a.status, TaskStatus::Running);
        assert!(!a.queued);
        assert_eq!(b.status, TaskStatus::Pending);
        assert!(b.queued);
        assert_eq!(sent_of_type(&link, "execute_test_suite").len(), 1);

        f.dispatcher
            .on_suite_completed(
                "env-1",
                completion("suite-a", &a.execution_id, SuiteRunStatus::Completed),
            )
            .await
            .unwrap();

        assert_eq!(status(&f, &a.execution_id).await, TaskStatus::Completed);
        assert_eq!(status(&f, &b.execution_id).await, TaskStatus::Running);

        let dispatched = sent_of_type(&link, "execute_test_suite");
        assert_eq!(dispatched.len(), 2);
        assert_eq!(dispatched[1]["execution_id"], b.execution_id.as_str());
        assert_eq!(dispatched[1]["suite_id"], "suite-b");
    }

    #[tokio::test]
    async fn test_dispatch_payload_carries_suite_fields() {
        let f = fixture(None).await;
        let mut suite = f.store.get_suite("suite-a").await.unwrap().unwrap();
        suite.plan_id = Some("plan-9".to_string());
        suite.git = Some(GitSource {
            repo_url: "https://example.com/tests.git".to_string(),
            branch: Some("main".to_string()),
        });
        f.store.upsert_suite(suite).await.unwrap();
        let link = connect(&f, &[]);

        let response = f
            .dispatcher
            .execute_suite("suite-a", Some("user-7".to_string()), 0)
            .await
            .unwrap();

        let sent = sent_of_type(&link, "execute_test_suite");
        let payload = &sent[0];
        assert_eq!(payload["execution_id"], response.execution_id.as_str());
        assert_eq!(payload["plan_id"], "plan-9");
        assert_eq!(payload["git_enabled"], true);
        assert_eq!(payload["git_branch"], "main");
        assert_eq!(payload["execution_command"], "pytest");
        assert_eq!(payload["case_ids"], serde_json::json!(["case-1", "case-2"]));
        assert_eq!(payload["case_codes"], serde_json::json!(["TC-1", "TC-2"]));
        assert_eq!(payload["executor_id"], "user-7");
    }

    #[tokio::test]
    async fn test_cancel_pending_sends_nothing() {
        let f = fixture(Some(1)).await;
        let link = connect(&f, &[]);

        f.dispatcher.execute_suite("suite-a", None, 0).await.unwrap();
        let b = f.dispatcher.execute_suite("suite-b", None, 0).await.unwrap();
        let sent_before = link.sent.lock().len();

        let response = f
            .dispatcher
            .cancel_suite_execution("suite-b", &b.execution_id)
            .await
            .unwrap();

        assert_eq!(response.status, TaskStatus::Cancelled);
        assert!(!response.agent_notified);
        assert_eq!(status(&f, &b.execution_id).await, TaskStatus::Cancelled);
        assert_eq!(link.sent.lock().len(), sent_before);
    }

    #[tokio::test]
    async fn test_cancel_running_notifies_and_drains() {
        let f = fixture(Some(1)).await;
        let link = connect(&f, &[]);

        let a = f.dispatcher.execute_suite("suite-a", None, 0).await.unwrap();
        let b = f.dispatcher.execute_suite("suite-b", None, 0).await.unwrap();

        let response = f
            .dispatcher
            .cancel_suite_execution("suite-a", &a.execution_id)
            .await
            .unwrap();
        assert!(response.agent_notified);

        let cancels = sent_of_type(&link, "cancel_test_suite");
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0]["execution_id"], a.execution_id.as_str());
        assert_eq!(status(&f, &a.execution_id).await, TaskStatus::Cancelled);
        assert_eq!(status(&f, &b.execution_id).await, TaskStatus::Running);

        // The agent's own late report must not overwrite the cancellation.
        f.dispatcher
            .on_suite_completed(
                "env-1",
                completion("suite-a", &a.execution_id, SuiteRunStatus::Cancelled),
            )
            .await
            .unwrap();
        assert_eq!(status(&f, &a.execution_id).await, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_finished_is_noop() {
        let f = fixture(None).await;
        connect(&f, &[CAPABILITY_SUITE_COMPLETED]);
        let a = f.dispatcher.execute_suite("suite-a", None, 0).await.unwrap();
        f.dispatcher
            .on_suite_completed(
                "env-1",
                completion("suite-a", &a.execution_id, SuiteRunStatus::Completed),
            )
            .await
            .unwrap();

        let response = f
            .dispatcher
            .cancel_suite_execution("suite-a", &a.execution_id)
            .await
            .unwrap();
        assert_eq!(response.status, TaskStatus::Completed);
        assert_eq!(status(&f, &a.execution_id).await, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_rejects_unknown_and_mismatched() {
        let f = fixture(None).await;
        connect(&f, &[]);
        let a = f.dispatcher.execute_suite("suite-a", None, 0).await.unwrap();

        assert!(matches!(
            f.dispatcher.cancel_suite_execution("suite-a", "nope").await,
            Err(DaemonError::TaskNotFound(_))
        ));
        assert!(matches!(
            f.dispatcher
                .cancel_suite_execution("suite-b", &a.execution_id)
                .await,
            Err(DaemonError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_inferred_completion_when_all_cases_reported() {
        let f = fixture(Some(1)).await;
        let link = connect(&f, &[]);

        let a = f.dispatcher.execute_suite("suite-a", None, 0).await.unwrap();
        let b = f.dispatcher.execute_suite("suite-b", None, 0).await.unwrap();

        f.dispatcher
            .on_suite_result(
                "env-1",
                case_result("suite-a", Some(&a.execution_id), "case-1", CaseOutcome::Passed),
            )
            .await
            .unwrap();
        assert_eq!(status(&f, &a.execution_id).await, TaskStatus::Running);

        // Older agents omit the execution id.
        f.dispatcher
            .on_suite_result(
                "env-1",
                case_result("suite-a", None, "case-2", CaseOutcome::Failed),
            )
            .await
            .unwrap();

        assert_eq!(status(&f, &a.execution_id).await, TaskStatus::Completed);
        assert_eq!(status(&f, &b.execution_id).await, TaskStatus::Running);
        assert_eq!(sent_of_type(&link, "execute_test_suite").len(), 2);

        let suite = f.store.get_suite("suite-a").await.unwrap().unwrap();
        assert_eq!(suite.status, SuiteStatus::Failed);
    }

    #[tokio::test]
    async fn test_capability_disables_inference() {
        let f = fixture(None).await;
        connect(&f, &[CAPABILITY_SUITE_COMPLETED]);
        let a = f.dispatcher.execute_suite("suite-a", None, 0).await.unwrap();

        for case_id in ["case-1", "case-2"] {
            f.dispatcher
                .on_suite_result(
                    "env-1",
                    case_result("suite-a", Some(&a.execution_id), case_id, CaseOutcome::Passed),
                )
                .await
                .unwrap();
        }
        assert_eq!(status(&f, &a.execution_id).await, TaskStatus::Running);

        f.dispatcher
            .on_suite_completed(
                "env-1",
                completion("suite-a", &a.execution_id, SuiteRunStatus::Completed),
            )
            .await
            .unwrap();
        assert_eq!(status(&f, &a.execution_id).await, TaskStatus::Completed);
        let suite = f.store.get_suite("suite-a").await.unwrap().unwrap();
        assert_eq!(suite.status, SuiteStatus::Completed);
        assert_eq!(suite.last_execution_id.as_deref(), Some(a.execution_id.as_str()));
    }

    #[tokio::test]
    async fn test_duplicate_and_cancelled_results_dropped() {
        let f = fixture(Some(1)).await;
        connect(&f, &[CAPABILITY_SUITE_COMPLETED]);
        let a = f.dispatcher.execute_suite("suite-a", None, 0).await.unwrap();

        let report = case_result("suite-a", Some(&a.execution_id), "case-1", CaseOutcome::Passed);
        f.dispatcher.on_suite_result("env-1", report.clone()).await.unwrap();
        f.dispatcher.on_suite_result("env-1", report).await.unwrap();
        assert_eq!(
            f.store
                .results_for_execution(&a.execution_id)
                .await
                .unwrap()
                .len(),
            1
        );

        f.dispatcher
            .cancel_suite_execution("suite-a", &a.execution_id)
            .await
            .unwrap();
        f.dispatcher
            .on_suite_result(
                "env-1",
                case_result("suite-a", Some(&a.execution_id), "case-2", CaseOutcome::Passed),
            )
            .await
            .unwrap();
        assert_eq!(
            f.store
                .results_for_execution(&a.execution_id)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_suite_logs_are_appended_and_published() {
        let f = fixture(None).await;
        connect(&f, &[]);
        let (_sub, mut rx) = f.events.subscribe(None);
        let a = f.dispatcher.execute_suite("suite-a", None, 0).await.unwrap();

        for line in ["collecting", "2 passed"] {
            f.dispatcher
                .on_suite_log(
                    "env-1",
                    SuiteLogChunk {
                        suite_id: "suite-a".to_string(),
                        execution_id: a.execution_id.clone(),
                        message: line.to_string(),
                        timestamp: Utc::now(),
                    },
                )
                .await
                .unwrap();
        }

        let log = f.store.get_log(&a.execution_id).await.unwrap().unwrap();
        assert_eq!(log.message, "collecting\n2 passed\n");
        assert_eq!(log.sequence, 1);

        let mut logs = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DispatchEvent::SuiteLog { message, .. } = event {
                logs.push(message);
            }
        }
        assert_eq!(logs, vec!["collecting", "2 passed"]);
    }

    #[tokio::test]
    async fn test_log_from_foreign_environment_dropped() {
        let f = fixture(None).await;
        connect(&f, &[]);
        let a = f.dispatcher.execute_suite("suite-a", None, 0).await.unwrap();

        f.dispatcher
            .on_suite_log(
                "env-2",
                SuiteLogChunk {
                    suite_id: "suite-a".to_string(),
                    execution_id: a.execution_id.clone(),
                    message: "spoofed".to_string(),
                    timestamp: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert!(f.store.get_log(&a.execution_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_failure_fails_task_and_reports_unreachable() {
        let f = fixture(None).await;
        let link = connect(&f, &[]);
        link.fail.store(true, Ordering::SeqCst);

        let result = f.dispatcher.execute_suite("suite-a", None, 0).await;
        assert!(matches!(result, Err(DaemonError::AgentUnreachable(_))));
        assert!(!f.registry.is_connected("env-1"));

        let tasks = f.store.tasks_for_suite("suite-a").await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert_eq!(tasks[0].error.as_deref(), Some(AGENT_UNREACHABLE));
        let suite = f.store.get_suite("suite-a").await.unwrap().unwrap();
        assert_eq!(suite.status, SuiteStatus::Failed);
    }

    #[tokio::test]
    async fn test_offline_environment_rejected() {
        let f = fixture(None).await;
        assert!(matches!(
            f.dispatcher.execute_suite("suite-a", None, 0).await,
            Err(DaemonError::EnvironmentOffline(_))
        ));
        assert!(matches!(
            f.dispatcher.execute_suite("missing", None, 0).await,
            Err(DaemonError::SuiteNotFound(_))
        ));
        assert!(f.store.tasks_for_suite("suite-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_fails_running_and_keeps_pending() {
        let f = fixture(Some(1)).await;
        connect(&f, &[]);
        let a = f.dispatcher.execute_suite("suite-a", None, 0).await.unwrap();
        let b = f.dispatcher.execute_suite("suite-b", None, 0).await.unwrap();

        f.registry.unregister("env-1");
        let failed = f
            .dispatcher
            .on_agent_disconnected("env-1", "socket closed")
            .await
            .unwrap();

        assert_eq!(failed, 1);
        assert_eq!(status(&f, &a.execution_id).await, TaskStatus::Failed);
        assert_eq!(status(&f, &b.execution_id).await, TaskStatus::Pending);
        let env = f.store.get_environment("env-1").await.unwrap().unwrap();
        assert!(!env.online);

        // The queued execution starts once the agent is back.
        let link = connect(&f, &[]);
        let attempts = f.dispatcher.on_agent_connected("env-1").await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(status(&f, &b.execution_id).await, TaskStatus::Running);
        assert_eq!(sent_of_type(&link, "execute_test_suite").len(), 1);
    }

    fn current_connection(f: &Fixture) -> String {
        f.registry.get("env-1").unwrap().connection_id.clone()
    }

    #[tokio::test]
    async fn test_restarted_agent_frees_slot_of_unreported_execution() {
        let f = fixture(Some(1)).await;
        connect(&f, &[]);
        let a = f.dispatcher.execute_suite("suite-a", None, 0).await.unwrap();
        let b = f.dispatcher.execute_suite("suite-b", None, 0).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        // A fresh agent process replaces the old connection before the
        // daemon noticed it was gone.
        let link = connect(&f, &[]);
        let failed = f
            .dispatcher
            .on_agent_authenticated("env-1", &current_connection(&f), &[])
            .await
            .unwrap();

        assert_eq!(failed, 1);
        let task = f.store.get_task(&a.execution_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some(AGENT_LOST_EXECUTION));
        assert_eq!(status(&f, &b.execution_id).await, TaskStatus::Running);
        let sent = sent_of_type(&link, "execute_test_suite");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["execution_id"], b.execution_id.as_str());
    }

    #[tokio::test]
    async fn test_reconnected_agent_keeps_reported_execution() {
        let f = fixture(Some(1)).await;
        connect(&f, &[]);
        let a = f.dispatcher.execute_suite("suite-a", None, 0).await.unwrap();
        let b = f.dispatcher.execute_suite("suite-b", None, 0).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let link = connect(&f, &[]);
        let failed = f
            .dispatcher
            .on_agent_authenticated("env-1", &current_connection(&f), &[a.execution_id.clone()])
            .await
            .unwrap();

        assert_eq!(failed, 0);
        assert_eq!(status(&f, &a.execution_id).await, TaskStatus::Running);
        assert_eq!(status(&f, &b.execution_id).await, TaskStatus::Pending);
        assert!(sent_of_type(&link, "execute_test_suite").is_empty());
    }

    #[tokio::test]
    async fn test_auth_on_replaced_connection_is_ignored() {
        let f = fixture(Some(1)).await;
        connect(&f, &[]);
        let stale = current_connection(&f);
        let a = f.dispatcher.execute_suite("suite-a", None, 0).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        connect(&f, &[]);

        let failed = f
            .dispatcher
            .on_agent_authenticated("env-1", &stale, &[])
            .await
            .unwrap();

        assert_eq!(failed, 0);
        assert_eq!(status(&f, &a.execution_id).await, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_priority_dispatch_order() {
        let f = fixture(Some(1)).await;
        let link = connect(&f, &[CAPABILITY_SUITE_COMPLETED]);

        let a = f.dispatcher.execute_suite("suite-a", None, 0).await.unwrap();
        let low = f.dispatcher.execute_suite("suite-b", None, 0).await.unwrap();
        let high = f.dispatcher.execute_suite("suite-c", None, 5).await.unwrap();

        f.dispatcher
            .on_suite_completed(
                "env-1",
                completion("suite-a", &a.execution_id, SuiteRunStatus::Failed),
            )
            .await
            .unwrap();

        assert_eq!(status(&f, &high.execution_id).await, TaskStatus::Running);
        assert_eq!(status(&f, &low.execution_id).await, TaskStatus::Pending);
        let dispatched = sent_of_type(&link, "execute_test_suite");
        assert_eq!(dispatched[1]["execution_id"], high.execution_id.as_str());
    }

    #[tokio::test]
    async fn test_concurrent_executes_respect_limit() {
        let f = fixture(Some(2)).await;
        connect(&f, &[]);

        let mut handles = Vec::new();
        for i in 0..8 {
            let dispatcher = f.dispatcher.clone();
            let suite = ["suite-a", "suite-b", "suite-c"][i % 3];
            handles.push(tokio::spawn(async move {
                dispatcher.execute_suite(suite, None, 0).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let running = f
            .store
            .count_tasks("env-1", TaskStatus::Running)
            .await
            .unwrap();
        let pending = f
            .store
            .count_tasks("env-1", TaskStatus::Pending)
            .await
            .unwrap();
        assert_eq!(running, 2);
        assert_eq!(pending, 6);
    }

    #[tokio::test]
    async fn test_suite_status_follows_queue() {
        let f = fixture(Some(1)).await;
        connect(&f, &[CAPABILITY_SUITE_COMPLETED]);

        let a1 = f.dispatcher.execute_suite("suite-a", None, 0).await.unwrap();
        let a2 = f.dispatcher.execute_suite("suite-a", None, 0).await.unwrap();
        let suite = f.store.get_suite("suite-a").await.unwrap().unwrap();
        assert_eq!(suite.status, SuiteStatus::Running);

        f.dispatcher
            .cancel_suite_execution("suite-a", &a1.execution_id)
            .await
            .unwrap();
        // The queued run took over.
        let suite = f.store.get_suite("suite-a").await.unwrap().unwrap();
        assert_eq!(suite.status, SuiteStatus::Running);
        assert_eq!(suite.last_execution_id.as_deref(), Some(a2.execution_id.as_str()));

        f.dispatcher
            .cancel_suite_execution("suite-a", &a2.execution_id)
            .await
            .unwrap();
        let suite = f.store.get_suite("suite-a").await.unwrap().unwrap();
        assert_eq!(suite.status, SuiteStatus::Idle);
    }
}
