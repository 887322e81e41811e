/// Metrics collection and exposure

use crate::errors::{DaemonError, DaemonResult};
use crate::types::{MetricsAgents, MetricsResponse, MetricsSystem, MetricsTasks};
use chrono::Utc;
use prometheus::{Counter, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use testmesh_core::TaskStatus;

/// Metrics collector
pub struct MetricsCollector {
    registry: Arc<Registry>,

    // Request metrics
    pub request_total: Counter,
    pub request_duration: Histogram,
    pub request_errors: Counter,

    // Agent connection metrics
    pub agents_connected: IntGauge,
    pub agent_connections_total: IntCounter,
    pub agent_rejections: IntCounter,

    // Queue metrics
    pub tasks_enqueued: IntCounter,
    pub tasks_dispatched: IntCounter,
    pub dispatch_failures: IntCounter,
    pub tasks_completed: IntCounterVec,

    pub server_start: Instant,
}

fn metrics_err(e: prometheus::Error) -> DaemonError {
    DaemonError::MetricsError(e.to_string())
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> DaemonResult<Self> {
        let registry = Arc::new(Registry::new());

        let request_total =
            Counter::new("testmesh_requests_total", "Total RPC requests").map_err(metrics_err)?;
        registry
            .register(Box::new(request_total.clone()))
            .map_err(metrics_err)?;

        let request_duration = Histogram::with_opts(HistogramOpts::new(
            "testmesh_request_duration_seconds",
            "RPC request duration",
        ))
        .map_err(metrics_err)?;
        registry
            .register(Box::new(request_duration.clone()))
            .map_err(metrics_err)?;

        let request_errors = Counter::new("testmesh_request_errors_total", "Total RPC errors")
            .map_err(metrics_err)?;
        registry
            .register(Box::new(request_errors.clone()))
            .map_err(metrics_err)?;

        let agents_connected =
            IntGauge::new("testmesh_agents_connected", "Connected agents").map_err(metrics_err)?;
        registry
            .register(Box::new(agents_connected.clone()))
            .map_err(metrics_err)?;

        let agent_connections_total = IntCounter::new(
            "testmesh_agent_connections_total",
            "Accepted agent connections",
        )
        .map_err(metrics_err)?;
        registry
            .register(Box::new(agent_connections_total.clone()))
            .map_err(metrics_err)?;

        let agent_rejections = IntCounter::new(
            "testmesh_agent_rejections_total",
            "Agent connections rejected for a bad token",
        )
        .map_err(metrics_err)?;
        registry
            .register(Box::new(agent_rejections.clone()))
            .map_err(metrics_err)?;

        let tasks_enqueued =
            IntCounter::new("testmesh_tasks_enqueued_total", "Suite executions enqueued")
                .map_err(metrics_err)?;
        registry
            .register(Box::new(tasks_enqueued.clone()))
            .map_err(metrics_err)?;

        let tasks_dispatched = IntCounter::new(
            "testmesh_tasks_dispatched_total",
            "Suite executions sent to an agent",
        )
        .map_err(metrics_err)?;
        registry
            .register(Box::new(tasks_dispatched.clone()))
            .map_err(metrics_err)?;

        let dispatch_failures = IntCounter::new(
            "testmesh_dispatch_failures_total",
            "Suite executions that could not be delivered",
        )
        .map_err(metrics_err)?;
        registry
            .register(Box::new(dispatch_failures.clone()))
            .map_err(metrics_err)?;

        let tasks_completed = IntCounterVec::new(
            Opts::new(
                "testmesh_tasks_completed_total",
                "Suite executions by terminal status",
            ),
            &["status"],
        )
        .map_err(metrics_err)?;
        registry
            .register(Box::new(tasks_completed.clone()))
            .map_err(metrics_err)?;

        Ok(MetricsCollector {
            registry,
            request_total,
            request_duration,
            request_errors,
            agents_connected,
            agent_connections_total,
            agent_rejections,
            tasks_enqueued,
            tasks_dispatched,
            dispatch_failures,
            tasks_completed,
            server_start: Instant::now(),
        })
    }

    /// Record a request
    pub fn record_request(&self, duration_secs: f64) {
        self.request_total.inc();
        self.request_duration.observe(duration_secs);
    }

    /// Record a request error
    pub fn record_error(&self) {
        self.request_errors.inc();
    }

    pub fn record_agent_connected(&self) {
        self.agent_connections_total.inc();
        self.agents_connected.inc();
    }

    pub fn record_agent_disconnected(&self) {
        self.agents_connected.dec();
    }

    pub fn record_agent_rejected(&self) {
        self.agent_rejections.inc();
    }

    pub fn record_task_completed(&self, status: TaskStatus) {
        self.tasks_completed
            .with_label_values(&[status.as_str()])
            .inc();
    }

    pub fn uptime_secs(&self) -> u64 {
        self.server_start.elapsed().as_secs()
    }

    /// Get all metrics in Prometheus text format
    pub fn gather_metrics(&self) -> DaemonResult<String> {
        use prometheus::Encoder;

        let metrics = self.registry.gather();
        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&metrics, &mut buffer)
            .map_err(metrics_err)?;
        String::from_utf8(buffer).map_err(|e| DaemonError::MetricsError(e.to_string()))
    }

    /// Get metrics response
    pub fn get_metrics_response(&self) -> MetricsResponse {
        let agents = MetricsAgents {
            connected: self.agents_connected.get().max(0) as usize,
            connections_total: self.agent_connections_total.get(),
            rejected: self.agent_rejections.get(),
        };

        let mut completed = HashMap::new();
        for status in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            let count = self
                .tasks_completed
                .with_label_values(&[status.as_str()])
                .get();
            completed.insert(status.as_str().to_string(), count);
        }

        let tasks = MetricsTasks {
            enqueued: self.tasks_enqueued.get(),
            dispatched: self.tasks_dispatched.get(),
            dispatch_failures: self.dispatch_failures.get(),
            completed,
        };

        let system = MetricsSystem {
            uptime_secs: self.uptime_secs(),
            requests_total: self.request_total.get() as u64,
            request_errors: self.request_errors.get() as u64,
        };

        MetricsResponse {
            agents,
            tasks,
            system,
            timestamp: Utc::now(),
        }
    }

    /// Get the registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }
}
