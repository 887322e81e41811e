/// Event bus for real-time dispatch events
///
/// This module provides:
/// - Event types for suite logs, task and suite status, and agent presence
/// - Event bus for publishing and subscribing to events
/// - Event filtering by suite, environment and event kind
use crate::model::SuiteStatus;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use testmesh_core::{SystemSnapshot, TaskStatus};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Maximum number of events to buffer in the broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Event published by the dispatch core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// New output chunk for a suite execution
    SuiteLog {
        suite_id: String,
        execution_id: String,
        sequence: u64,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// A queue entry changed state
    TaskStatus {
        execution_id: String,
        suite_id: String,
        environment_id: String,
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A suite's derived status changed
    SuiteStatus {
        suite_id: String,
        status: SuiteStatus,
        #[serde(default)]
        execution_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    EnvironmentOnline {
        environment_id: String,
        timestamp: DateTime<Utc>,
    },
    EnvironmentOffline {
        environment_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    AgentHeartbeat {
        environment_id: String,
        snapshot: SystemSnapshot,
    },
}

impl DispatchEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchEvent::SuiteLog { .. } => "suite_log",
            DispatchEvent::TaskStatus { .. } => "task_status",
            DispatchEvent::SuiteStatus { .. } => "suite_status",
            DispatchEvent::EnvironmentOnline { .. } => "environment_online",
            DispatchEvent::EnvironmentOffline { .. } => "environment_offline",
            DispatchEvent::AgentHeartbeat { .. } => "agent_heartbeat",
        }
    }

    pub fn suite_id(&self) -> Option<&str> {
        match self {
            DispatchEvent::SuiteLog { suite_id, .. }
            | DispatchEvent::TaskStatus { suite_id, .. }
            | DispatchEvent::SuiteStatus { suite_id, .. } => Some(suite_id),
            _ => None,
        }
    }

    pub fn environment_id(&self) -> Option<&str> {
        match self {
            DispatchEvent::TaskStatus { environment_id, .. }
            | DispatchEvent::EnvironmentOnline { environment_id, .. }
            | DispatchEvent::EnvironmentOffline { environment_id, .. }
            | DispatchEvent::AgentHeartbeat { environment_id, .. } => Some(environment_id),
            _ => None,
        }
    }

    pub fn environment_online(environment_id: &str) -> Self {
        DispatchEvent::EnvironmentOnline {
            environment_id: environment_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn environment_offline(environment_id: &str, reason: &str) -> Self {
        DispatchEvent::EnvironmentOffline {
            environment_id: environment_id.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Event filter for subscribing to specific events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EventFilter {
    /// Filter by suite IDs (empty = all)
    #[serde(default)]
    pub suite_ids: Vec<String>,
    /// Filter by environment IDs (empty = all)
    #[serde(default)]
    pub environment_ids: Vec<String>,
    /// Filter by event kind, e.g. "suite_log" (empty = all)
    #[serde(default)]
    pub kinds: Vec<String>,
}

impl EventFilter {
    /// Create a filter that matches all events
    pub fn all() -> Self {
        Self::default()
    }

    /// Create a filter for one suite
    pub fn for_suite(suite_id: impl Into<String>) -> Self {
        Self {
            suite_ids: vec![suite_id.into()],
            ..Default::default()
        }
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &DispatchEvent) -> bool {
        if !self.kinds.is_empty() && !self.kinds.iter().any(|k| k == event.kind()) {
            return false;
        }

        // An id filter only excludes events that carry that kind of id.
        if !self.suite_ids.is_empty() {
            if let Some(suite_id) = event.suite_id() {
                if !self.suite_ids.iter().any(|s| s == suite_id) {
                    return false;
                }
            } else if self.environment_ids.is_empty() {
                return false;
            }
        }

        if !self.environment_ids.is_empty() {
            if let Some(environment_id) = event.environment_id() {
                if !self.environment_ids.iter().any(|e| e == environment_id) {
                    return false;
                }
            }
        }

        true
    }
}

/// Statistics about event bus usage
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventBusStats {
    pub total_events_published: u64,
    pub total_subscriptions: u64,
    pub active_subscriptions: usize,
    pub events_by_type: HashMap<String, u64>,
}

/// Event bus for publishing and subscribing to events
pub struct EventBus {
    /// Broadcast channel for events
    tx: broadcast::Sender<DispatchEvent>,
    /// Active subscriptions and their filters
    subscriptions: RwLock<HashMap<String, EventFilter>>,
    /// Event statistics
    stats: RwLock<EventBusStats>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            subscriptions: RwLock::new(HashMap::new()),
            stats: RwLock::new(EventBusStats::default()),
        }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: DispatchEvent) {
        {
            let mut stats = self.stats.write();
            stats.total_events_published += 1;
            *stats
                .events_by_type
                .entry(event.kind().to_string())
                .or_insert(0) += 1;
        }

        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    /// Subscribe to events with optional filter
    pub fn subscribe(
        &self,
        filter: Option<EventFilter>,
    ) -> (String, broadcast::Receiver<DispatchEvent>) {
        let subscription_id = Uuid::new_v4().to_string();
        let active = {
            let mut subscriptions = self.subscriptions.write();
            subscriptions.insert(subscription_id.clone(), filter.unwrap_or_default());
            subscriptions.len()
        };

        let mut stats = self.stats.write();
        stats.total_subscriptions += 1;
        stats.active_subscriptions = active;
        drop(stats);

        (subscription_id, self.tx.subscribe())
    }

    /// Unsubscribe from events
    pub fn unsubscribe(&self, subscription_id: &str) {
        let active = {
            let mut subscriptions = self.subscriptions.write();
            subscriptions.remove(subscription_id);
            subscriptions.len()
        };
        self.stats.write().active_subscriptions = active;
    }

    /// Get current statistics
    pub fn stats(&self) -> EventBusStats {
        self.stats.read().clone()
    }

    /// Get active subscription count
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_event(suite_id: &str) -> DispatchEvent {
        DispatchEvent::SuiteLog {
            suite_id: suite_id.to_string(),
            execution_id: "exec-1".to_string(),
            sequence: 1,
            message: "running".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_suite_filter() {
        let filter = EventFilter::for_suite("suite-1");
        assert!(filter.matches(&log_event("suite-1")));
        assert!(!filter.matches(&log_event("suite-2")));
        assert!(!filter.matches(&DispatchEvent::environment_online("env-1")));
    }

    #[test]
    fn test_kind_filter() {
        let filter = EventFilter {
            kinds: vec!["environment_offline".to_string()],
            ..Default::default()
        };
        assert!(filter.matches(&DispatchEvent::environment_offline("env-1", "lost")));
        assert!(!filter.matches(&log_event("suite-1")));
    }

    #[test]
    fn test_event_serialization_shape() {
        let json = serde_json::to_value(log_event("suite-1")).unwrap();
        assert_eq!(json["type"], "suite_log");
        assert_eq!(json["data"]["suite_id"], "suite-1");
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let bus = EventBus::new();
        let (_sub_id, mut rx) = bus.subscribe(None);

        bus.publish(log_event("suite-1"));

        match rx.recv().await.unwrap() {
            DispatchEvent::SuiteLog { suite_id, .. } => assert_eq!(suite_id, "suite-1"),
            other => panic!("Wrong event type: {:?}", other),
        }
        assert_eq!(bus.stats().total_events_published, 1);
    }

    #[test]
    fn test_subscription_management() {
        let bus = EventBus::new();
        let (sub_id, _rx) = bus.subscribe(None);
        assert_eq!(bus.subscription_count(), 1);

        bus.unsubscribe(&sub_id);
        assert_eq!(bus.subscription_count(), 0);
        assert_eq!(bus.stats().active_subscriptions, 0);
    }
}
