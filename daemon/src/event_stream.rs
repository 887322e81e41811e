/// WebSocket event streaming for frontend clients
///
/// Clients subscribe with an optional filter (typically a suite id) and
/// receive matching [`DispatchEvent`]s, e.g. live suite log lines.

use crate::errors::{DaemonError, DaemonResult};
use crate::events::{DispatchEvent, EventBus, EventFilter};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Message sent from the daemon to a frontend client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum StreamMessage {
    /// Event from the event bus
    Event(DispatchEvent),
    SubscriptionConfirmed {
        subscription_id: String,
    },
    SubscriptionUpdated {
        subscription_id: String,
    },
    /// Events were dropped because the client fell behind
    Lagged {
        missed: u64,
    },
    Ping {
        timestamp: DateTime<Utc>,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Message sent from a frontend client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    Subscribe {
        #[serde(default)]
        filter: Option<EventFilter>,
    },
    UpdateFilter {
        filter: EventFilter,
    },
    Unsubscribe,
    Pong {
        timestamp: DateTime<Utc>,
    },
}

/// Per-connection subscription state
#[derive(Default)]
struct Subscription {
    id: Option<String>,
    receiver: Option<broadcast::Receiver<DispatchEvent>>,
    filter: EventFilter,
}

/// Accept frontend connections until `shutdown` fires.
pub async fn serve_event_stream(
    listener: TcpListener,
    event_bus: Arc<EventBus>,
    ping_interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Event stream client connected");
                        let bus = event_bus.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_event_stream(stream, bus, ping_interval, shutdown).await {
                                warn!(%peer, "Event stream connection ended with error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept event stream connection: {}", e),
                }
            }
            _ = shutdown.cancelled() => {
                info!("Event stream listener stopped");
                break;
            }
        }
    }
}

/// Handle a WebSocket connection for event streaming
pub async fn handle_event_stream(
    stream: TcpStream,
    event_bus: Arc<EventBus>,
    ping_interval: Duration,
    shutdown: CancellationToken,
) -> DaemonResult<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| DaemonError::ConnectionError(e.to_string()))?;
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let mut subscription = Subscription::default();
    let mut heartbeat = tokio::time::interval(ping_interval);
    heartbeat.tick().await;

    loop {
        let outgoing = tokio::select! {
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ClientRequest>(&text) {
                            Ok(request) => {
                                match handle_client_request(request, &event_bus, &mut subscription) {
                                    Ok(response) => response,
                                    Err(e) => Some(StreamMessage::Error {
                                        code: "HANDLER_ERROR".to_string(),
                                        message: e.to_string(),
                                    }),
                                }
                            }
                            Err(e) => {
                                warn!("Invalid client message: {}", e);
                                Some(StreamMessage::Error {
                                    code: "INVALID_MESSAGE".to_string(),
                                    message: format!("Failed to parse message: {}", e),
                                })
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if ws_sink.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                        None
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => None,
                    Some(Err(e)) => {
                        debug!("Event stream read error: {}", e);
                        break;
                    }
                }
            }

            received = next_event(&mut subscription.receiver) => {
                match received {
                    Ok(event) if subscription.filter.matches(&event) => {
                        Some(StreamMessage::Event(event))
                    }
                    Ok(_) => None,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Event stream client lagging");
                        Some(StreamMessage::Lagged { missed })
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        subscription.receiver = None;
                        None
                    }
                }
            }

            _ = heartbeat.tick() => {
                Some(StreamMessage::Ping { timestamp: Utc::now() })
            }

            _ = shutdown.cancelled() => {
                let _ = ws_sink.send(WsMessage::Close(None)).await;
                break;
            }
        };

        if let Some(message) = outgoing {
            let json = serde_json::to_string(&message)?;
            if let Err(e) = ws_sink.send(WsMessage::Text(json)).await {
                debug!("Failed to send to event stream client: {}", e);
                break;
            }
        }
    }

    if let Some(id) = subscription.id.take() {
        event_bus.unsubscribe(&id);
    }
    debug!("Event stream connection closed");
    Ok(())
}

async fn next_event(
    receiver: &mut Option<broadcast::Receiver<DispatchEvent>>,
) -> Result<DispatchEvent, broadcast::error::RecvError> {
    match receiver {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Handle a client request and return an optional response
fn handle_client_request(
    request: ClientRequest,
    event_bus: &EventBus,
    subscription: &mut Subscription,
) -> DaemonResult<Option<StreamMessage>> {
    match request {
        ClientRequest::Subscribe { filter } => {
            if let Some(previous) = subscription.id.take() {
                event_bus.unsubscribe(&previous);
            }

            let filter = filter.unwrap_or_default();
            let (id, rx) = event_bus.subscribe(Some(filter.clone()));
            subscription.id = Some(id.clone());
            subscription.receiver = Some(rx);
            subscription.filter = filter;

            info!(subscription_id = %id, "Client subscribed to events");
            Ok(Some(StreamMessage::SubscriptionConfirmed {
                subscription_id: id,
            }))
        }

        ClientRequest::UpdateFilter { filter } => {
            let Some(id) = subscription.id.clone() else {
                return Err(DaemonError::InvalidRequest(
                    "No active subscription to update".to_string(),
                ));
            };
            subscription.filter = filter;
            Ok(Some(StreamMessage::SubscriptionUpdated {
                subscription_id: id,
            }))
        }

        ClientRequest::Unsubscribe => {
            if let Some(id) = subscription.id.take() {
                event_bus.unsubscribe(&id);
                subscription.receiver = None;
                subscription.filter = EventFilter::default();
            }
            Ok(None)
        }

        ClientRequest::Pong { .. } => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_request_shape() {
        let json = r#"{"type":"subscribe","payload":{"filter":{"suite_ids":["suite-1"]}}}"#;
        match serde_json::from_str::<ClientRequest>(json).unwrap() {
            ClientRequest::Subscribe { filter } => {
                assert_eq!(filter.unwrap().suite_ids, vec!["suite-1"]);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_update_without_subscription_fails() {
        let bus = EventBus::new();
        let mut subscription = Subscription::default();
        let result = handle_client_request(
            ClientRequest::UpdateFilter {
                filter: EventFilter::all(),
            },
            &bus,
            &mut subscription,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_resubscribe_replaces_subscription() {
        let bus = EventBus::new();
        let mut subscription = Subscription::default();
        for _ in 0..2 {
            handle_client_request(
                ClientRequest::Subscribe { filter: None },
                &bus,
                &mut subscription,
            )
            .unwrap();
        }
        assert_eq!(bus.subscription_count(), 1);

        handle_client_request(ClientRequest::Unsubscribe, &bus, &mut subscription).unwrap();
        assert_eq!(bus.subscription_count(), 0);
    }
}
