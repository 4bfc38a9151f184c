//! WebSocket event stream at `/api/ws`
//!
//! Every [`SystemEvent`] is forwarded as JSON. Clients may narrow the
//! stream with `{"type": "subscribe", "payload": {"topics": ["channel.*"]}}`.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::SystemEvent;
use crate::state::AppState;

const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Client-to-server message
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload")]
enum ClientMessage {
    #[serde(rename = "subscribe")]
    Subscribe { topics: Vec<String> },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { topics: Vec<String> },

    #[serde(rename = "ping")]
    Ping,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut event_rx = state.events.subscribe();
    let mut topics: Vec<String> = vec!["*".to_string()];
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    info!("Event WebSocket client connected");

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_client_message(&text, &mut topics) {
                            warn!("Ignoring malformed WebSocket message: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("WebSocket receive error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            event = event_rx.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket client lagged by {} events", n);
                        SystemEvent::SystemError {
                            module: "ws".to_string(),
                            message: format!("Lagged by {} events", n),
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                if !should_send_event(&event, &topics) {
                    continue;
                }
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to serialize event: {}", e),
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
            }
        }
    }

    info!("Event WebSocket client disconnected");
}

fn handle_client_message(text: &str, topics: &mut Vec<String>) -> serde_json::Result<()> {
    match serde_json::from_str::<ClientMessage>(text)? {
        ClientMessage::Subscribe { topics: new_topics } => {
            debug!("Client subscribed to topics: {:?}", new_topics);
            *topics = new_topics;
        }
        ClientMessage::Unsubscribe { topics: removed } => {
            topics.retain(|t| !removed.contains(t));
        }
        ClientMessage::Ping => {}
    }
    Ok(())
}

fn should_send_event(event: &SystemEvent, topics: &[String]) -> bool {
    topics.iter().any(|topic| event.matches_topic(topic))
}
