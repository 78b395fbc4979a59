//! WebSocket surface for the hub.
//!
//! Each connection gets a writer task draining the session queue into the
//! socket and a reader loop feeding client frames to the hub. Either side
//! ending closes the session, which stops the other.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::streaming::hub::{Hub, HubStats};
use crate::streaming::message::ServerMessage;
use crate::streaming::session::SessionMetadata;

/// `/ws` for clients and `/health` for hub statistics.
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(hub)
}

async fn health(State(hub): State<Arc<Hub>>) -> Json<HubStats> {
    Json(hub.stats())
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let metadata = SessionMetadata {
        remote_addr: Some(addr.to_string()),
        user_agent,
        connected_at: Utc::now(),
    };
    let max_message_size = hub.config().max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, hub, metadata))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, metadata: SessionMetadata) {
    let (mut sink, mut stream) = socket.split();

    let (session, mut queue) = match hub.register(metadata) {
        Ok(registered) => registered,
        Err(e) => {
            if let Ok(text) = ServerMessage::error(e.to_string()).to_json() {
                let _ = sink.send(Message::Text(text.into())).await;
            }
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    let client_id = session.client_id().to_string();
    let write_timeout = hub.config().write_timeout;

    let writer = {
        let hub = Arc::clone(&hub);
        let client_id = client_id.clone();
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = queue.recv() => {
                        let Some(text) = next else { break };
                        match tokio::time::timeout(write_timeout, sink.send(Message::Text(text))).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                debug!(client_id = %client_id, error = %e, "websocket write failed");
                                break;
                            }
                            Err(_) => {
                                hub.evict(&client_id, "write_timeout");
                                break;
                            }
                        }
                    }
                    _ = session.closed() => break,
                }
            }
            hub.unregister(&client_id);
            let _ = tokio::time::timeout(write_timeout, sink.send(Message::Close(None))).await;
        })
    };

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = hub.handle_client_message(&client_id, text.as_str()) {
                        debug!(client_id = %client_id, error = %e, "dropping message for closed session");
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    hub.send_error(&client_id, "binary messages are not supported");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => session.touch(Utc::now()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(client_id = %client_id, error = %e, "websocket read failed");
                    break;
                }
            },
            _ = session.closed() => break,
        }
    }

    hub.unregister(&client_id);
    if let Err(e) = writer.await {
        warn!(client_id = %client_id, error = %e, "websocket writer task failed");
    }
}
