/// Worker socket endpoint
///
/// Moves text frames between a WebSocket and a broker connection. All frame
/// semantics live in the broker; this module only does transport.

use super::routes::DEFAULT_DB_NAME;
use crate::runtime::{broker::ServerFrame, BrokerConnection, QueueBroker};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;

pub const SOCKET_PATH: &str = "/api/workflow/ws";

#[derive(Debug, Default, Deserialize)]
pub struct SocketParams {
    pub db: Option<String>,
}

/// Create the socket route
pub fn create_socket_routes() -> Router<Arc<QueueBroker>> {
    Router::new().route(SOCKET_PATH, get(ws_handler))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(broker): State<Arc<QueueBroker>>,
    Query(params): Query<SocketParams>,
) -> Response {
    let db_name = params
        .db
        .filter(|db| !db.is_empty())
        .unwrap_or_else(|| DEFAULT_DB_NAME.to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, broker, db_name))
}

async fn handle_socket(mut socket: WebSocket, broker: Arc<QueueBroker>, db_name: String) {
    let mut connection = broker.connect(&db_name);
    tracing::info!("Worker socket {} connected to '{}'", connection.id(), db_name);

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = broker.handle_frame(&connection, text.as_str()) {
                        tracing::warn!("Rejected frame from socket {}: {}", connection.id(), e);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("Socket {} receive error: {}", connection.id(), e);
                    break;
                }
            },
            outgoing = connection.recv() => {
                let Some(frame) = outgoing else { break };
                if !send_frame(&mut socket, &broker, &connection, frame).await {
                    break;
                }
            }
        }
    }

    tracing::info!("Worker socket {} disconnected", connection.id());
    broker.disconnect(connection).await;
}

/// Send one frame; a job that cannot be sent goes back to its queue
async fn send_frame(
    socket: &mut WebSocket,
    broker: &QueueBroker,
    connection: &BrokerConnection,
    frame: ServerFrame,
) -> bool {
    let text = match serde_json::to_string(&frame) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed to encode frame for socket {}: {}", connection.id(), e);
            return true;
        }
    };

    if let Err(e) = socket.send(Message::Text(text.into())).await {
        tracing::debug!("Socket {} send failed: {}", connection.id(), e);
        if let ServerFrame::Job(job) = &frame {
            broker.return_job(connection, job).await;
        }
        return false;
    }
    true
}
