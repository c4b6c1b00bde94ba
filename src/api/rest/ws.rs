use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| stream_events(socket, state))
}

/// Pushes pickup lifecycle events to one subscriber. The feed is advisory:
/// the pickup row in the store is the source of truth, so a subscriber that
/// falls behind the broadcast buffer skips the backlog and resumes from the
/// head instead of being disconnected.
async fn stream_events(socket: WebSocket, state: Arc<AppState>) {
    let mut events = state.pickup_events_tx.subscribe();
    let (mut sink, mut stream) = socket.split();

    info!("pickup event subscriber connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let frame = match serde_json::to_string(&event) {
                        Ok(json) => Message::Text(json),
                        Err(err) => {
                            warn!(error = %err, "failed to serialize pickup event");
                            continue;
                        }
                    };
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagging; dropping backlog");
                }
                Err(RecvError::Closed) => break,
            },
            // Subscribers send nothing the dispatcher acts on; a close frame
            // or transport error ends the stream.
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!("pickup event subscriber disconnected");
}
