// ============================
// crates/backend-lib/src/ws_router.rs
// ============================
//! Router and WebSocket connection handling.
use crate::error::AppError;
use crate::handlers::{lock_state, TokenQuery};
use crate::ids::{ConnectionId, UserIdentity};
use crate::lifecycle::ConnectionEvent;
use crate::metrics::{WS_ACTIVE, WS_CONNECTION, WS_OVERFLOW};
use crate::presence::{Outbound, OUTBOUND_QUEUE_CAPACITY};
use crate::validation;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use chapterlock_common::{ClientToServer, ServerToClient};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route(
            "/stories/{story_id}/chapters/{chapter_id}/lock",
            get(lock_state::chapter_lock),
        )
        .route("/stories/{story_id}/locks", get(lock_state::story_locks))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "Healthy"
}

/// Handler for WebSocket connections. The caller is authenticated before the
/// upgrade; a rejected caller never reaches the coordinator.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let user = state
        .authenticate(&headers, query.token.as_deref())
        .await
        .inspect_err(|e| tracing::warn!(error = %e, "websocket upgrade rejected"))?;

    Ok(ws.on_upgrade(move |socket| handle_connection(socket, state, user)))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, user: UserIdentity) {
    let (mut sink, mut stream) = socket.split();

    // Sends never wait: broadcasts are enqueued under a chapter guard. A full queue drops the socket.
    let (outbound, mut outbound_rx) = Outbound::channel(OUTBOUND_QUEUE_CAPACITY);
    let connection_id = state.lifecycle.connect(user, outbound.clone());

    counter!(WS_CONNECTION).increment(1);
    gauge!(WS_ACTIVE).increment(1.0);

    // Forward queued server messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(server_msg) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&server_msg) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize server message");
                    continue;
                },
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(&state, connection_id, text.as_str(), &outbound),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}, // pings are answered by axum; binary frames are not part of the protocol
            },
            () = outbound.overflowed() => {
                tracing::warn!(%connection_id, capacity = OUTBOUND_QUEUE_CAPACITY, "client is not draining its queue, dropping connection");
                counter!(WS_OVERFLOW).increment(1);
                break;
            },
        }
    }

    // Cleanup: release every held lease when the connection drops, however it ended
    state.lifecycle.disconnect(connection_id);

    gauge!(WS_ACTIVE).decrement(1.0);

    send_task.abort();
}

fn handle_frame(state: &AppState, connection_id: ConnectionId, text: &str, outbound: &Outbound) {
    let client_msg = match serde_json::from_str::<ClientToServer>(text) {
        Ok(client_msg) => client_msg,
        Err(e) => {
            tracing::debug!(%connection_id, error = %e, "malformed frame");
            let _ = outbound.send(ServerToClient::MalformedMessage {
                err_msg: e.to_string(),
            });
            return;
        },
    };

    let result = validation::validate_client_message(&client_msg)
        .map_err(AppError::from)
        .and_then(|()| {
            state
                .lifecycle
                .handle(connection_id, ConnectionEvent::from(client_msg))
        });

    if let Err(e) = result {
        tracing::warn!(%connection_id, code = e.error_code(), error = %e, "request rejected");
        let _ = outbound.send(e.to_server_message());
    }
}
