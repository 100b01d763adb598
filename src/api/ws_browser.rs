use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;

use super::http_server::AppState;
use crate::api::protocol::BrowserMessage;
use crate::hub::OUTBOUND_CHANNEL_SIZE;

/// WebSocket handler for the /ws/browser endpoint.
///
/// Browsers authenticate with the session cookie carried on the upgrade
/// request; there is no token.
pub async fn ws_browser_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let cookie_header = headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let user = match state.auth.authenticate(cookie_header).await {
        Ok(Some(user)) => user,
        Ok(None) => return StatusCode::UNAUTHORIZED.into_response(),
        Err(err) => {
            tracing::error!(error = %err, "Session lookup failed on browser upgrade");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    tracing::debug!(username = %user.username, "Browser upgrade authenticated");
    ws.on_upgrade(move |socket| handle_browser_socket(socket, state))
}

async fn handle_browser_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_CHANNEL_SIZE);
    // Registration also enqueues the initial state snapshot:
    // environments, then worktrees, then processes.
    let conn_id = state.broker.browser_connected(tx);
    tracing::info!(conn_id = %conn_id, "Browser connected");

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(message) => {
                        if ws_sender.send(message).await.is_err() {
                            break;
                        }
                    }
                    // Evicted as a slow consumer.
                    None => break,
                }
            }
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<BrowserMessage>(&text) {
                            Ok(frame) => state.broker.browser_message(conn_id, frame),
                            Err(err) => {
                                tracing::debug!(error = %err, "Ignoring invalid browser frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "Browser socket error");
                        break;
                    }
                }
            }
        }
    }

    state.broker.browser_closed(conn_id);
    tracing::info!(conn_id = %conn_id, "Browser socket closed");
}
