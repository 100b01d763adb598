use std::collections::HashMap;

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;

use super::http_server::AppState;
use crate::api::protocol::DaemonMessage;
use crate::hub::{
    CLOSE_INVALID_TOKEN, CLOSE_TOKEN_NOT_CONFIGURED, OUTBOUND_CHANNEL_SIZE, close_message,
};

/// WebSocket handler for the /ws/daemon endpoint.
///
/// Daemons authenticate with a `?token=` query parameter checked against
/// the configured daemon auth token. There is no localhost exemption.
pub async fn ws_daemon_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let token = params.get("token").cloned();
    ws.on_upgrade(move |socket| handle_daemon_socket(socket, token, state))
}

/// Decide whether a daemon connection may proceed; on rejection returns
/// the close code and reason. There is no localhost exemption.
fn check_daemon_token(
    configured: Option<&str>,
    presented: Option<&str>,
) -> Result<(), (u16, &'static str)> {
    let Some(configured) = configured else {
        return Err((
            CLOSE_TOKEN_NOT_CONFIGURED,
            "daemon auth token not configured",
        ));
    };
    if presented != Some(configured) {
        return Err((CLOSE_INVALID_TOKEN, "invalid daemon token"));
    }
    Ok(())
}

async fn handle_daemon_socket(socket: WebSocket, token: Option<String>, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Token wall: reject before any frame is processed.
    let configured = state.broker.config.daemon_auth_token();
    if let Err((code, reason)) = check_daemon_token(configured.as_deref(), token.as_deref()) {
        tracing::warn!(code, reason, "Daemon connection rejected");
        let _ = ws_sender.send(close_message(code, reason)).await;
        return;
    }

    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_CHANNEL_SIZE);
    let conn_id = state.broker.daemon_connected(tx);
    tracing::info!(conn_id = %conn_id, "Daemon connected");

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(message) => {
                        let closing = matches!(message, Message::Close(_));
                        if ws_sender.send(message).await.is_err() {
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    // Hub evicted this connection.
                    None => break,
                }
            }
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<DaemonMessage>(&text) {
                            Ok(frame) => state.broker.daemon_message(conn_id, frame),
                            Err(err) => {
                                tracing::warn!(error = %err, "Invalid daemon frame, skipping");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "Daemon socket error");
                        break;
                    }
                }
            }
        }
    }

    state.broker.daemon_closed(conn_id);
    tracing::info!(conn_id = %conn_id, "Daemon socket closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_server_token_closes_with_4003() {
        assert_eq!(
            check_daemon_token(None, Some("anything")).unwrap_err().0,
            CLOSE_TOKEN_NOT_CONFIGURED
        );
        assert_eq!(check_daemon_token(None, None).unwrap_err().0, CLOSE_TOKEN_NOT_CONFIGURED);
    }

    #[test]
    fn wrong_or_absent_token_closes_with_4001() {
        assert_eq!(
            check_daemon_token(Some("secret"), Some("wrong")).unwrap_err().0,
            CLOSE_INVALID_TOKEN
        );
        assert_eq!(
            check_daemon_token(Some("secret"), None).unwrap_err().0,
            CLOSE_INVALID_TOKEN
        );
    }

    #[test]
    fn matching_token_proceeds() {
        assert!(check_daemon_token(Some("secret"), Some("secret")).is_ok());
    }
}
