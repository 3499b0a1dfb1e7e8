//! Websocket relay endpoint plus the runner notification routes.

use crate::hub::Hub;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use rdebug_core::relay::{decode_frame, encode_frame, RelayEnvelope};
use rdebug_core::OutputChannel;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub fn router(hub: Arc<Hub>) -> Router {
    let namespace = hub.config().namespace.clone();
    Router::new()
        .route(&namespace, get(ws_handler))
        .route("/alive", get(|| async { "OK" }))
        .route(
            &format!("{namespace}/runner/debug-script-start"),
            post(script_start),
        )
        .route(
            &format!("{namespace}/runner/debug-script-output"),
            post(script_output),
        )
        .route(
            &format!("{namespace}/runner/debug-script-end"),
            post(script_end),
        )
        .with_state(hub)
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(hub, socket))
}

async fn handle_socket(hub: Arc<Hub>, socket: WebSocket) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let capacity = hub.config().queue_capacity;
    let write_timeout = hub.config().write_timeout;
    let max_frame_bytes = hub.config().max_frame_bytes;

    let (out_tx, mut out_rx) = mpsc::channel::<RelayEnvelope>(capacity);
    let (in_tx, in_rx) = mpsc::channel::<RelayEnvelope>(capacity);

    let write_task = tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            let text = match encode_frame(&envelope, max_frame_bytes) {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "relay_encode_error", error = %err);
                    continue;
                }
            };
            let send = ws_sender.send(Message::Text(text));
            match tokio::time::timeout(write_timeout, send).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(event = "relay_write_error", error = %err);
                    return;
                }
                Err(_) => {
                    warn!(event = "relay_write_timeout");
                    return;
                }
            }
        }
        // The hub stopped serving this channel; the follower reconnects.
        let _ = tokio::time::timeout(write_timeout, ws_sender.send(Message::Close(None))).await;
    });
    let serve_task = tokio::spawn(hub.clone().serve_channel(in_rx, out_tx));

    while let Some(result) = ws_receiver.next().await {
        let msg = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "relay_read_error", error = %err);
                break;
            }
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Message::Close(_) => {
                info!(event = "relay_socket_close");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        match decode_frame::<RelayEnvelope>(&text, max_frame_bytes) {
            Ok(envelope) => {
                if in_tx.send(envelope).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!(event = "relay_frame_invalid", error = %err),
        }
    }

    drop(in_tx);
    let _ = serve_task.await;
    let _ = write_task.await;
}

#[derive(Debug, Deserialize)]
struct ScriptStartQuery {
    port: u16,
    #[serde(rename = "sessionName")]
    session_name: String,
}

#[derive(Debug, Deserialize)]
struct ScriptOutputQuery {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "type")]
    channel: String,
}

#[derive(Debug, Deserialize)]
struct ScriptEndQuery {
    #[serde(rename = "sessionID")]
    session_id: String,
}

/// Answers with the new session id, or `FAIL`.
async fn script_start(State(hub): State<Arc<Hub>>, Query(query): Query<ScriptStartQuery>) -> String {
    match hub
        .attach_engine("localhost", query.port, &query.session_name)
        .await
    {
        Ok(session_id) => session_id,
        Err(err) => {
            warn!(event = "runner_attach_failed", port = query.port, error = %err);
            "FAIL".to_string()
        }
    }
}

/// Answers `1` while the channel is enabled, `0` once the runner can stop
/// sending it.
async fn script_output(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<ScriptOutputQuery>,
    body: String,
) -> &'static str {
    let Ok(channel) = query.channel.parse::<OutputChannel>() else {
        return "0";
    };
    if hub.script_output(&query.session_id, channel, &body).await {
        "1"
    } else {
        "0"
    }
}

async fn script_end(State(hub): State<Arc<Hub>>, Query(query): Query<ScriptEndQuery>) -> &'static str {
    if hub.script_end(&query.session_id).await {
        "OK"
    } else {
        "FAIL"
    }
}
