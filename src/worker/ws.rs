use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

use crate::household::{OutboundFrame, Persona};
use crate::limit::client_ip;

use super::WorkerState;

const CLOSE_UNSUPPORTED: u16 = 1003;
const CLOSE_RATE_LIMITED: u16 = 1008;
const CLOSE_AT_CAPACITY: u16 = 1013;
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// The persona WebSocket endpoint. Plain HTTP requests on this path belong
/// on the main server's lookup endpoint, so they get a 400 pointing back.
pub(super) async fn household_endpoint(
    State(state): State<WorkerState>,
    Path(persona_key): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, axum::extract::ws::rejection::WebSocketUpgradeRejection>,
) -> Response {
    let Ok(ws) = ws else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "HTTP lookup requests are not served by dedicated workers",
                "persona": state.persona.as_str(),
                "port": state.port,
            })),
        )
            .into_response();
    };

    let ip = client_ip(&headers, peer);
    let exempt = state.limiter.is_exempt(&headers);
    ws.on_upgrade(move |socket| handle_socket(state, socket, persona_key, ip, exempt))
}

async fn handle_socket(
    state: WorkerState,
    mut socket: WebSocket,
    persona_key: String,
    ip: std::net::IpAddr,
    exempt: bool,
) {
    if Persona::from_key(&persona_key.to_ascii_lowercase()) != Some(state.persona) {
        close_with(&mut socket, CLOSE_UNSUPPORTED, "Unsupported persona").await;
        return;
    }

    let _ws_guard = if exempt {
        None
    } else {
        match state.limiter.acquire_websocket(ip) {
            Ok(guard) => Some(guard),
            Err(err) => {
                tracing::warn!(%ip, error = %err, "websocket admission refused");
                close_with(&mut socket, CLOSE_RATE_LIMITED, &err.to_string()).await;
                return;
            }
        }
    };

    let (session, out_rx) = match state.engine.register() {
        Ok(pair) => pair,
        Err(err) => {
            tracing::warn!(%ip, error = %err, "session admission refused");
            close_with(&mut socket, CLOSE_AT_CAPACITY, &err.to_string()).await;
            return;
        }
    };
    let session_id = session.id().to_owned();

    let (sink, mut stream) = socket.split();
    let writer = spawn_writer(sink, out_rx);

    state.engine.announce(&session).await;

    // Message loop: bounded receive timeout so a silent peer cannot pin
    // this task; the loop also ends once the scheduler unregisters the
    // session.
    while state.engine.get(&session_id).is_some() {
        let frame = match tokio::time::timeout(RECEIVE_TIMEOUT, stream.next()).await {
            Err(_elapsed) => continue,
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                tracing::debug!(session = %session_id, error = %err, "receive error");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            Message::Text(text) => {
                state.engine.handle_text(&session, text.as_str()).await;
            }
            Message::Binary(payload) => {
                state.engine.handle_binary(&session, payload.len() as u64);
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }

    // Peer disconnects are normal termination: unregister, cancel the
    // latency task, and let the writer drain the final frames. The
    // rate-limit slot releases when the guard drops, on every path out of
    // this function.
    state.engine.stop_session(&session_id).await;
    drop(session);
    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
        abort.abort();
    }
    tracing::debug!(session = %session_id, "socket handler finished");
}

fn spawn_writer(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<OutboundFrame>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let message = match frame {
                OutboundFrame::Text(text) => Message::Text(text.into()),
                OutboundFrame::Binary(chunk) => Message::Binary(chunk),
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
        drop(sink.send(Message::Close(None)).await);
    })
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_owned().into(),
    };
    drop(socket.send(Message::Close(Some(frame))).await);
}
