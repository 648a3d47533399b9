//! Per-client WebSocket handling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tandem_core::protocol::{self, BridgeMessage, SendPrompt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{RemotePrompt, Shared};

/// Axum state for one server run.
#[derive(Clone)]
pub(super) struct PeerContext {
    pub(super) shared: Arc<Shared>,
    pub(super) shutdown: CancellationToken,
    pub(super) tracker: TaskTracker,
}

/// Upgrade any request to a bridge connection; plain HTTP gets 400.
pub(super) async fn upgrade(
    State(ctx): State<PeerContext>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(%remote, reason = %rejection, "Rejected non-WebSocket request");
            return (StatusCode::BAD_REQUEST, "WebSocket upgrade required").into_response();
        }
    };
    if ctx.shutdown.is_cancelled() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let tracker = ctx.tracker.clone();
    ws.on_upgrade(move |socket| tracker.track_future(serve_peer(socket, ctx, remote)))
}

async fn serve_peer(socket: WebSocket, ctx: PeerContext, remote: SocketAddr) {
    let id = Uuid::new_v4();
    let shared = &ctx.shared;
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(shared.config.client_buffer);

    {
        // Register under the state lock so the newest state always arrives.
        let last_state = shared.last_state.read().await;
        if let Some(frame) = last_state.as_ref() {
            let _ = outbound_tx.try_send(frame.clone());
        }
        shared.registry.insert(id, outbound_tx).await;
    }
    info!(connection_id = %id, %remote, "Bridge client connected");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            () = ctx.shutdown.cancelled() => {
                let frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: "server stopping".into(),
                };
                let close = async {
                    if sink.send(Message::Close(Some(frame))).await.is_ok() {
                        await_close(&mut stream).await;
                    }
                };
                if tokio::time::timeout(shared.config.close_timeout, close).await.is_err() {
                    debug!(connection_id = %id, "Close handshake timed out");
                }
                break;
            }
            outbound = outbound_rx.recv() => {
                let Some(text) = outbound else {
                    debug!(connection_id = %id, "Evicted from registry");
                    break;
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!(connection_id = %id, error = %e, "Send failed");
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => handle_frame(shared, id, text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection_id = %id, error = %e, "Receive failed");
                    break;
                }
            },
        }
    }

    shared.registry.remove(&id).await;
    info!(connection_id = %id, "Bridge client disconnected");
}

async fn await_close(stream: &mut SplitStream<WebSocket>) {
    while let Some(Ok(message)) = stream.next().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }
}

async fn handle_frame(shared: &Shared, id: Uuid, text: &str) {
    match protocol::decode(text) {
        Ok(BridgeMessage::SendPrompt(SendPrompt { prompt })) => {
            debug!(connection_id = %id, len = prompt.len(), "Prompt received");
            let request = RemotePrompt {
                connection_id: Some(id),
                prompt,
            };
            if shared.prompt_tx.send(request).await.is_err() {
                warn!(connection_id = %id, "Prompt consumer gone, dropping prompt");
            }
        }
        Ok(other) => {
            debug!(connection_id = %id, msg_type = other.type_name(), "Ignoring client message");
        }
        Err(e) => warn!(connection_id = %id, error = %e, "Malformed client frame"),
    }
}

/// Overall bound for [`super::BridgeServer::stop`] once every connection has
/// had its own close window.
pub(super) const fn stop_budget(close_timeout: Duration) -> Duration {
    close_timeout.saturating_add(Duration::from_millis(500))
}
