//! Bridge connection client.
//!
//! Manages the WebSocket connection to a tandem-daemon bridge, directly or
//! through its dev tunnel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tandem_core::protocol::{
    self, BridgeMessage, ChatMessage, CodecError, SessionState, ToolEvent,
};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Header carrying the tunnel access token.
pub const TUNNEL_AUTH_HEADER: &str = "X-Tunnel-Authorization";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Wait for the close handshake on disconnect.
    pub close_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(2),
        }
    }
}

/// Everything the client reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ConnectionChanged(bool),
    State(SessionState),
    Chat(ChatMessage),
    Tool(ToolEvent),
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid bridge URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    Send(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Turn a share URL into the WebSocket endpoint.
///
/// `https` maps to `wss`, `http` to `ws`; an empty path becomes `/`.
pub fn normalize_url(url: &str) -> Result<String, ClientError> {
    let url = url.trim();
    let (scheme, rest) = if let Some(rest) = url.strip_prefix("https://") {
        ("wss://", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        ("ws://", rest)
    } else if let Some(rest) = url.strip_prefix("wss://") {
        ("wss://", rest)
    } else if let Some(rest) = url.strip_prefix("ws://") {
        ("ws://", rest)
    } else {
        return Err(ClientError::InvalidUrl(url.to_string()));
    };

    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(authority_end);
    if authority.is_empty() {
        return Err(ClientError::InvalidUrl(url.to_string()));
    }
    if tail.starts_with('/') {
        Ok(format!("{scheme}{rest}"))
    } else {
        Ok(format!("{scheme}{authority}/{tail}"))
    }
}

struct Link {
    sink: WsSink,
    reader: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Remote side of the bridge.
pub struct BridgeClient {
    config: ClientConfig,
    events_tx: mpsc::Sender<ClientEvent>,
    link: Mutex<Option<Link>>,
    connected: Arc<AtomicBool>,
    server_url: std::sync::Mutex<Option<String>>,
}

impl BridgeClient {
    pub fn new(config: ClientConfig, events_tx: mpsc::Sender<ClientEvent>) -> Self {
        Self {
            config,
            events_tx,
            link: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            server_url: std::sync::Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Normalized URL of the current connection.
    pub fn server_url(&self) -> Option<String> {
        self.server_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Connect to `url`, replacing any existing connection.
    pub async fn connect(&self, url: &str, token: Option<&str>) -> Result<(), ClientError> {
        if self.link.lock().await.is_some() {
            self.disconnect().await;
        }

        let url = normalize_url(url)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("tunnel {token}"))
                .map_err(|e| ClientError::Connect(format!("invalid token: {e}")))?;
            request.headers_mut().insert(TUNNEL_AUTH_HEADER, value);
        }

        info!(url, "Connecting to bridge");
        let stream = match tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => return Err(self.connect_failed(e.to_string()).await),
            Err(_) => return Err(self.connect_failed("timed out".to_string()).await),
        };

        let (sink, stream) = stream.split();
        let cancel = CancellationToken::new();
        self.connected.store(true, Ordering::SeqCst);
        *self
            .server_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(url.clone());
        self.emit(ClientEvent::ConnectionChanged(true)).await;

        let reader = tokio::spawn(read_loop(
            stream,
            self.events_tx.clone(),
            cancel.clone(),
            Arc::clone(&self.connected),
        ));
        *self.link.lock().await = Some(Link {
            sink: Arc::new(Mutex::new(sink)),
            reader,
            cancel,
        });
        info!(url, "Connected to bridge");
        Ok(())
    }

    /// Submit a prompt to the host session. Fire-and-forget.
    pub async fn send_prompt(&self, text: &str) -> Result<(), ClientError> {
        let sink = {
            let link = self.link.lock().await;
            match link.as_ref() {
                Some(link) if self.is_connected() => Arc::clone(&link.sink),
                _ => return Err(ClientError::NotConnected),
            }
        };
        let frame = protocol::encode(&BridgeMessage::send_prompt(text))?;
        sink.lock()
            .await
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| ClientError::Send(e.to_string()))
    }

    /// Close the connection. Always reports `ConnectionChanged(false)`.
    pub async fn disconnect(&self) {
        let link = self.link.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
        *self
            .server_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;

        if let Some(link) = link {
            link.cancel.cancel();
            let close = async {
                let mut sink = link.sink.lock().await;
                if sink.send(Message::Close(None)).await.is_ok() {
                    let _ = sink.close().await;
                }
            };
            if tokio::time::timeout(self.config.close_timeout, close).await.is_err() {
                debug!("Close handshake timed out");
            }
            let abort = link.reader.abort_handle();
            if tokio::time::timeout(self.config.close_timeout, link.reader).await.is_err() {
                abort.abort();
            }
            info!("Disconnected from bridge");
        }
        self.emit(ClientEvent::ConnectionChanged(false)).await;
    }

    async fn connect_failed(&self, reason: String) -> ClientError {
        warn!(reason, "Bridge connection failed");
        self.connected.store(false, Ordering::SeqCst);
        self.emit(ClientEvent::ConnectionChanged(false)).await;
        ClientError::Connect(reason)
    }

    async fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event).await;
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    events_tx: mpsc::Sender<ClientEvent>,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = stream.next() => message,
        };
        let event = match message {
            Some(Ok(Message::Text(text))) => match protocol::decode(text.as_str()) {
                Ok(BridgeMessage::SessionState(state)) => ClientEvent::State(state),
                Ok(BridgeMessage::ChatMessage(chat)) => ClientEvent::Chat(chat),
                Ok(BridgeMessage::ToolEvent(tool)) => ClientEvent::Tool(tool),
                Ok(other) => {
                    debug!(msg_type = other.type_name(), "Ignoring server message");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Malformed server frame");
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "Server closed the connection");
                break;
            }
            None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(error = %e, "Bridge receive failed");
                break;
            }
        };
        if events_tx.send(event).await.is_err() {
            break;
        }
    }

    if connected.swap(false, Ordering::SeqCst) {
        let _ = events_tx.send(ClientEvent::ConnectionChanged(false)).await;
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn https_share_url_becomes_wss() {
        assert_eq!(
            normalize_url("https://abc-4322.usw2.devtunnels.ms").unwrap(),
            "wss://abc-4322.usw2.devtunnels.ms/"
        );
    }

    #[test]
    fn http_becomes_ws_and_slash_is_not_doubled() {
        assert_eq!(
            normalize_url("http://127.0.0.1:4322/").unwrap(),
            "ws://127.0.0.1:4322/"
        );
        assert_eq!(
            normalize_url(" ws://localhost:4322 ").unwrap(),
            "ws://localhost:4322/"
        );
    }

    #[test]
    fn slash_goes_before_query_and_fragment() {
        assert_eq!(
            normalize_url("https://abc.usw2.devtunnels.ms/?x=1").unwrap(),
            "wss://abc.usw2.devtunnels.ms/?x=1"
        );
        assert_eq!(
            normalize_url("https://abc.usw2.devtunnels.ms?x=1").unwrap(),
            "wss://abc.usw2.devtunnels.ms/?x=1"
        );
        assert_eq!(
            normalize_url("http://127.0.0.1:4322#chat").unwrap(),
            "ws://127.0.0.1:4322/#chat"
        );
        assert_eq!(
            normalize_url("wss://host/bridge").unwrap(),
            "wss://host/bridge"
        );
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(matches!(
            normalize_url("ftp://host"),
            Err(ClientError::InvalidUrl(_))
        ));
        assert!(matches!(normalize_url("host:4322"), Err(ClientError::InvalidUrl(_))));
        assert!(matches!(normalize_url("https://"), Err(ClientError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn send_without_connection_fails() {
        let (tx, _rx) = mpsc::channel(4);
        let client = BridgeClient::new(ClientConfig::default(), tx);
        assert!(matches!(
            client.send_prompt("hi").await,
            Err(ClientError::NotConnected)
        ));
        assert!(client.server_url().is_none());
    }

    #[tokio::test]
    async fn refused_connection_reports_disconnected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (tx, mut rx) = mpsc::channel(4);
        let client = BridgeClient::new(ClientConfig::default(), tx);
        let err = client
            .connect(&format!("http://127.0.0.1:{port}"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Connect(_)));
        assert_eq!(rx.recv().await, Some(ClientEvent::ConnectionChanged(false)));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn disconnect_always_reports() {
        let (tx, mut rx) = mpsc::channel(4);
        let client = BridgeClient::new(ClientConfig::default(), tx);
        client.disconnect().await;
        assert_eq!(rx.recv().await, Some(ClientEvent::ConnectionChanged(false)));
    }
}
