//! WebSocket transport.
//!
//! Opens `ws(s)://{host}{app_url}/connect` (or `/reconnect`) and splits the
//! socket into a writer task fed by a channel and a reader task that decodes
//! frames and hands them to the connection.

use super::{Transport, process_messages};
use crate::{
    connection::Connection,
    error::{Result, SignalRError, TransportError},
    negotiate::NegotiateResponse,
    protocol::{InboundFrame, JsonCodec},
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Message, client::IntoClientRequest},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const NAME: &str = "webSockets";

/// Handles to the tasks of an open socket.
struct Socket {
    outgoing: mpsc::UnboundedSender<Message>,
    closing: CancellationToken,
}

/// The WebSocket transport.
#[derive(Default)]
pub struct WebSocketTransport {
    socket: Mutex<Option<Socket>>,
    connection: Mutex<Weak<Connection>>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Builds the connect/reconnect URL for `connection`.
pub(crate) fn websocket_url(connection: &Connection, reconnecting: bool) -> Result<Url> {
    let base = connection.base_url();
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    let host = base.host_str().ok_or(url::ParseError::EmptyHost)?;
    let authority = match base.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let mut path = String::new();
    for segment in connection
        .app_relative_url()
        .split('/')
        .filter(|s| !s.is_empty())
    {
        path.push('/');
        path.push_str(segment);
    }
    path.push_str(if reconnecting { "/reconnect" } else { "/connect" });

    let mut url = Url::parse(&format!("{scheme}://{authority}{path}"))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("transport", NAME);
        if let Some(groups_token) = connection.groups_token() {
            query.append_pair("groupsToken", &groups_token);
        }
        if reconnecting {
            if let Some(message_id) = connection.message_id() {
                query.append_pair("messageId", &message_id);
            }
        }
    }
    connection.prepare_query(&mut url);

    let tid: u8 = rand::rng().random_range(0..=10);
    url.query_pairs_mut().append_pair("tid", &tid.to_string());
    Ok(url)
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    fn is_supported(&self, negotiated: &NegotiateResponse) -> bool {
        negotiated.try_web_sockets
    }

    fn supports_keep_alive(&self) -> bool {
        true
    }

    async fn start(&self, connection: &Arc<Connection>, reconnecting: bool) -> Result<()> {
        if self.socket.lock().is_some() {
            debug!("WebSocket already open, ignoring start.");
            return Ok(());
        }
        *self.connection.lock() = Arc::downgrade(connection);

        let url = websocket_url(connection, reconnecting)?;
        debug!(reconnecting, "Connecting to {url}");

        let request = url.as_str().into_client_request()?;
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| SignalRError::transport(NAME, TransportError::ConnectFailed(e)))?;
        info!("WebSocket opened.");

        let (mut sink, mut stream) = ws_stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let closing = CancellationToken::new();
        let (init_tx, init_rx) = oneshot::channel();
        let mut on_initialized = (!reconnecting).then_some(init_tx);

        *self.socket.lock() = Some(Socket {
            outgoing,
            closing: closing.clone(),
        });
        connection.on_transport_open();

        let writer_closing = closing.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = writer_closing.cancelled() => break,
                    message = outgoing_rx.recv() => match message {
                        Some(message) => {
                            if let Err(e) = sink.send(message).await {
                                warn!("WebSocket write failed: {e}");
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = sink.close().await;
        });

        let reader_connection = Arc::downgrade(connection);
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = closing.cancelled() => return,
                    message = stream.next() => message,
                };
                let Some(connection) = reader_connection.upgrade() else {
                    return;
                };
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&connection, text.as_str(), &mut on_initialized).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket read failed: {e}");
                        break;
                    }
                }
            }

            if closing.is_cancelled() {
                return;
            }
            closing.cancel();
            if let Some(connection) = reader_connection.upgrade() {
                connection.emit_error(SignalRError::transport(NAME, TransportError::Closed));
                connection.reconnect().await;
            }
        });

        if reconnecting {
            return Ok(());
        }
        init_rx
            .await
            .map_err(|_| SignalRError::transport(NAME, TransportError::NotInitialized))
    }

    async fn send(&self, connection: &Connection, payload: String) -> Result<()> {
        let outgoing = self
            .socket
            .lock()
            .as_ref()
            .filter(|socket| !socket.closing.is_cancelled())
            .map(|socket| socket.outgoing.clone());

        let sent = outgoing.is_some_and(|tx| tx.send(Message::Text(payload.into())).is_ok());
        if sent {
            return Ok(());
        }

        let error = SignalRError::transport(NAME, TransportError::InvalidState);
        warn!("{error}");
        connection.emit_error(SignalRError::transport(NAME, TransportError::InvalidState));
        Err(error)
    }

    async fn stop(&self) {
        let connection = self.connection.lock().upgrade();
        if let Some(connection) = connection {
            connection.clear_reconnect_timer();
        }
        if let Some(socket) = self.socket.lock().take() {
            debug!("Closing WebSocket.");
            socket.closing.cancel();
        }
    }
}

async fn handle_text(
    connection: &Connection,
    text: &str,
    on_initialized: &mut Option<oneshot::Sender<()>>,
) {
    match JsonCodec::decode(text) {
        Ok(Some(InboundFrame::Persistent(frame))) => {
            process_messages(connection, frame, on_initialized).await;
        }
        Ok(Some(InboundFrame::Direct(message))) => connection.emit_received(message),
        Ok(None) => {}
        Err(e) => warn!(transport = NAME, "Dropping undecodable message: {e}"),
    }
}
