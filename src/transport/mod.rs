//! Transports carrying the persistent connection.
//!
//! A [`Transport`] owns a socket for the lifetime of one connection attempt.
//! The [`Connection`] only holds a shared handle to the active transport, and
//! transports never keep the connection alive on their own.

mod selector;
mod websocket;

pub use selector::{select_transport, supported_transports};
pub use websocket::WebSocketTransport;

use crate::connection::Connection;
use crate::error::Result;
use crate::negotiate::endpoint_url;
use crate::protocol::PersistentResponse;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A persistent-connection transport.
///
/// Implementations must be cheap to share: the client keeps every candidate
/// as an `Arc<dyn Transport>` and binds the winner to the connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Wire name sent as the `transport` query parameter, e.g. `webSockets`.
    fn name(&self) -> &'static str;

    /// Whether the server allows this transport for the session.
    fn is_supported(&self, negotiated: &crate::negotiate::NegotiateResponse) -> bool;

    /// Whether the server sends keep-alives over this transport.
    fn supports_keep_alive(&self) -> bool;

    /// Opens the transport.
    ///
    /// A fresh start resolves once the server acknowledged the session. A
    /// reconnecting start resolves as soon as the socket is open.
    async fn start(&self, connection: &Arc<Connection>, reconnecting: bool) -> Result<()>;

    /// Writes one payload.
    async fn send(&self, connection: &Connection, payload: String) -> Result<()>;

    /// Closes the socket. Calling it more than once is harmless.
    async fn stop(&self);

    /// Tells the server the connection is going away.
    async fn abort(&self, connection: &Connection) -> Result<()> {
        send_abort(connection, self.name()).await
    }

    /// Called by the keep-alive monitor when the server went silent.
    async fn lost_connection(&self, connection: &Arc<Connection>) {
        connection.reconnect().await;
    }
}

/// Applies a persistent-connection envelope to the connection.
///
/// Messages are emitted in array order. The first envelope carrying the
/// initialized flag completes `on_initialized`; a disconnect command stops
/// the connection without notifying the server.
pub async fn process_messages(
    connection: &Connection,
    frame: PersistentResponse,
    on_initialized: &mut Option<oneshot::Sender<()>>,
) {
    connection.mark_last_message();
    connection.update_groups(frame.groups_token.as_deref());
    connection.update_message_id(frame.message_id.as_deref());

    for message in frame.messages {
        connection.emit_received(message);
    }

    if frame.initialized {
        if let Some(initialized) = on_initialized.take() {
            let _ = initialized.send(());
        }
    }

    if frame.disconnect {
        debug!("Disconnect command received from server.");
        if let Err(e) = connection.stop(false).await {
            warn!("Error while stopping after a disconnect command: {e}");
        }
    }
}

/// Sends `POST {base}/abort?transport=...` for the given connection.
///
/// A rejected abort is logged, not returned: the connection is going away
/// regardless.
pub async fn send_abort(connection: &Connection, transport: &'static str) -> Result<()> {
    let mut url = endpoint_url(connection.base_url(), "abort");
    url.query_pairs_mut().append_pair("transport", transport);
    connection.prepare_query(&mut url);

    debug!(transport, "Sending abort request: {url}");
    let response = connection.http().post(&url).await?;
    if !response.status.is_success() {
        warn!(transport, "Abort request returned {}", response.status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionEvent, ConnectionState};
    use crate::protocol::JsonCodec;
    use crate::testing::{MockTransport, connection_for, negotiated};
    use serde_json::json;

    fn envelope(value: serde_json::Value) -> PersistentResponse {
        match JsonCodec::decode_value(value).unwrap() {
            Some(crate::protocol::InboundFrame::Persistent(frame)) => frame,
            other => panic!("Expected an envelope, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_process_messages_in_order_and_initializes_once() {
        let (connection, _events, mut inbound) = connection_for(negotiated("1.4", true, None));
        let (tx, mut rx) = oneshot::channel();
        let mut on_initialized = Some(tx);

        process_messages(
            &connection,
            envelope(json!({"C": "d-1", "S": 1, "G": "g-1", "M": [{"I": "1"}, {"I": "2"}]})),
            &mut on_initialized,
        )
        .await;

        assert!(on_initialized.is_none());
        assert!(rx.try_recv().is_ok());
        assert_eq!(connection.message_id().as_deref(), Some("d-1"));
        assert_eq!(connection.groups_token().as_deref(), Some("g-1"));
        assert_eq!(inbound.recv().await.unwrap(), json!({"I": "1"}));
        assert_eq!(inbound.recv().await.unwrap(), json!({"I": "2"}));

        // A second init flag is a no-op.
        process_messages(&connection, envelope(json!({"S": 1, "M": []})), &mut on_initialized).await;
        assert_eq!(connection.message_id().as_deref(), Some("d-1"));
    }

    #[tokio::test]
    async fn test_process_messages_disconnect_command() {
        let (connection, mut events, _inbound) = connection_for(negotiated("1.4", true, None));
        let transport = MockTransport::succeeding("mock");
        assert!(connection.start(transport.clone()));

        process_messages(&connection, envelope(json!({"D": 1, "M": []})), &mut None).await;

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(transport.stop_count(), 1);
        let disconnected = std::iter::from_fn(|| events.try_recv().ok())
            .any(|e| matches!(e, ConnectionEvent::Disconnected));
        assert!(disconnected);
    }
}
