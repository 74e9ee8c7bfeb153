//! SignalR client connection management.
//!
//! A [`Connection`] holds the protocol-level session created by a successful
//! negotiation:
//! - the tokens and cursors the server hands out (connection token, groups
//!   token, last message id),
//! - the connection state machine,
//! - the heartbeat, keep-alive monitoring and reconnect timer
//!   (see [`keep_alive`] and [`reconnect`]).
//!
//! The connection never owns the socket. It keeps a shared handle to the
//! active [`Transport`], and transports only hold a weak reference back.

pub(crate) mod bus;
mod keep_alive;
mod reconnect;

pub use keep_alive::KeepAlive;

use crate::{
    config::ClientConfig,
    error::{Result, SignalRError},
    http::HttpClient,
    negotiate::{NegotiateResponse, append_raw_query},
    transport::Transport,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// State of a [`Connection`].
///
/// `Connecting → Connected → Reconnecting → Connected → ... → Disconnected`.
/// `Disconnected` is terminal for a given connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// Events broadcast by a connection and its transport.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A hub-level message arrived.
    Received(Value),
    /// A transport or session error. The connection may recover on its own.
    Error(Arc<SignalRError>),
    /// Connection loss was detected and a reconnect attempt is starting.
    Reconnecting,
    /// The transport reconnected.
    Reconnected,
    StateChanged {
        old: ConnectionState,
        new: ConnectionState,
    },
    /// The connection stopped for good.
    Disconnected,
    /// Keep-alives are late; the connection may be dead or slow.
    ConnectionSlow,
}

/// Mutable per-session data updated from server frames and timers.
#[derive(Debug)]
struct Session {
    groups_token: Option<String>,
    message_id: Option<String>,
    last_message_at: Instant,
    last_active_at: Instant,
}

/// A negotiated SignalR connection.
pub struct Connection {
    base_url: Url,
    app_relative_url: String,
    protocol_version: String,
    data: Option<String>,
    query_string: Option<String>,
    id: String,
    token: String,
    disconnect_timeout: Duration,
    reconnect_window: Duration,
    reconnect_delay: Duration,
    heartbeat_interval: Duration,
    http: Arc<dyn HttpClient>,

    state: Mutex<ConnectionState>,
    session: Mutex<Session>,
    keep_alive: Mutex<KeepAlive>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    heartbeat: Mutex<Option<CancellationToken>>,
    reconnect_timer: Mutex<Option<CancellationToken>>,

    events: broadcast::Sender<ConnectionEvent>,
    /// Dropped on stop, which ends the dispatcher once it has drained.
    inbound: Mutex<Option<mpsc::UnboundedSender<Value>>>,
}

/// Everything needed to build a [`Connection`] besides the negotiate response.
pub(crate) struct ConnectionParts {
    pub base_url: Url,
    pub connection_data: Option<String>,
    pub http: Arc<dyn HttpClient>,
    pub events: broadcast::Sender<ConnectionEvent>,
    pub inbound: mpsc::UnboundedSender<Value>,
}

impl Connection {
    /// Creates the connection for a negotiated session.
    ///
    /// Hub messages received by the transport are forwarded, in order, to
    /// `parts.inbound`. The sender is dropped when the connection stops.
    pub(crate) fn new(
        parts: ConnectionParts,
        negotiated: &NegotiateResponse,
        config: &ClientConfig,
    ) -> Arc<Self> {
        let keep_alive = KeepAlive::new(negotiated.keep_alive_timeout());
        let disconnect_timeout = negotiated.disconnect_timeout();
        let reconnect_window = disconnect_timeout + keep_alive.timeout();
        let now = Instant::now();

        Arc::new(Self {
            base_url: parts.base_url,
            app_relative_url: negotiated.url.clone(),
            protocol_version: negotiated
                .protocol_version
                .clone()
                .unwrap_or_else(|| config.protocol_version.clone()),
            data: parts.connection_data,
            query_string: config.query_string.clone(),
            id: negotiated.connection_id.clone(),
            token: negotiated.connection_token.clone(),
            disconnect_timeout,
            reconnect_window,
            reconnect_delay: config.reconnect_delay,
            heartbeat_interval: config.heartbeat_interval,
            http: parts.http,
            state: Mutex::new(ConnectionState::Connecting),
            session: Mutex::new(Session {
                groups_token: None,
                message_id: None,
                last_message_at: now,
                last_active_at: now,
            }),
            keep_alive: Mutex::new(keep_alive),
            transport: Mutex::new(None),
            heartbeat: Mutex::new(None),
            reconnect_timer: Mutex::new(None),
            events: parts.events,
            inbound: Mutex::new(Some(parts.inbound)),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Application-relative URL returned by negotiate, i.e. `/signalr`.
    pub fn app_relative_url(&self) -> &str {
        &self.app_relative_url
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// JSON-encoded connection data sent with every request.
    pub fn connection_data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn disconnect_timeout(&self) -> Duration {
        self.disconnect_timeout
    }

    /// Maximum inactivity tolerated before the session is abandoned:
    /// disconnect timeout + keep-alive timeout.
    pub fn reconnect_window(&self) -> Duration {
        self.reconnect_window
    }

    pub fn groups_token(&self) -> Option<String> {
        self.session.lock().groups_token.clone()
    }

    pub fn message_id(&self) -> Option<String> {
        self.session.lock().message_id.clone()
    }

    pub fn keep_alive(&self) -> KeepAlive {
        self.keep_alive.lock().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn http(&self) -> &dyn HttpClient {
        self.http.as_ref()
    }

    /// The transport currently bound to this connection, if any.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().clone()
    }

    pub fn is_connected_or_reconnecting(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }

    /// Moves to `new` if the current state is `expected`.
    ///
    /// Returns `false`, leaving the state untouched, otherwise. This is the
    /// only way state moves forward, so a stale reconnect cannot revive a
    /// stopped connection.
    pub fn change_state(&self, expected: ConnectionState, new: ConnectionState) -> bool {
        {
            let mut state = self.state.lock();
            if *state != expected {
                return false;
            }
            *state = new;
        }
        self.emit(ConnectionEvent::StateChanged { old: expected, new });
        true
    }

    /// Binds the winning transport and starts the heartbeat.
    ///
    /// Returns `false` if the connection was stopped in the meantime; the
    /// transport is then left unbound.
    pub(crate) fn start(self: &Arc<Self>, transport: Arc<dyn Transport>) -> bool {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Connecting {
                return false;
            }
            *state = ConnectionState::Connected;
            *self.transport.lock() = Some(transport);
        }
        self.emit(ConnectionEvent::StateChanged {
            old: ConnectionState::Connecting,
            new: ConnectionState::Connected,
        });

        self.start_monitoring_keep_alive();
        self.start_heartbeat();
        true
    }

    /// Stops the connection.
    ///
    /// Does nothing if already disconnected. Otherwise cancels the timers,
    /// stops the transport and, when `notify_server` is set, sends the abort
    /// request. The abort result is returned, but the connection is
    /// disconnected either way.
    pub async fn stop(&self, notify_server: bool) -> Result<()> {
        let previous = {
            let mut state = self.state.lock();
            if *state == ConnectionState::Disconnected {
                return Ok(());
            }
            std::mem::replace(&mut *state, ConnectionState::Disconnected)
        };

        info!("Stopping connection.");
        self.emit(ConnectionEvent::StateChanged {
            old: previous,
            new: ConnectionState::Disconnected,
        });

        self.clear_reconnect_timer();
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.cancel();
        }

        let transport = self.transport.lock().take();
        let mut result = Ok(());
        if let Some(transport) = transport {
            transport.stop().await;
            self.stop_monitoring_keep_alive();

            if notify_server {
                result = transport.abort(self).await;
            }
        }

        self.inbound.lock().take();
        self.emit(ConnectionEvent::Disconnected);
        result
    }

    /// Writes a payload through the bound transport.
    pub(crate) async fn send(&self, payload: String) -> Result<()> {
        let transport = self.transport().ok_or(SignalRError::NotConnected)?;
        transport.send(self, payload).await
    }

    /// Updates the "most recent message received" timestamp.
    pub fn mark_last_message(&self) {
        self.session.lock().last_message_at = Instant::now();
    }

    /// Replaces the groups token; empty or missing tokens are ignored.
    pub fn update_groups(&self, groups_token: Option<&str>) {
        if let Some(token) = groups_token.filter(|t| !t.is_empty()) {
            self.session.lock().groups_token = Some(token.to_string());
        }
    }

    pub fn update_message_id(&self, message_id: Option<&str>) {
        if let Some(id) = message_id.filter(|id| !id.is_empty()) {
            self.session.lock().message_id = Some(id.to_string());
        }
    }

    /// Called by a transport once its socket is open.
    ///
    /// Clears the reconnect timer and completes a pending reconnect. Returns
    /// `true` if this open was a reconnect.
    pub fn on_transport_open(&self) -> bool {
        self.clear_reconnect_timer();

        if !self.change_state(ConnectionState::Reconnecting, ConnectionState::Connected) {
            return false;
        }
        if self.keep_alive.lock().monitoring {
            self.mark_last_message();
        }
        self.emit(ConnectionEvent::Reconnected);
        true
    }

    /// Hands a hub-level message over for routing.
    pub fn emit_received(&self, message: Value) {
        self.emit(ConnectionEvent::Received(message.clone()));
        let inbound = self.inbound.lock().clone();
        match inbound {
            Some(inbound) => {
                if inbound.send(message).is_err() {
                    warn!("Dropping inbound message: no dispatcher is running");
                }
            }
            None => debug!("Dropping inbound message: connection stopped"),
        }
    }

    pub fn emit_error(&self, error: SignalRError) {
        self.emit(ConnectionEvent::Error(Arc::new(error)));
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        // Having no subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Appends the query parameters shared by every SignalR request:
    /// `clientProtocol`, the configured query string, `connectionToken` and
    /// `connectionData`.
    pub fn prepare_query(&self, url: &mut Url) {
        url.query_pairs_mut()
            .append_pair("clientProtocol", &self.protocol_version);
        append_raw_query(url, self.query_string.as_deref());

        let mut pairs = url.query_pairs_mut();
        if !self.token.is_empty() {
            pairs.append_pair("connectionToken", &self.token);
        }
        if let Some(data) = &self.data {
            pairs.append_pair("connectionData", data);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("base_url", &self.base_url.as_str())
            .field("state", &self.state())
            .field("has_transport", &self.transport.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockHttpClient, MockTransport, connection_for, negotiated};
    use serde_json::json;

    #[tokio::test]
    async fn test_reconnect_window_from_negotiate() {
        let (connection, _events, _inbound) = connection_for(negotiated("1.4", true, Some(10.0)));
        assert_eq!(connection.reconnect_window(), Duration::from_millis(40_000));
        assert_eq!(connection.disconnect_timeout(), Duration::from_secs(30));
        assert_eq!(connection.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_reconnect_window_without_keep_alive() {
        let (connection, _events, _inbound) = connection_for(negotiated("1.4", true, None));
        assert_eq!(connection.reconnect_window(), Duration::from_secs(30));
        assert!(!connection.keep_alive().activated);
    }

    #[tokio::test]
    async fn test_change_state_requires_expected_state() {
        let (connection, mut events, _inbound) = connection_for(negotiated("1.4", true, None));

        assert!(!connection.change_state(ConnectionState::Connected, ConnectionState::Reconnecting));
        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert!(events.try_recv().is_err());

        assert!(connection.change_state(ConnectionState::Connecting, ConnectionState::Connected));
        assert_eq!(connection.state(), ConnectionState::Connected);
        match events.try_recv().unwrap() {
            ConnectionEvent::StateChanged { old, new } => {
                assert_eq!(old, ConnectionState::Connecting);
                assert_eq!(new, ConnectionState::Connected);
            }
            other => panic!("Expected StateChanged, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (connection, mut events, _inbound) = connection_for(negotiated("1.4", true, None));
        let transport = MockTransport::succeeding("mock");
        assert!(connection.start(transport.clone()));

        connection.stop(false).await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(connection.transport().is_none());
        assert_eq!(transport.stop_count(), 1);

        connection.stop(false).await.unwrap();
        assert_eq!(transport.stop_count(), 1);

        let mut disconnects = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ConnectionEvent::Disconnected) {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn test_stop_with_notify_sends_abort() {
        let http = Arc::new(MockHttpClient::new());
        let (connection, _events, _inbound) =
            crate::testing::connection_with_http(negotiated("1.4", true, None), http.clone());
        assert!(connection.start(MockTransport::succeeding("mock")));

        connection.stop(true).await.unwrap();

        let requests = http.requests();
        assert_eq!(requests.len(), 1);
        let (method, url) = &requests[0];
        assert_eq!(*method, "POST");
        assert_eq!(url.path(), "/signalr/abort");
        let query = url.query().unwrap();
        assert!(query.starts_with("transport=mock&clientProtocol=1.4"));
        assert!(query.contains("connectionToken=token-1"));
    }

    #[tokio::test]
    async fn test_start_after_stop_is_rejected() {
        let (connection, _events, _inbound) = connection_for(negotiated("1.4", true, None));
        connection.stop(false).await.unwrap();

        assert!(!connection.start(MockTransport::succeeding("mock")));
        assert!(connection.transport().is_none());
    }

    #[tokio::test]
    async fn test_session_updates_ignore_empty_values() {
        let (connection, _events, _inbound) = connection_for(negotiated("1.4", true, None));

        connection.update_groups(Some("g1"));
        connection.update_groups(Some(""));
        connection.update_groups(None);
        connection.update_message_id(Some("d-1"));
        connection.update_message_id(None);

        assert_eq!(connection.groups_token().as_deref(), Some("g1"));
        assert_eq!(connection.message_id().as_deref(), Some("d-1"));
    }

    #[tokio::test]
    async fn test_emit_received_forwards_in_order() {
        let (connection, _events, mut inbound) = connection_for(negotiated("1.4", true, None));

        connection.emit_received(json!({"I": 1}));
        connection.emit_received(json!({"I": 2}));

        assert_eq!(inbound.recv().await.unwrap(), json!({"I": 1}));
        assert_eq!(inbound.recv().await.unwrap(), json!({"I": 2}));
    }

    #[tokio::test]
    async fn test_stop_closes_inbound_after_queued_messages() {
        let (connection, _events, mut inbound) = connection_for(negotiated("1.4", true, None));

        connection.emit_received(json!({"I": 1}));
        connection.stop(false).await.unwrap();
        connection.emit_received(json!({"I": 2}));

        assert_eq!(inbound.recv().await, Some(json!({"I": 1})));
        assert_eq!(inbound.recv().await, None);
    }

    #[tokio::test]
    async fn test_prepare_query() {
        let (connection, _events, _inbound) = connection_for(negotiated("1.4", true, None));
        let mut url = Url::parse("http://localhost/signalr/abort?transport=webSockets").unwrap();

        connection.prepare_query(&mut url);

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("transport".to_string(), "webSockets".to_string()),
                ("clientProtocol".to_string(), "1.4".to_string()),
                ("connectionToken".to_string(), "token-1".to_string()),
                (
                    "connectionData".to_string(),
                    r#"[{"name":"chathub"}]"#.to_string()
                ),
            ]
        );
    }
}
