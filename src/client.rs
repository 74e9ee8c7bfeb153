//! The SignalR client.
//!
//! [`SignalRClient`] drives a connection through its lifecycle:
//! negotiate, transport selection, then the persistent connection. Hub
//! proxies created on the client keep working across reconnects.

use crate::{
    config::ClientConfig,
    connection::{Connection, ConnectionEvent, ConnectionState, bus::{InvocationCallback, MessageBus}},
    error::{Result, SignalRError},
    http::{HttpClient, ReqwestHttpClient},
    hub::{HubCore, HubProxy},
    negotiate::negotiate,
    protocol::{HubInvocation, JsonCodec},
    transport::{Transport, WebSocketTransport, select_transport, supported_transports},
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// State shared between the client, its hub proxies and its background tasks.
pub(crate) struct ClientShared {
    config: ClientConfig,
    http: Arc<dyn HttpClient>,
    transports: Vec<Arc<dyn Transport>>,
    pub(crate) bus: MessageBus,
    connection: Mutex<Option<Arc<Connection>>>,
    starting: Mutex<Option<PendingStart>>,
    start_attempts: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ClientShared {
    /// Registers `callback` under `id` and writes the invocation.
    ///
    /// The callback is registered before the write so a fast response cannot
    /// be missed, and removed again if the write fails.
    pub(crate) async fn send_with_callback(
        &self,
        id: u64,
        invocation: &HubInvocation,
        callback: InvocationCallback,
    ) -> Result<()> {
        let connection = self
            .connection
            .lock()
            .clone()
            .filter(|connection| connection.transport().is_some())
            .ok_or(SignalRError::NotConnected)?;

        let payload = JsonCodec::stringify(&JsonCodec::minify_hub_invocation(invocation)?);

        self.bus.register_pending(id, callback);
        if let Err(e) = connection.send(payload).await {
            self.bus.remove_pending(id);
            return Err(e);
        }
        Ok(())
    }
}

/// How a start attempt ended, as seen by the calls that joined it.
#[derive(Debug, Clone)]
enum StartOutcome {
    Started,
    StoppedWhileNegotiating,
    StoppedWhileStarting,
    Failed(String),
}

impl StartOutcome {
    fn of(result: &Result<()>) -> Self {
        match result {
            Ok(()) => Self::Started,
            Err(SignalRError::StoppedWhileNegotiating) => Self::StoppedWhileNegotiating,
            Err(SignalRError::StoppedWhileStarting) => Self::StoppedWhileStarting,
            Err(e) => Self::Failed(e.to_string()),
        }
    }

    fn into_result(self) -> Result<()> {
        match self {
            Self::Started => Ok(()),
            Self::StoppedWhileNegotiating => Err(SignalRError::StoppedWhileNegotiating),
            Self::StoppedWhileStarting => Err(SignalRError::StoppedWhileStarting),
            Self::Failed(message) => Err(SignalRError::StartFailed(message)),
        }
    }
}

/// The start attempt in flight. Only `stop` cancels it.
struct PendingStart {
    attempt: u64,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<StartOutcome>>,
}

/// Forgets the pending start once the call leading it returns or is dropped.
struct StartGuard<'a> {
    starting: &'a Mutex<Option<PendingStart>>,
    attempt: u64,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        let mut starting = self.starting.lock();
        if starting.as_ref().is_some_and(|pending| pending.attempt == self.attempt) {
            *starting = None;
        }
    }
}

/// A SignalR client.
///
/// # Example
///
/// ```no_run
/// use signalrr_classic::SignalRClient;
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = SignalRClient::new();
///     let chat = client.create_hub("chatHub");
///     chat.on("addMessage", |args| println!("{args:?}"));
///
///     client.start("http://localhost:8080/signalr", None).await?;
///     chat.invoke("send", vec![json!("bob"), json!("hello")]).await?;
///
///     client.stop().await;
///     Ok(())
/// }
/// ```
pub struct SignalRClient {
    shared: Arc<ClientShared>,
}

impl Default for SignalRClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalRClient {
    /// Creates a client using WebSockets and the default configuration.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self::with_parts(
            vec![Arc::new(WebSocketTransport::new())],
            config,
            Arc::new(ReqwestHttpClient::default()),
        )
    }

    /// Creates a client from explicit parts.
    ///
    /// `transports` are tried in order during start.
    pub fn with_parts(
        transports: Vec<Arc<dyn Transport>>,
        config: ClientConfig,
        http: Arc<dyn HttpClient>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            shared: Arc::new(ClientShared {
                config,
                http,
                transports,
                bus: MessageBus::new(),
                connection: Mutex::new(None),
                starting: Mutex::new(None),
                start_attempts: AtomicU64::new(0),
                dispatcher: Mutex::new(None),
                events,
            }),
        }
    }

    /// Subscribes to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// The current connection, once negotiation succeeded.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.shared.connection.lock().clone()
    }

    /// `Disconnected` when there is no connection.
    pub fn state(&self) -> ConnectionState {
        self.connection()
            .map_or(ConnectionState::Disconnected, |connection| connection.state())
    }

    /// Returns the proxy for `name`, creating it on first use. Names are
    /// matched case-insensitively.
    pub fn create_hub(&self, name: &str) -> HubProxy {
        let core = self.shared.bus.hub_or_insert_with(name, || {
            HubCore::new(
                name,
                Arc::downgrade(&self.shared),
                self.shared.config.event_channel_capacity,
            )
        });
        HubProxy::new(core)
    }

    /// Connects to `base_url`.
    ///
    /// When `connection_data` is `None`, it is derived from the hubs created
    /// so far as `[{"name":"<hub>"}]`. A non-array value is wrapped in an
    /// array.
    ///
    /// Calling `start` while another start is in flight waits for that
    /// attempt and shares its outcome. Once connected, `start` returns
    /// immediately.
    ///
    /// # Errors
    ///
    /// * Any negotiation error (see [`negotiate`](crate::negotiate::negotiate)).
    /// * [`SignalRError::NoTransport`] - No transport could be started.
    /// * [`SignalRError::StoppedWhileNegotiating`] /
    ///   [`SignalRError::StoppedWhileStarting`] - [`stop`](Self::stop) was
    ///   called meanwhile.
    /// * [`SignalRError::StartFailed`] - The joined start failed.
    pub async fn start(&self, base_url: &str, connection_data: Option<Value>) -> Result<()> {
        let base_url = Url::parse(base_url)?;

        let joined = {
            let mut starting = self.shared.starting.lock();
            if let Some(pending) = starting.as_ref() {
                Err(pending.outcome.clone())
            } else if matches!(
                self.state(),
                ConnectionState::Connected | ConnectionState::Reconnecting
            ) {
                debug!("Client already started.");
                return Ok(());
            } else {
                let attempt = self.shared.start_attempts.fetch_add(1, Ordering::Relaxed);
                let cancel = CancellationToken::new();
                let (done, outcome) = watch::channel(None);
                *starting = Some(PendingStart {
                    attempt,
                    cancel: cancel.clone(),
                    outcome,
                });
                Ok((attempt, cancel, done))
            }
        };

        let (attempt, cancel, done) = match joined {
            Ok(leading) => leading,
            Err(outcome) => {
                debug!("Joining the start in progress.");
                return Self::join_start(outcome).await;
            }
        };

        let _guard = StartGuard {
            starting: &self.shared.starting,
            attempt,
        };
        let result = self.run_start(base_url, connection_data, &cancel).await;
        done.send_replace(Some(StartOutcome::of(&result)));
        result
    }

    /// Waits for the start in flight. A leading call that was dropped counts
    /// as stopped.
    async fn join_start(mut outcome: watch::Receiver<Option<StartOutcome>>) -> Result<()> {
        let finished = outcome
            .wait_for(Option::is_some)
            .await
            .map(|outcome| (*outcome).clone())
            .map_err(|_| SignalRError::StoppedWhileStarting)?;
        finished.map_or(Err(SignalRError::StoppedWhileStarting), StartOutcome::into_result)
    }

    async fn run_start(
        &self,
        base_url: Url,
        connection_data: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let config = &self.shared.config;
        let data = self.connection_data(connection_data);

        let negotiated = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(SignalRError::StoppedWhileNegotiating),
            negotiated = negotiate(
                self.shared.http.as_ref(),
                &base_url,
                &config.protocol_version,
                data.as_deref(),
                config.query_string.as_deref(),
            ) => negotiated?,
        };
        info!(connection_id = %negotiated.connection_id, "Negotiated.");

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connection = Connection::new(
            crate::connection::ConnectionParts {
                base_url,
                connection_data: data,
                http: Arc::clone(&self.shared.http),
                events: self.shared.events.clone(),
                inbound: inbound_tx,
            },
            &negotiated,
            config,
        );
        *self.shared.connection.lock() = Some(Arc::clone(&connection));

        let selected = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            selected = select_transport(&self.shared.transports, &negotiated, &connection) => Some(selected),
        };
        let transport = match selected {
            Some(Ok(transport)) => transport,
            Some(Err(e)) => {
                warn!("{e}");
                let _ = connection.stop(false).await;
                return Err(e);
            }
            None => {
                for transport in supported_transports(&self.shared.transports, &negotiated) {
                    transport.stop().await;
                }
                return Err(SignalRError::StoppedWhileStarting);
            }
        };

        self.spawn_dispatcher(&connection, inbound_rx);
        if !connection.start(Arc::clone(&transport)) {
            transport.stop().await;
            return Err(SignalRError::StoppedWhileStarting);
        }
        info!(transport = transport.name(), "Connection started.");
        Ok(())
    }

    fn connection_data(&self, explicit: Option<Value>) -> Option<String> {
        let data = match explicit {
            Some(Value::Array(items)) => Value::Array(items),
            Some(other) => Value::Array(vec![other]),
            None => {
                let hubs = self.shared.bus.hub_names();
                if hubs.is_empty() {
                    return None;
                }
                Value::Array(hubs.into_iter().map(|name| json!({ "name": name })).collect())
            }
        };
        Some(data.to_string())
    }

    /// Routes the messages of `connection` until it stops, then fails the
    /// calls still waiting on it.
    fn spawn_dispatcher(
        &self,
        connection: &Arc<Connection>,
        mut inbound: mpsc::UnboundedReceiver<Value>,
    ) {
        let shared = Arc::downgrade(&self.shared);
        let served = Arc::downgrade(connection);
        let task = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                shared.bus.dispatch(message);
            }

            let Some(shared) = shared.upgrade() else {
                return;
            };
            let still_current = shared
                .connection
                .lock()
                .as_ref()
                .is_some_and(|current| Arc::as_ptr(current) == served.as_ptr());
            if still_current {
                debug!("Connection stopped, dropping pending invocations.");
                shared.bus.clear_pending();
            }
        });
        if let Some(previous) = self.shared.dispatcher.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stops the client.
    ///
    /// Cancels an in-flight start, stops the connection and tells the server,
    /// and fails every pending invocation with
    /// [`SignalRError::NotConnected`].
    pub async fn stop(&self) {
        if let Some(pending) = self.shared.starting.lock().take() {
            pending.cancel.cancel();
        }

        let connection = self.shared.connection.lock().take();
        if let Some(connection) = connection {
            if let Err(e) = connection.stop(true).await {
                warn!("Abort request failed: {e}");
            }
        }

        if let Some(dispatcher) = self.shared.dispatcher.lock().take() {
            dispatcher.abort();
        }
        self.shared.bus.clear_pending();
    }
}
