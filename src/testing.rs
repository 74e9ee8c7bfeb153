//! Test doubles shared by the unit tests.

use crate::{
    client::SignalRClient,
    config::ClientConfig,
    connection::{Connection, ConnectionEvent, ConnectionParts},
    error::{Result, SignalRError, TransportError},
    http::{HttpClient, HttpResponse},
    negotiate::NegotiateResponse,
    transport::Transport,
};
use async_trait::async_trait;
use http::StatusCode;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Semaphore, broadcast, mpsc};
use url::Url;

pub(crate) const BASE_URL: &str = "http://localhost/signalr";

/// Scripted [`HttpClient`]: answers GETs from a queue and every POST with 200.
pub(crate) struct MockHttpClient {
    gets: Mutex<VecDeque<HttpResponse>>,
    requests: Mutex<Vec<(&'static str, Url)>>,
    hang: AtomicBool,
    held: AtomicBool,
    gate: Semaphore,
}

impl MockHttpClient {
    pub(crate) fn new() -> Self {
        Self {
            gets: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            hang: AtomicBool::new(false),
            held: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }

    pub(crate) fn push_get(&self, status: StatusCode, body: String) {
        self.gets.lock().push_back(HttpResponse { status, body });
    }

    /// GETs never complete.
    pub(crate) fn hang_gets(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    /// GETs wait for [`release_gets`](Self::release_gets), one per call.
    pub(crate) fn hold_gets(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release_gets(&self) {
        self.gate.add_permits(1);
    }

    pub(crate) fn requests(&self) -> Vec<(&'static str, Url)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn get(&self, url: &Url) -> Result<HttpResponse> {
        self.requests.lock().push(("GET", url.clone()));
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.held.load(Ordering::SeqCst) {
            self.gate.acquire().await.unwrap().forget();
        }
        let response = self.gets.lock().pop_front();
        response.ok_or_else(|| SignalRError::Negotiation("no scripted response".to_string()))
    }

    async fn post(&self, url: &Url) -> Result<HttpResponse> {
        self.requests.lock().push(("POST", url.clone()));
        Ok(HttpResponse {
            status: StatusCode::OK,
            body: String::new(),
        })
    }
}

pub(crate) fn negotiated(version: &str, try_web_sockets: bool, keep_alive: Option<f64>) -> NegotiateResponse {
    NegotiateResponse {
        connection_id: "conn-1".to_string(),
        connection_token: "token-1".to_string(),
        protocol_version: Some(version.to_string()),
        disconnect_timeout: 30.0,
        keep_alive_timeout: keep_alive,
        transport_connect_timeout: 5.0,
        try_web_sockets,
        long_poll_delay: 0.0,
        url: "/signalr".to_string(),
    }
}

pub(crate) fn negotiate_body(version: &str, try_web_sockets: bool, keep_alive: Option<f64>) -> String {
    serde_json::to_string(&negotiated(version, try_web_sockets, keep_alive))
        .unwrap_or_default()
}

type Harness = (
    Arc<Connection>,
    broadcast::Receiver<ConnectionEvent>,
    mpsc::UnboundedReceiver<Value>,
);

/// A connection in the `Connecting` state for the `chathub` hub.
pub(crate) fn connection_for(negotiated: NegotiateResponse) -> Harness {
    connection_with_http(negotiated, Arc::new(MockHttpClient::new()))
}

pub(crate) fn connection_with_http(negotiated: NegotiateResponse, http: Arc<MockHttpClient>) -> Harness {
    let (events, events_rx) = broadcast::channel(64);
    let (inbound, inbound_rx) = mpsc::unbounded_channel();
    let connection = Connection::new(
        ConnectionParts {
            base_url: Url::parse(BASE_URL).unwrap(),
            connection_data: Some(r#"[{"name":"chathub"}]"#.to_string()),
            http,
            events,
            inbound,
        },
        &negotiated,
        &ClientConfig::default(),
    );
    (connection, events_rx, inbound_rx)
}

/// A client started against a scripted negotiate with `transport` as its
/// only candidate.
pub(crate) async fn connected_client(
    transport: Arc<MockTransport>,
    config: ClientConfig,
    keep_alive: Option<f64>,
) -> (SignalRClient, Arc<Connection>) {
    let http = Arc::new(MockHttpClient::new());
    http.push_get(StatusCode::OK, negotiate_body("1.4", true, keep_alive));
    let client = SignalRClient::with_parts(vec![transport as Arc<dyn Transport>], config, http);
    client.start(BASE_URL, None).await.unwrap();
    let connection = client.connection().unwrap();
    (client, connection)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Succeed,
    Fail,
    Hang,
    Gated,
}

/// In-memory [`Transport`] recording what happens to it.
pub(crate) struct MockTransport {
    name: &'static str,
    behavior: Behavior,
    keep_alive: AtomicBool,
    requires_websockets: AtomicBool,
    failing_reconnects: AtomicUsize,
    starts: Mutex<Vec<bool>>,
    stops: AtomicUsize,
    sent: Mutex<Vec<String>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: AtomicUsize,
    gate: Semaphore,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    fn with_behavior(name: &'static str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name,
            behavior,
            keep_alive: AtomicBool::new(false),
            requires_websockets: AtomicBool::new(false),
            failing_reconnects: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        })
    }

    pub(crate) fn succeeding(name: &'static str) -> Arc<Self> {
        Self::with_behavior(name, Behavior::Succeed)
    }

    pub(crate) fn failing(name: &'static str) -> Arc<Self> {
        Self::with_behavior(name, Behavior::Fail)
    }

    /// `start` never completes.
    pub(crate) fn hanging(name: &'static str) -> Arc<Self> {
        Self::with_behavior(name, Behavior::Hang)
    }

    /// `start` succeeds once [`release`](Self::release) is called.
    pub(crate) fn gated(name: &'static str) -> Arc<Self> {
        Self::with_behavior(name, Behavior::Gated)
    }

    pub(crate) fn release(&self) {
        self.gate.add_permits(1);
    }

    pub(crate) fn with_keep_alive(self: Arc<Self>, keep_alive: bool) -> Arc<Self> {
        self.keep_alive.store(keep_alive, Ordering::SeqCst);
        self
    }

    /// Only supported when the server allows WebSockets.
    pub(crate) fn requiring_websockets(self: Arc<Self>) -> Arc<Self> {
        self.requires_websockets.store(true, Ordering::SeqCst);
        self
    }

    /// The next `count` reconnecting starts fail.
    pub(crate) fn failing_reconnects(self: Arc<Self>, count: usize) -> Arc<Self> {
        self.failing_reconnects.store(count, Ordering::SeqCst);
        self
    }

    /// The `reconnecting` flag of every start, in order.
    pub(crate) fn start_log(&self) -> Vec<bool> {
        self.starts.lock().clone()
    }

    pub(crate) fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub(crate) fn max_concurrent_starts(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn failure(&self) -> SignalRError {
        SignalRError::transport(self.name, TransportError::Closed)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    fn is_supported(&self, negotiated: &NegotiateResponse) -> bool {
        !self.requires_websockets.load(Ordering::SeqCst) || negotiated.try_web_sockets
    }

    fn supports_keep_alive(&self) -> bool {
        self.keep_alive.load(Ordering::SeqCst)
    }

    async fn start(&self, connection: &Arc<Connection>, reconnecting: bool) -> Result<()> {
        self.starts.lock().push(reconnecting);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(Arc::clone(&self.in_flight));

        match self.behavior {
            Behavior::Fail => return Err(self.failure()),
            Behavior::Hang => std::future::pending::<()>().await,
            Behavior::Gated => self.gate.acquire().await.unwrap().forget(),
            Behavior::Succeed => {}
        }

        if reconnecting {
            let remaining = self.failing_reconnects.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_reconnects.store(remaining - 1, Ordering::SeqCst);
                return Err(self.failure());
            }
        }
        connection.on_transport_open();
        Ok(())
    }

    async fn send(&self, _connection: &Connection, payload: String) -> Result<()> {
        self.sent.lock().push(payload);
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}
