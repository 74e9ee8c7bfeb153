use thiserror::Error;

/// Errors that can occur in the SignalR client.
#[derive(Error, Debug)]
pub enum SignalRError {
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::SignalRProtocolError),

    /// The negotiate request failed at the network level or returned a status >= 400.
    #[error("Error during negotiation request: {0}")]
    Negotiation(String),

    /// The server answered negotiate with the abort sentinel body.
    #[error("The negotiation request was aborted.")]
    NegotiationAborted,

    #[error(
        "You are using a version of the client that isn't compatible with the server. \
         Client version {client}, server version {server}."
    )]
    ProtocolMismatch { client: String, server: String },

    #[error(
        "No transport could be initialized successfully. \
         Try specifying a different transport or none at all for auto initialization."
    )]
    NoTransport,

    #[error("{transport} transport error: {source}")]
    Transport {
        transport: &'static str,
        #[source]
        source: TransportError,
    },

    /// The client stayed inactive longer than the reconnect window.
    #[error(
        "The client has been inactive for {inactive_ms} ms and it has exceeded the \
         inactivity timeout of {window_ms} ms. Stopping the connection."
    )]
    InactivityTimeout { inactive_ms: u128, window_ms: u128 },

    #[error("Not connected")]
    NotConnected,

    #[error("{hub}.{method} failed to execute: {message}")]
    HubInvocation {
        hub: String,
        method: String,
        message: String,
        kind: HubErrorKind,
        stack_trace: Option<String>,
        data: Option<serde_json::Value>,
    },

    #[error("The connection was stopped while starting.")]
    StoppedWhileStarting,

    #[error("The connection was stopped during the negotiation request.")]
    StoppedWhileNegotiating,

    /// A concurrent `start` that this call joined failed.
    #[error("Start failed: {0}")]
    StartFailed(String),
}

/// Socket-level failures reported by a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    ConnectFailed(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("the transport is in an invalid state, transitioning into reconnecting")]
    InvalidState,

    #[error("socket closed")]
    Closed,

    #[error("socket closed before the session was initialized")]
    NotInitialized,
}

/// Classification of a server-reported invocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubErrorKind {
    /// The hub method threw a `HubException` on purpose.
    HubException,
    /// Any other server-side exception.
    Exception,
}

impl SignalRError {
    pub(crate) fn transport(transport: &'static str, source: TransportError) -> Self {
        Self::Transport { transport, source }
    }
}

pub type Result<T, E = SignalRError> = std::result::Result<T, E>;
