//! Negotiation with the SignalR server.
//!
//! Before any transport is opened, the client performs an HTTP GET request to
//! the `/negotiate` endpoint to obtain the connection token and the timeouts
//! that govern the session.
//!
//! This module handles the negotiation request and parses the response.

use crate::error::{Result, SignalRError};
use crate::http::HttpClient;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Body the server sends back when negotiation was aborted on purpose.
const NEGOTIATE_ABORTED: &str = "__Negotiate Aborted__";

/// Response from the `/negotiate` endpoint.
///
/// Timeouts are expressed in seconds on the wire; use the accessor methods to
/// get them as [`Duration`]s.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct NegotiateResponse {
    pub connection_id: String,
    pub connection_token: String,
    pub protocol_version: Option<String>,
    pub disconnect_timeout: f64,
    /// Absent (or zero) when the server does not send keep-alives.
    pub keep_alive_timeout: Option<f64>,
    pub transport_connect_timeout: f64,
    pub try_web_sockets: bool,
    pub long_poll_delay: f64,
    /// Application-relative URL, i.e. `/signalr`.
    pub url: String,
}

impl NegotiateResponse {
    pub fn disconnect_timeout(&self) -> Duration {
        seconds(self.disconnect_timeout)
    }

    /// `None` means keep-alive is disabled.
    pub fn keep_alive_timeout(&self) -> Option<Duration> {
        self.keep_alive_timeout
            .filter(|secs| *secs > 0.0)
            .map(seconds)
    }

    pub fn transport_connect_timeout(&self) -> Duration {
        seconds(self.transport_connect_timeout)
    }
}

fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or_default()
}

/// Builds `{base_url}/{segment}`, keeping the base query string.
pub(crate) fn endpoint_url(base_url: &Url, segment: &str) -> Url {
    let mut url = base_url.clone();

    let mut path = url.path().to_string();
    if path.ends_with('/') {
        path.pop();
    }
    path.push('/');
    path.push_str(segment);
    url.set_path(&path);
    url.set_fragment(None);

    url
}

/// Appends a raw `key=value&...` query string to `url`.
pub(crate) fn append_raw_query(url: &mut Url, raw: Option<&str>) {
    let Some(raw) = raw else {
        return;
    };
    let raw = raw.trim_start_matches(['?', '&']);
    if raw.is_empty() {
        return;
    }
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .collect();
    url.query_pairs_mut().extend_pairs(pairs);
}

/// Performs the negotiate request.
///
/// # Arguments
///
/// * `http` - The HTTP client used for the request.
/// * `base_url` - The SignalR endpoint (e.g., `http://localhost:5000/signalr`).
/// * `protocol_version` - The protocol version this client speaks.
/// * `connection_data` - JSON-encoded connection data, if any.
/// * `query_string` - Extra query parameters, if any.
///
/// # Errors
///
/// * [`SignalRError::Negotiation`] - The request failed, the status was
///   >= 400, or the body is not a negotiate response.
/// * [`SignalRError::NegotiationAborted`] - The server answered with the abort
///   sentinel.
/// * [`SignalRError::ProtocolMismatch`] - The server speaks another version.
pub async fn negotiate(
    http: &dyn HttpClient,
    base_url: &Url,
    protocol_version: &str,
    connection_data: Option<&str>,
    query_string: Option<&str>,
) -> Result<NegotiateResponse> {
    let mut negotiate_url = endpoint_url(base_url, "negotiate");
    negotiate_url
        .query_pairs_mut()
        .append_pair("clientProtocol", protocol_version);
    append_raw_query(&mut negotiate_url, query_string);
    if let Some(data) = connection_data {
        negotiate_url
            .query_pairs_mut()
            .append_pair("connectionData", data);
    }

    debug!("Negotiate URL: {}", negotiate_url);

    let response = http
        .get(&negotiate_url)
        .await
        .map_err(|e| SignalRError::Negotiation(e.to_string()))?;

    if response.status.as_u16() >= 400 {
        if response.body == NEGOTIATE_ABORTED {
            return Err(SignalRError::NegotiationAborted);
        }
        debug!("Negotiate response body: {}", response.body);
        return Err(SignalRError::Negotiation(format!(
            "server returned {}",
            response.status
        )));
    }

    let negotiated: NegotiateResponse = serde_json::from_str(&response.body)
        .map_err(|e| SignalRError::Negotiation(format!("invalid negotiate response: {e}")))?;

    match negotiated.protocol_version.as_deref() {
        Some(version) if version == protocol_version => Ok(negotiated),
        other => Err(SignalRError::ProtocolMismatch {
            client: protocol_version.to_string(),
            server: other.unwrap_or_default().to_string(),
        }),
    }
}
