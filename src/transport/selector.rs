//! Ordered transport fallback.

use super::Transport;
use crate::connection::Connection;
use crate::error::{Result, SignalRError};
use crate::negotiate::NegotiateResponse;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Candidates the server allows for this session, in preference order.
pub fn supported_transports(
    candidates: &[Arc<dyn Transport>],
    negotiated: &NegotiateResponse,
) -> Vec<Arc<dyn Transport>> {
    candidates
        .iter()
        .filter(|transport| transport.is_supported(negotiated))
        .cloned()
        .collect()
}

/// Starts the supported candidates one at a time and returns the first that
/// comes up.
///
/// Each attempt gets the negotiated transport connect timeout. A failed or
/// timed-out candidate is stopped before the next one is tried.
///
/// # Errors
///
/// [`SignalRError::NoTransport`] if no candidate is supported or all of them
/// failed.
pub async fn select_transport(
    candidates: &[Arc<dyn Transport>],
    negotiated: &NegotiateResponse,
    connection: &Arc<Connection>,
) -> Result<Arc<dyn Transport>> {
    let supported = supported_transports(candidates, negotiated);
    if supported.is_empty() {
        warn!("None of the configured transports is supported by the server.");
        return Err(SignalRError::NoTransport);
    }

    let connect_timeout = negotiated.transport_connect_timeout();
    for transport in supported {
        debug!(transport = transport.name(), "Starting transport.");

        match tokio::time::timeout(connect_timeout, transport.start(connection, false)).await {
            Ok(Ok(())) => {
                info!(transport = transport.name(), "Transport started.");
                return Ok(transport);
            }
            Ok(Err(e)) => {
                warn!(transport = transport.name(), "Transport failed to start: {e}");
            }
            Err(_) => {
                warn!(
                    transport = transport.name(),
                    "Transport timed out after {connect_timeout:?} when trying to connect."
                );
            }
        }
        transport.stop().await;
    }

    Err(SignalRError::NoTransport)
}
