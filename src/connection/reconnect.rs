//! Automatic reconnection.
//!
//! A lost connection (keep-alive timeout or unexpected socket close) arms a
//! single reconnect timer. When it fires, the stale transport is stopped and
//! restarted in reconnecting mode. Attempts repeat until the transport opens
//! again or the reconnect window runs out.

use super::{Connection, ConnectionEvent, ConnectionState};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl Connection {
    /// Starts the reconnection algorithm.
    ///
    /// Does nothing if the connection is stopped, if a reconnect is already
    /// pending, or if the reconnect window has run out (the connection is
    /// stopped then).
    pub async fn reconnect(self: &Arc<Self>) {
        if !self.is_connected_or_reconnecting() {
            return;
        }
        if self.reconnect_timer.lock().is_some() {
            debug!("Reconnect already scheduled.");
            return;
        }
        if !self.verify_last_active().await {
            return;
        }
        self.set_reconnect_timer();
    }

    /// Cancels a pending reconnect, if any.
    pub fn clear_reconnect_timer(&self) {
        if let Some(timer) = self.reconnect_timer.lock().take() {
            timer.cancel();
        }
    }

    fn set_reconnect_timer(self: &Arc<Self>) {
        let token = CancellationToken::new();
        {
            let mut slot = self.reconnect_timer.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(token.clone());
        }

        let connection = Arc::downgrade(self);
        let delay = self.reconnect_delay;
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            let Some(connection) = connection.upgrade() else {
                return;
            };
            {
                // A cleared timer is always cancelled under this lock.
                let mut slot = connection.reconnect_timer.lock();
                if token.is_cancelled() {
                    return;
                }
                slot.take();
            }
            connection.reconnect_now().await;
        });
    }

    async fn reconnect_now(self: &Arc<Self>) {
        if !self.verify_last_active().await {
            return;
        }
        let Some(transport) = self.transport() else {
            return;
        };

        transport.stop().await;

        if !self.ensure_reconnecting_state() {
            return;
        }
        info!("{} reconnecting.", transport.name());

        match transport.start(self, true).await {
            Ok(()) if self.state() == ConnectionState::Disconnected => {
                debug!(
                    transport = transport.name(),
                    "Stopped while reconnecting, closing the new socket."
                );
                transport.stop().await;
            }
            Ok(()) => {}
            Err(e) => {
                warn!(transport = transport.name(), "Reconnect attempt failed: {e}");
                self.reconnect().await;
            }
        }
    }

    /// Moves `Connected → Reconnecting`, emitting [`ConnectionEvent::Reconnecting`]
    /// on that transition. Returns whether the connection is now reconnecting.
    fn ensure_reconnecting_state(&self) -> bool {
        if self.change_state(ConnectionState::Connected, ConnectionState::Reconnecting) {
            self.emit(ConnectionEvent::Reconnecting);
        }
        self.state() == ConnectionState::Reconnecting
    }
}
