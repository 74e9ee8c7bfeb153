//! Keep-alive monitoring and the connection heartbeat.
//!
//! The server sends an empty frame every `KeepAliveTimeout / 3` seconds. The
//! heartbeat compares the time since the last received frame against the
//! keep-alive thresholds. It also refreshes the activity timestamp that guards
//! the reconnect window.

use super::{Connection, ConnectionEvent, ConnectionState};
use crate::error::SignalRError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Keep-alive thresholds negotiated with the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeepAlive {
    /// `false` when the server did not send a keep-alive timeout.
    pub activated: bool,
    /// Silence after which the connection is considered lost.
    pub timeout: Duration,
    /// Silence after which the user is warned that the connection is slow.
    pub timeout_warning: Duration,
    /// Expected interval between two server keep-alives.
    pub beat_interval: Duration,
    /// Whether the heartbeat is currently checking keep-alives.
    pub monitoring: bool,
    /// Set once the slow warning fired; cleared when traffic resumes.
    pub user_notified: bool,
}

/// Outcome of one keep-alive check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeepAliveStatus {
    Alive,
    /// First check past the warning threshold in this episode.
    Slow,
    /// Past the warning threshold, user already warned.
    StillSlow,
    Lost,
}

impl KeepAlive {
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        let Some(timeout) = timeout else {
            return Self::default();
        };
        let timeout_warning = timeout * 2 / 3;
        Self {
            activated: true,
            timeout,
            timeout_warning,
            beat_interval: (timeout - timeout_warning) / 3,
            monitoring: false,
            user_notified: false,
        }
    }

    /// Zero when keep-alive is disabled.
    pub(crate) fn timeout(&self) -> Duration {
        if self.activated { self.timeout } else { Duration::ZERO }
    }

    pub(crate) fn check(&mut self, elapsed: Duration) -> KeepAliveStatus {
        if elapsed >= self.timeout {
            return KeepAliveStatus::Lost;
        }
        if elapsed >= self.timeout_warning {
            if self.user_notified {
                return KeepAliveStatus::StillSlow;
            }
            self.user_notified = true;
            return KeepAliveStatus::Slow;
        }
        self.user_notified = false;
        KeepAliveStatus::Alive
    }
}

impl Connection {
    pub(super) fn start_monitoring_keep_alive(&self) {
        let supported = self
            .transport()
            .is_some_and(|transport| transport.supports_keep_alive());
        {
            let mut keep_alive = self.keep_alive.lock();
            if !keep_alive.activated || !supported {
                return;
            }
            if keep_alive.monitoring {
                warn!("Tried to monitor keep alive but it's already being monitored.");
                return;
            }
            keep_alive.monitoring = true;
            keep_alive.user_notified = false;
        }
        self.mark_last_message();
        info!("Now monitoring keep alive.");
    }

    pub(super) fn stop_monitoring_keep_alive(&self) {
        let mut keep_alive = self.keep_alive.lock();
        if keep_alive.monitoring {
            keep_alive.monitoring = false;
            debug!("Stopping the monitoring of the keep alive.");
        }
    }

    /// Starts the heartbeat, replacing any previous one. The first beat runs
    /// immediately.
    pub(super) fn start_heartbeat(self: &Arc<Self>) {
        self.session.lock().last_active_at = Instant::now();

        let token = CancellationToken::new();
        if let Some(previous) = self.heartbeat.lock().replace(token.clone()) {
            previous.cancel();
        }

        let connection = Arc::downgrade(self);
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                let Some(conn) = connection.upgrade() else {
                    break;
                };
                if !conn.beat().await {
                    break;
                }
                drop(conn);

                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
        });
    }

    /// One heartbeat. Returns `false` once the connection was stopped for
    /// inactivity.
    async fn beat(self: &Arc<Self>) -> bool {
        let monitoring = self.keep_alive.lock().monitoring;
        if monitoring {
            self.check_if_alive().await;
        }
        self.mark_active().await
    }

    async fn check_if_alive(self: &Arc<Self>) {
        if self.state() != ConnectionState::Connected {
            return;
        }

        let elapsed = self.session.lock().last_message_at.elapsed();
        let status = self.keep_alive.lock().check(elapsed);
        match status {
            KeepAliveStatus::Lost => {
                warn!(
                    "Keep alive timed out. Notifying transport that connection has been lost."
                );
                if let Some(transport) = self.transport() {
                    transport.lost_connection(self).await;
                }
            }
            KeepAliveStatus::Slow => {
                warn!("Keep alive has been missed, connection may be dead/slow.");
                self.emit(ConnectionEvent::ConnectionSlow);
            }
            KeepAliveStatus::Alive | KeepAliveStatus::StillSlow => {}
        }
    }

    /// Refreshes the activity timestamp if the reconnect window still holds.
    pub(super) async fn mark_active(&self) -> bool {
        if !self.verify_last_active().await {
            return false;
        }
        self.session.lock().last_active_at = Instant::now();
        true
    }

    /// Stops the connection if it has been inactive for longer than the
    /// reconnect window.
    pub(super) async fn verify_last_active(&self) -> bool {
        let inactive = self.session.lock().last_active_at.elapsed();
        if inactive < self.reconnect_window {
            return true;
        }

        let error = SignalRError::InactivityTimeout {
            inactive_ms: inactive.as_millis(),
            window_ms: self.reconnect_window.as_millis(),
        };
        warn!("{error}");
        self.emit_error(error);
        if let Err(e) = self.stop(false).await {
            debug!("Error while stopping an inactive connection: {e}");
        }
        false
    }
}
