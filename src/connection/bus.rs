//! Internal message bus routing hub traffic.
//!
//! This module provides the core infrastructure for:
//! - Managing pending client invocations (`invoke` → response or progress),
//! - Dispatching server-to-client calls to the hub they target.
//!
//! Everything here is driven by one dispatcher task reading the connection's
//! inbound channel, so callbacks observe messages in arrival order.

use crate::hub::HubCore;
use crate::protocol::{HubInvocation, HubMessage, HubResponse, JsonCodec};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Callback registered for one outstanding invocation.
///
/// Called for every progress notification, then once more with the terminal
/// response.
pub(crate) type InvocationCallback = Box<dyn FnMut(HubResponse) + Send>;

/// Routes inbound hub messages.
///
/// This struct is not exposed to the user. The client owns one for its
/// lifetime, across reconnects.
#[derive(Default)]
pub(crate) struct MessageBus {
    /// Hubs keyed by lower-cased name.
    hubs: RwLock<HashMap<String, Arc<HubCore>>>,
    /// Invocations awaiting a terminal response, keyed by callback id.
    pending: Mutex<HashMap<u64, InvocationCallback>>,
    next_id: AtomicU64,
}

impl MessageBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocates the next callback id. Ids start at 0 and are never reused by
    /// a client.
    pub(crate) fn next_invocation_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_pending(&self, id: u64, callback: InvocationCallback) {
        self.pending.lock().insert(id, callback);
    }

    pub(crate) fn remove_pending(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drops every pending invocation. Their futures then resolve with
    /// [`SignalRError::NotConnected`](crate::SignalRError::NotConnected).
    pub(crate) fn clear_pending(&self) {
        let dropped = std::mem::take(&mut *self.pending.lock());
        if !dropped.is_empty() {
            debug!("Dropping {} pending invocation(s).", dropped.len());
        }
    }

    /// Returns the hub registered under `name`, creating it with `create`
    /// if needed. Lookup ignores case.
    pub(crate) fn hub_or_insert_with(
        &self,
        name: &str,
        create: impl FnOnce() -> Arc<HubCore>,
    ) -> Arc<HubCore> {
        let key = name.to_lowercase();
        if let Some(hub) = self.hubs.read().get(&key) {
            return Arc::clone(hub);
        }
        Arc::clone(self.hubs.write().entry(key).or_insert_with(create))
    }

    /// Lower-cased names of all registered hubs, sorted.
    pub(crate) fn hub_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hubs.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Routes one hub-level message.
    pub(crate) fn dispatch(&self, message: Value) {
        match JsonCodec::classify(message) {
            Ok(HubMessage::Response(response)) => self.complete(response),
            Ok(HubMessage::Invocation(invocation)) => self.dispatch_invocation(invocation),
            Err(e) => warn!("Ignoring message: {e}"),
        }
    }

    fn complete(&self, response: HubResponse) {
        if let Some(progress) = &response.progress {
            let id = progress.id;
            let mut pending = self.pending.lock();
            match pending.get_mut(&id) {
                Some(callback) => callback(response),
                None => debug!("Progress for unknown invocation {id}."),
            }
            return;
        }

        let Some(id) = response.id else {
            debug!("Response without a callback id.");
            return;
        };
        let callback = self.pending.lock().remove(&id);
        match callback {
            Some(mut callback) => callback(response),
            None => debug!("Response for unknown invocation {id}."),
        }
    }

    fn dispatch_invocation(&self, invocation: HubInvocation) {
        let hub = self.hubs.read().get(&invocation.hub.to_lowercase()).cloned();
        match hub {
            Some(hub) => hub.handle_invocation(invocation),
            None => debug!(
                "Server called {}.{} but no such hub is registered.",
                invocation.hub, invocation.method
            ),
        }
    }
}
