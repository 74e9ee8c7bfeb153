//! Hub proxies.
//!
//! A [`HubProxy`] calls server methods on one hub and receives the calls the
//! server makes on it. Proxies are created through
//! [`SignalRClient::create_hub`](crate::SignalRClient::create_hub) and can be
//! cloned freely.

use crate::client::ClientShared;
use crate::connection::bus::InvocationCallback;
use crate::error::{HubErrorKind, Result, SignalRError};
use crate::protocol::{HubInvocation, HubResponse, HubState};
use futures_channel::{mpsc, oneshot};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

type Handler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// A server-to-client call received on a hub.
#[derive(Debug, Clone, PartialEq)]
pub struct HubEvent {
    pub method: String,
    pub args: Vec<Value>,
}

/// Hub data shared by every clone of a [`HubProxy`] and by the message bus.
pub(crate) struct HubCore {
    name: String,
    state: Mutex<HubState>,
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
    events: broadcast::Sender<HubEvent>,
    client: Weak<ClientShared>,
}

impl HubCore {
    pub(crate) fn new(name: &str, client: Weak<ClientShared>, capacity: usize) -> Arc<Self> {
        let (events, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(HubState::new()),
            handlers: RwLock::new(HashMap::new()),
            events,
            client,
        })
    }

    fn merge_state(&self, state: Option<&HubState>) {
        if let Some(state) = state {
            let mut current = self.state.lock();
            for (key, value) in state {
                current.insert(key.clone(), value.clone());
            }
        }
    }

    /// Handles a server-to-client call targeting this hub.
    pub(crate) fn handle_invocation(&self, invocation: HubInvocation) {
        self.merge_state(invocation.state.as_ref());
        debug!("Server called {}.{}.", self.name, invocation.method);

        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(&invocation.method)
            .cloned()
            .unwrap_or_default();
        for handler in &handlers {
            handler(invocation.args.clone());
        }

        let _ = self.events.send(HubEvent {
            method: invocation.method,
            args: invocation.args,
        });
    }

    /// Turns a terminal response into the caller's result.
    fn complete(&self, method: &str, response: HubResponse) -> Result<Value> {
        let Some(message) = response.error else {
            debug!("Invoked {}.{}.", self.name, method);
            return Ok(response.result.unwrap_or(Value::Null));
        };

        if let Some(stack_trace) = &response.stack_trace {
            error!("{message}\n{stack_trace}.");
        }
        let kind = if response.is_hub_exception {
            HubErrorKind::HubException
        } else {
            HubErrorKind::Exception
        };
        warn!(
            "{}.{} failed to execute. Error: {message}",
            self.name, method
        );
        Err(SignalRError::HubInvocation {
            hub: self.name.clone(),
            method: method.to_string(),
            message,
            kind,
            stack_trace: response.stack_trace,
            data: response.error_data,
        })
    }
}

/// Client-side proxy for one server hub.
#[derive(Clone)]
pub struct HubProxy {
    core: Arc<HubCore>,
}

impl HubProxy {
    pub(crate) fn new(core: Arc<HubCore>) -> Self {
        Self { core }
    }

    /// Hub name as given to `create_hub`.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Current hub state. It is sent with every invocation and updated from
    /// the state the server returns.
    pub fn state(&self) -> HubState {
        self.core.state.lock().clone()
    }

    pub fn set_state(&self, key: impl Into<String>, value: Value) {
        self.core.state.lock().insert(key.into(), value);
    }

    /// Registers a handler for server calls to `method`. Method names match
    /// exactly.
    pub fn on<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        self.core
            .handlers
            .write()
            .entry(method.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Receives every server call on this hub, whatever the method.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.core.events.subscribe()
    }

    /// Invokes `method` on the server and waits for its result.
    ///
    /// Progress notifications are discarded; use
    /// [`invoke_with_progress`](Self::invoke_with_progress) to observe them.
    ///
    /// # Errors
    ///
    /// * [`SignalRError::NotConnected`] - No transport is bound, or the client
    ///   stopped before the server answered.
    /// * [`SignalRError::HubInvocation`] - The server reported an exception.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.invoke_with_progress(method, args).await?.result().await
    }

    /// Sends an invocation and returns a handle to its progress and result.
    pub async fn invoke_with_progress(&self, method: &str, args: Vec<Value>) -> Result<Invocation> {
        let client = self.core.client.upgrade().ok_or(SignalRError::NotConnected)?;
        let id = client.bus.next_invocation_id();

        let state = {
            let state = self.core.state.lock();
            (!state.is_empty()).then(|| state.clone())
        };
        let invocation = HubInvocation {
            hub: self.core.name.clone(),
            method: method.to_string(),
            args,
            callback_id: Some(id),
            state,
        };

        let (progress_tx, progress_rx) = mpsc::unbounded();
        let (result_tx, result_rx) = oneshot::channel();
        let mut result_tx = Some(result_tx);
        let core = Arc::clone(&self.core);
        let method = method.to_string();

        let callback: InvocationCallback = Box::new(move |response: HubResponse| {
            core.merge_state(response.state.as_ref());
            if let Some(progress) = response.progress {
                let _ = progress_tx.unbounded_send(progress.data);
                return;
            }
            let outcome = core.complete(&method, response);
            if let Some(tx) = result_tx.take() {
                let _ = tx.send(outcome);
            }
        });

        client.send_with_callback(id, &invocation, callback).await?;
        Ok(Invocation {
            id,
            progress: progress_rx,
            result: result_rx,
        })
    }
}

impl std::fmt::Debug for HubProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubProxy")
            .field("name", &self.core.name)
            .finish()
    }
}

/// An invocation in flight.
///
/// Progress notifications arrive in order and always before the result.
pub struct Invocation {
    id: u64,
    progress: mpsc::UnboundedReceiver<Value>,
    result: oneshot::Receiver<Result<Value>>,
}

impl Invocation {
    /// Callback id sent to the server.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next progress notification, or `None` once the invocation completed.
    pub async fn next_progress(&mut self) -> Option<Value> {
        self.progress.next().await
    }

    /// Waits for the terminal result.
    pub async fn result(self) -> Result<Value> {
        self.result.await.unwrap_or(Err(SignalRError::NotConnected))
    }
}
