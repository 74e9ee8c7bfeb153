//! Rust client for ASP.NET SignalR (protocol 1.x).
//!
//! This crate implements the classic SignalR persistent-connection and hubs
//! protocol: negotiation, ordered transport fallback, a connection state
//! machine with keep-alive supervision and automatic reconnection, and hub
//! RPC with progress notifications over the minified JSON wire format.
//!
//! # Quick start
//!
//! ```no_run
//! use signalrr_classic::{ConnectionEvent, SignalRClient};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SignalRClient::new();
//! let chat = client.create_hub("chatHub");
//! chat.on("addMessage", |args| println!("message: {args:?}"));
//!
//! let mut events = client.subscribe();
//! client.start("http://localhost:8080/signalr", None).await?;
//!
//! let mut invocation = chat.invoke_with_progress("longJob", vec![json!(3)]).await?;
//! while let Some(progress) = invocation.next_progress().await {
//!     println!("progress: {progress}");
//! }
//! println!("result: {}", invocation.result().await?);
//!
//! if let Ok(ConnectionEvent::Reconnecting) = events.try_recv() {
//!     println!("reconnecting...");
//! }
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod hub;
pub mod negotiate;
pub mod protocol;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::SignalRClient;
pub use config::ClientConfig;
pub use connection::{Connection, ConnectionEvent, ConnectionState, KeepAlive};
pub use error::{HubErrorKind, Result, SignalRError, TransportError};
pub use crate::http::{HttpClient, HttpResponse, ReqwestHttpClient};
pub use hub::{HubEvent, HubProxy, Invocation};
pub use negotiate::NegotiateResponse;
pub use protocol::{JsonCodec, SignalRProtocolError};
pub use transport::{Transport, WebSocketTransport};
