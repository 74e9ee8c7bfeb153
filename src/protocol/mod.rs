//! SignalR protocol implementation.
//!
//! This module provides the wire types and the JSON codec for the ASP.NET
//! SignalR persistent connection and hubs protocol.

mod codec;
mod frame;

pub use codec::{HubMessage, InboundFrame, JsonCodec, SignalRProtocolError};
pub use frame::{HubInvocation, HubProgress, HubResponse, HubState, PersistentResponse};
