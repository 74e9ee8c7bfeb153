//! SignalR wire messages.
//!
//! The server and client exchange JSON objects with single-letter keys
//! ("minified" messages). The structs here carry descriptive field names in
//! Rust and map them to the single-letter wire keys with serde attributes, so
//! the schema lives in one place.
//!
//! For the wire format, see the ASP.NET SignalR 2.x persistent connection and
//! hubs protocol.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// State blob attached to hub invocations and responses.
pub type HubState = Map<String, Value>;

/// A hub method call.
///
/// Used in both directions:
/// - client → server, with `callback_id` set so the response can be correlated,
/// - server → client, without `callback_id`, to trigger a local event.
///
/// Example: `{"H":"chatHub","M":"send","A":["bob","hi"],"I":0}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubInvocation {
    /// Hub name.
    #[serde(rename = "H")]
    pub hub: String,
    /// Method name.
    #[serde(rename = "M")]
    pub method: String,
    /// Positional arguments.
    #[serde(rename = "A", default)]
    pub args: Vec<Value>,
    /// Invocation callback id (client → server only).
    #[serde(
        rename = "I",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_id"
    )]
    pub callback_id: Option<u64>,
    /// Hub state sent along with the call.
    #[serde(rename = "S", default, skip_serializing_if = "Option::is_none")]
    pub state: Option<HubState>,
}

/// Progress notification carried inside a [`HubResponse`].
///
/// Example: `{"I":"3","D":50}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubProgress {
    /// Callback id of the invocation reporting progress.
    #[serde(rename = "I", deserialize_with = "required_id")]
    pub id: u64,
    /// Progress payload.
    #[serde(rename = "D", default)]
    pub data: Value,
}

/// Response to a client → server hub invocation.
///
/// Exactly one terminal response (result or error) arrives per callback id,
/// possibly preceded by progress responses.
///
/// Example (success): `{"I":"7","R":"ok"}`
/// Example (error):   `{"I":"7","E":"boom","H":true}`
/// Example (progress): `{"I":"P|7","P":{"I":"7","D":10}}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HubResponse {
    /// Hub state changes made by the server.
    #[serde(rename = "S", default, skip_serializing_if = "Option::is_none")]
    pub state: Option<HubState>,
    /// Return value.
    #[serde(rename = "R", default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Progress notification.
    #[serde(rename = "P", default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<HubProgress>,
    /// Callback id. Progress frames use a prefixed id (`"P|7"`) that does not
    /// parse as a number, so this is `None` for them.
    #[serde(
        rename = "I",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_id"
    )]
    pub id: Option<u64>,
    /// Whether `error` came from a `HubException`.
    #[serde(rename = "H", default, skip_serializing_if = "is_false")]
    pub is_hub_exception: bool,
    /// Error message.
    #[serde(rename = "E", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Server stack trace (only with detailed errors enabled).
    #[serde(rename = "T", default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    /// Extra error data attached to a `HubException`.
    #[serde(rename = "D", default, skip_serializing_if = "Option::is_none")]
    pub error_data: Option<Value>,
}

/// Envelope used by the persistent connection to carry a batch of messages.
///
/// Example: `{"C":"d-5D2E3A-B,0|C,1","M":[{"H":"chatHub","M":"hello","A":[]}],"G":"..."}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistentResponse {
    /// Cursor of the last message in this batch.
    #[serde(rename = "C", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Messages, in the server's causal order.
    #[serde(rename = "M", default)]
    pub messages: Vec<Value>,
    /// Set on the first frame of a fresh connection.
    #[serde(rename = "S", default, with = "flag", skip_serializing_if = "is_false")]
    pub initialized: bool,
    /// The server asks the client to disconnect.
    #[serde(rename = "D", default, with = "flag", skip_serializing_if = "is_false")]
    pub disconnect: bool,
    /// The server asks the client to reconnect (polling transports).
    #[serde(rename = "T", default, with = "flag", skip_serializing_if = "is_false")]
    pub should_reconnect: bool,
    /// Delay before the next poll, in milliseconds.
    #[serde(rename = "L", default, skip_serializing_if = "Option::is_none")]
    pub long_poll_delay: Option<u64>,
    /// New groups token.
    #[serde(rename = "G", default, skip_serializing_if = "Option::is_none")]
    pub groups_token: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Callback ids are numbers on the way out, but servers echo them back as
/// strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

fn lenient_id<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<RawId>::deserialize(deserializer)? {
        Some(RawId::Number(n)) => Some(n),
        Some(RawId::Text(s)) => s.parse().ok(),
        None => None,
    })
}

fn required_id<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match RawId::deserialize(deserializer)? {
        RawId::Number(n) => Ok(n),
        RawId::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Flags go over the wire as `1`, but `true`, `0` and `false` are accepted.
mod flag {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S>(value: &bool, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(deserializer)? {
            Value::Bool(b) => b,
            Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
            Value::String(s) => !s.is_empty(),
            Value::Null => false,
            Value::Array(_) | Value::Object(_) => true,
        })
    }
}

