//! JSON codec for SignalR messages.
//!
//! Converts between the minified wire representation ([`Value`] objects with
//! single-letter keys) and the expanded types in [`crate::protocol::frame`],
//! and classifies inbound text frames.

use serde::Serialize;
use serde_json::Value;

use crate::protocol::{HubInvocation, HubResponse, PersistentResponse};

/// Errors that can occur during protocol encoding or decoding.
#[derive(thiserror::Error, Debug)]
pub enum SignalRProtocolError {
    /// The payload is not valid JSON or does not fit the expected shape.
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    /// Received a JSON object that is neither an envelope nor a hub message.
    #[error("Unrecognized message: {0}")]
    UnrecognizedMessage(String),
}

/// A decoded inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Persistent-connection envelope (an empty object or one carrying `M`).
    Persistent(PersistentResponse),
    /// Anything else: a hub message to route directly.
    Direct(Value),
}

/// A hub-level message after routing classification.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Progress, result or error for a client invocation.
    Response(HubResponse),
    /// Server → client method call.
    Invocation(HubInvocation),
}

/// Codec for the SignalR JSON protocol.
///
/// This struct provides static methods; it holds no state.
pub struct JsonCodec;

impl JsonCodec {
    /// Decodes a text frame received from the server.
    ///
    /// Returns `Ok(None)` for frames that carry nothing (`null`).
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid JSON or if an envelope has
    /// malformed fields.
    pub fn decode(text: &str) -> Result<Option<InboundFrame>, SignalRProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        Self::decode_value(value)
    }

    /// Same as [`JsonCodec::decode`] for an already parsed value.
    pub fn decode_value(value: Value) -> Result<Option<InboundFrame>, SignalRProtocolError> {
        match &value {
            Value::Null => Ok(None),
            Value::Object(map) if map.is_empty() || map.get("M").is_some_and(Value::is_array) => {
                Ok(Some(InboundFrame::Persistent(Self::expand_persistent_response(value)?)))
            }
            _ => Ok(Some(InboundFrame::Direct(value))),
        }
    }

    /// Classifies a hub message.
    ///
    /// Anything carrying progress (`P`) or a callback id (`I`) is a response;
    /// anything carrying a hub (`H`) and method (`M`) is a server call.
    pub fn classify(value: Value) -> Result<HubMessage, SignalRProtocolError> {
        let Value::Object(map) = &value else {
            return Err(SignalRProtocolError::UnrecognizedMessage(value.to_string()));
        };

        if map.contains_key("P") || map.contains_key("I") {
            Ok(HubMessage::Response(Self::expand_hub_response(value)?))
        } else if is_hub_call(map) {
            Ok(HubMessage::Invocation(Self::expand_hub_invocation(value)?))
        } else {
            Err(SignalRProtocolError::UnrecognizedMessage(value.to_string()))
        }
    }

    pub fn expand_hub_response(minified: Value) -> Result<HubResponse, SignalRProtocolError> {
        Ok(serde_json::from_value(minified)?)
    }

    pub fn minify_hub_response(response: &HubResponse) -> Result<Value, SignalRProtocolError> {
        to_minified(response)
    }

    pub fn expand_hub_invocation(minified: Value) -> Result<HubInvocation, SignalRProtocolError> {
        Ok(serde_json::from_value(minified)?)
    }

    pub fn minify_hub_invocation(invocation: &HubInvocation) -> Result<Value, SignalRProtocolError> {
        to_minified(invocation)
    }

    pub fn expand_persistent_response(
        minified: Value,
    ) -> Result<PersistentResponse, SignalRProtocolError> {
        Ok(serde_json::from_value(minified)?)
    }

    pub fn minify_persistent_response(
        response: &PersistentResponse,
    ) -> Result<Value, SignalRProtocolError> {
        to_minified(response)
    }

    /// Turns an outbound payload into the text written to the socket.
    ///
    /// Strings pass through untouched; everything else is JSON-encoded.
    pub fn stringify(data: &Value) -> String {
        match data {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A server call carries `H` and `M`; an envelope's `M` is an array.
fn is_hub_call(map: &serde_json::Map<String, Value>) -> bool {
    map.contains_key("H") && map.get("M").is_some_and(Value::is_string)
}

fn to_minified<T: Serialize>(value: &T) -> Result<Value, SignalRProtocolError> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HubProgress;
    use serde_json::json;

    #[test]
    fn test_decode_empty_object_is_envelope() {
        let frame = JsonCodec::decode("{}").unwrap();
        assert_eq!(
            frame,
            Some(InboundFrame::Persistent(PersistentResponse::default()))
        );
    }

    #[test]
    fn test_decode_null_is_ignored() {
        assert_eq!(JsonCodec::decode("null").unwrap(), None);
    }

    #[test]
    fn test_decode_init_envelope() {
        let frame = JsonCodec::decode(r#"{"C":"d-1,0","S":1,"M":[],"G":"grp"}"#).unwrap();
        match frame {
            Some(InboundFrame::Persistent(envelope)) => {
                assert!(envelope.initialized);
                assert!(!envelope.disconnect);
                assert_eq!(envelope.message_id.as_deref(), Some("d-1,0"));
                assert_eq!(envelope.groups_token.as_deref(), Some("grp"));
                assert!(envelope.messages.is_empty());
            }
            other => panic!("Expected envelope, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_response_is_direct() {
        let frame = JsonCodec::decode(r#"{"I":"7","R":"ok"}"#).unwrap();
        assert_eq!(frame, Some(InboundFrame::Direct(json!({"I": "7", "R": "ok"}))));
    }

    #[test]
    fn test_decode_bare_hub_call_is_direct() {
        let raw = json!({"H": "chatHub", "M": "hello", "A": []});
        let frame = JsonCodec::decode(&raw.to_string()).unwrap();
        assert_eq!(frame, Some(InboundFrame::Direct(raw)));
    }

    #[test]
    fn test_decode_invalid_json() {
        assert!(matches!(
            JsonCodec::decode("{not json"),
            Err(SignalRProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_classify_result() {
        let message = JsonCodec::classify(json!({"I": 7, "R": "ok"})).unwrap();
        match message {
            HubMessage::Response(response) => {
                assert_eq!(response.id, Some(7));
                assert_eq!(response.result, Some(json!("ok")));
                assert!(response.error.is_none());
            }
            other => panic!("Expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_hub_exception() {
        let message = JsonCodec::classify(json!({"I": "7", "E": "boom", "H": true})).unwrap();
        match message {
            HubMessage::Response(response) => {
                assert_eq!(response.id, Some(7));
                assert_eq!(response.error.as_deref(), Some("boom"));
                assert!(response.is_hub_exception);
            }
            other => panic!("Expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_progress_uses_inner_id() {
        let message = JsonCodec::classify(json!({"I": "P|3", "P": {"I": "3", "D": 50}})).unwrap();
        match message {
            HubMessage::Response(response) => {
                assert_eq!(response.id, None);
                assert_eq!(
                    response.progress,
                    Some(HubProgress {
                        id: 3,
                        data: json!(50)
                    })
                );
            }
            other => panic!("Expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_server_call() {
        let message = JsonCodec::classify(json!({
            "H": "ChatHub",
            "M": "broadcastMessage",
            "A": ["bob", "hi"],
            "S": {"room": "lobby"}
        }))
        .unwrap();
        match message {
            HubMessage::Invocation(invocation) => {
                assert_eq!(invocation.hub, "ChatHub");
                assert_eq!(invocation.method, "broadcastMessage");
                assert_eq!(invocation.args, vec![json!("bob"), json!("hi")]);
                assert_eq!(invocation.callback_id, None);
                assert_eq!(invocation.state.unwrap()["room"], json!("lobby"));
            }
            other => panic!("Expected invocation, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_rejects_unknown_shape() {
        assert!(matches!(
            JsonCodec::classify(json!({"X": 1})),
            Err(SignalRProtocolError::UnrecognizedMessage(_))
        ));
        assert!(JsonCodec::classify(json!([1, 2])).is_err());
    }

    #[test]
    fn test_hub_response_round_trip() {
        let minified = json!({
            "S": {"count": 2},
            "R": {"value": [1, 2, 3]},
            "I": 4,
            "H": true,
            "E": "bad",
            "T": "at Hub.Call()",
            "D": {"code": 12}
        });
        let expanded = JsonCodec::expand_hub_response(minified.clone()).unwrap();
        assert_eq!(JsonCodec::minify_hub_response(&expanded).unwrap(), minified);
    }

    #[test]
    fn test_hub_invocation_minify() {
        let mut state = serde_json::Map::new();
        state.insert("name".into(), json!("bob"));
        let invocation = HubInvocation {
            hub: "chatHub".into(),
            method: "send".into(),
            args: vec![json!("hi")],
            callback_id: Some(0),
            state: Some(state),
        };
        let minified = JsonCodec::minify_hub_invocation(&invocation).unwrap();
        assert_eq!(
            minified,
            json!({"H": "chatHub", "M": "send", "A": ["hi"], "I": 0, "S": {"name": "bob"}})
        );
        assert_eq!(JsonCodec::expand_hub_invocation(minified).unwrap(), invocation);
    }

    #[test]
    fn test_persistent_response_round_trip() {
        let minified = json!({
            "C": "d-1,2",
            "M": [{"H": "h", "M": "m", "A": []}],
            "S": 1,
            "D": 1,
            "T": 1,
            "L": 250,
            "G": "token"
        });
        let expanded = JsonCodec::expand_persistent_response(minified.clone()).unwrap();
        assert!(expanded.initialized && expanded.disconnect && expanded.should_reconnect);
        assert_eq!(expanded.long_poll_delay, Some(250));
        assert_eq!(
            JsonCodec::minify_persistent_response(&expanded).unwrap(),
            minified
        );
    }

    #[test]
    fn test_stringify() {
        assert_eq!(JsonCodec::stringify(&json!("raw text")), "raw text");
        assert_eq!(JsonCodec::stringify(&json!({"H": "a"})), r#"{"H":"a"}"#);
    }
}
