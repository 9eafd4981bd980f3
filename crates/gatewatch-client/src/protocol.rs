//! JSON frame types for the gateway WebSocket protocol.
//!
//! Every WebSocket text message carries exactly one of three frame shapes:
//!
//! ```text
//! request  {"type":"req","id":"<uuid>","method":"<name>","params":{...}}
//! response {"id":"<uuid>","ok":true,"payload":{...}}
//!          {"id":"<uuid>","ok":false,"error":{"code":1,"message":"..."}}
//! event    {"event":"<name>","seq":7,"payload":{...}}
//! ```
//!
//! [`parse_frame`] decodes a raw text message once into the typed [`Frame`]
//! enum so downstream code never inspects raw JSON maps.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use gatewatch_core::prelude::*;

/// Event name of the server-pushed handshake challenge.
pub const EVENT_CONNECT_CHALLENGE: &str = "connect.challenge";

/// Event name of the server heartbeat.
pub const EVENT_TICK: &str = "tick";

/// Method name of the authenticated connect request.
pub const METHOD_CONNECT: &str = "connect";

/// Protocol version advertised in both `minProtocol` and `maxProtocol`.
pub const PROTOCOL_VERSION: u32 = 3;

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

/// Outbound RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Always `"req"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Unique request ID used to correlate the response.
    pub id: String,
    /// Method name, e.g. `"sessions.list"` or `"connect"`.
    pub method: String,
    /// Method parameters; `{}` when the method takes none.
    #[serde(default)]
    pub params: Value,
}

impl RequestFrame {
    /// Create a request with a freshly minted UUID.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), method, params)
    }

    /// Create a request with a caller-chosen ID.
    pub fn with_id(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            kind: "req".to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Response to a request we sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// The ID matching the original request.
    pub id: String,
    /// `true` when the call succeeded.
    pub ok: bool,
    /// Successful result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Error payload, present when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    /// `true` for an intermediate acknowledgment (`"status":"accepted"`).
    ///
    /// The gateway may acknowledge a request before answering it; the
    /// terminal response follows later under the same ID.
    pub fn is_interim(&self) -> bool {
        self.ok
            && self
                .payload
                .as_ref()
                .and_then(|p| p.get("status"))
                .and_then(Value::as_str)
                == Some("accepted")
    }

    /// Convert into the caller-facing result.
    ///
    /// A successful response without a payload yields `Value::Null`.
    pub fn into_result(self) -> Result<Value> {
        if self.ok {
            return Ok(self.payload.unwrap_or(Value::Null));
        }
        match self.error {
            Some(err) => Err(Error::rpc(err.code.to_string(), err.message)),
            None => Err(Error::rpc("unknown", "request failed without error details")),
        }
    }
}

/// Error object of a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    /// Server-supplied error code.
    pub code: ErrorCode,
    /// Human-readable error message.
    #[serde(default)]
    pub message: String,
    /// Optional additional error data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Error code of an [`ErrorShape`].
///
/// The protocol specifies integer codes; some gateways send symbolic string
/// codes such as `"INVALID_REQUEST"`. Both are surfaced verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Numeric(i64),
    Named(String),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Numeric(code) => write!(f, "{code}"),
            ErrorCode::Named(code) => f.write_str(code),
        }
    }
}

// ---------------------------------------------------------------------------
// Event type
// ---------------------------------------------------------------------------

/// Unsolicited server-pushed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    /// Event name, e.g. `"agent"`, `"presence"`, `"tick"`.
    pub event: String,
    /// Optional server sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Event-specific payload.
    #[serde(default)]
    pub payload: Value,
}

impl EventFrame {
    /// `true` for events consumed by the connection itself and never
    /// forwarded to the registered handler.
    pub fn is_internal(&self) -> bool {
        self.event == EVENT_CONNECT_CHALLENGE || self.event == EVENT_TICK
    }

    /// The `nonce` of a `connect.challenge` event, if present and non-empty.
    pub fn challenge_nonce(&self) -> Option<&str> {
        if self.event != EVENT_CONNECT_CHALLENGE {
            return None;
        }
        self.payload
            .get("nonce")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Parsed message discriminant
// ---------------------------------------------------------------------------

/// The result of parsing a raw WebSocket text message.
#[derive(Debug)]
pub enum Frame {
    /// A request (normally only sent by us; decoded for completeness).
    Request(RequestFrame),
    /// A response to a request we sent (has an `id` field).
    Response(ResponseFrame),
    /// A server-pushed event (has an `event` field).
    Event(EventFrame),
    /// A message we received but could not interpret.
    Unknown(String),
}

/// Parse a raw WebSocket text message into a typed [`Frame`].
///
/// Dispatch logic:
/// - If the JSON has a top-level `"event"` field → [`EventFrame`].
/// - Else if it has a top-level `"id"` field → [`RequestFrame`] when
///   `"type":"req"`, otherwise [`ResponseFrame`].
/// - Anything else, including invalid JSON → [`Frame::Unknown`].
pub fn parse_frame(text: &str) -> Frame {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Frame::Unknown(text.to_string()),
    };

    let has_event = value.get("event").is_some_and(Value::is_string);
    let has_id = value.get("id").is_some_and(|v| !v.is_null());

    if has_event {
        match serde_json::from_value::<EventFrame>(value) {
            Ok(event) => Frame::Event(event),
            Err(_) => Frame::Unknown(text.to_string()),
        }
    } else if has_id {
        let is_request = value.get("type").and_then(Value::as_str) == Some("req");
        if is_request {
            match serde_json::from_value::<RequestFrame>(value) {
                Ok(request) => Frame::Request(request),
                Err(_) => Frame::Unknown(text.to_string()),
            }
        } else {
            match serde_json::from_value::<ResponseFrame>(value) {
                Ok(response) => Frame::Response(response),
                Err(_) => Frame::Unknown(text.to_string()),
            }
        }
    } else {
        Frame::Unknown(text.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_wire_shape() {
        let req = RequestFrame::with_id("abc", "sessions.list", json!({}));
        let val: Value = serde_json::from_str(&req.to_json().unwrap()).unwrap();
        assert_eq!(val["type"], "req");
        assert_eq!(val["id"], "abc");
        assert_eq!(val["method"], "sessions.list");
        assert_eq!(val["params"], json!({}));
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = RequestFrame::new("health", Value::Null);
        let b = RequestFrame::new("health", Value::Null);
        assert_ne!(a.id, b.id);
        assert!(uuid::Uuid::parse_str(&a.id).is_ok());
    }

    #[test]
    fn test_parse_success_response() {
        let frame = parse_frame(r#"{"type":"res","id":"1","ok":true,"payload":{"n":3}}"#);
        match frame {
            Frame::Response(res) => {
                assert_eq!(res.id, "1");
                assert!(!res.is_interim());
                assert_eq!(res.into_result().unwrap()["n"], 3);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_response_with_numeric_code() {
        let frame =
            parse_frame(r#"{"id":"2","ok":false,"error":{"code":404,"message":"no such session"}}"#);
        let Frame::Response(res) = frame else {
            panic!("expected response");
        };
        match res.into_result() {
            Err(Error::Rpc { code, message }) => {
                assert_eq!(code, "404");
                assert_eq!(message, "no such session");
            }
            other => panic!("expected rpc error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_response_with_string_code() {
        let frame = parse_frame(
            r#"{"id":"3","ok":false,"error":{"code":"INVALID_REQUEST","message":"bad params"}}"#,
        );
        let Frame::Response(res) = frame else {
            panic!("expected response");
        };
        let err = res.into_result().unwrap_err();
        assert!(err.to_string().contains("INVALID_REQUEST"));
    }

    #[test]
    fn test_failed_response_without_error_object() {
        let res = ResponseFrame {
            id: "4".into(),
            ok: false,
            payload: None,
            error: None,
        };
        assert!(matches!(res.into_result(), Err(Error::Rpc { .. })));
    }

    #[test]
    fn test_ok_without_payload_is_null() {
        let Frame::Response(res) = parse_frame(r#"{"id":"5","ok":true}"#) else {
            panic!("expected response");
        };
        assert_eq!(res.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_accepted_status_is_interim() {
        let Frame::Response(res) =
            parse_frame(r#"{"id":"6","ok":true,"payload":{"status":"accepted"}}"#)
        else {
            panic!("expected response");
        };
        assert!(res.is_interim());

        let Frame::Response(done) =
            parse_frame(r#"{"id":"6","ok":true,"payload":{"status":"done"}}"#)
        else {
            panic!("expected response");
        };
        assert!(!done.is_interim());
    }

    #[test]
    fn test_parse_event_takes_precedence_over_id() {
        let frame = parse_frame(r#"{"event":"agent","id":"7","seq":12,"payload":{"x":1}}"#);
        match frame {
            Frame::Event(ev) => {
                assert_eq!(ev.event, "agent");
                assert_eq!(ev.seq, Some(12));
                assert_eq!(ev.payload["x"], 1);
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_challenge_nonce_extraction() {
        let Frame::Event(ev) = parse_frame(
            r#"{"type":"event","event":"connect.challenge","payload":{"nonce":"xyz123","ts":1}}"#,
        ) else {
            panic!("expected event");
        };
        assert!(ev.is_internal());
        assert_eq!(ev.challenge_nonce(), Some("xyz123"));

        let tick = EventFrame {
            event: EVENT_TICK.into(),
            seq: None,
            payload: json!({ "nonce": "ignored" }),
        };
        assert!(tick.is_internal());
        assert_eq!(tick.challenge_nonce(), None);
    }

    #[test]
    fn test_empty_nonce_is_none() {
        let ev = EventFrame {
            event: EVENT_CONNECT_CHALLENGE.into(),
            seq: None,
            payload: json!({ "nonce": "" }),
        };
        assert_eq!(ev.challenge_nonce(), None);
    }

    #[test]
    fn test_parse_request_frame() {
        let frame = parse_frame(r#"{"type":"req","id":"8","method":"connect","params":{}}"#);
        assert!(matches!(frame, Frame::Request(r) if r.method == "connect"));
    }

    #[test]
    fn test_malformed_and_unrecognized_are_unknown() {
        assert!(matches!(parse_frame("not json"), Frame::Unknown(_)));
        assert!(matches!(parse_frame(r#"{"hello":"world"}"#), Frame::Unknown(_)));
        assert!(matches!(parse_frame(r#"{"id":"9"}"#), Frame::Unknown(_)));
        assert!(matches!(parse_frame(r#"[1,2,3]"#), Frame::Unknown(_)));
        assert!(matches!(parse_frame(r#"{"id":null,"ok":true}"#), Frame::Unknown(_)));
    }
}
