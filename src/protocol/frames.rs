//! Frame envelope encode/decode.
//!
//! Decoding is two-phase: read the `type` discriminant, then deserialize the
//! matching variant. Unknown object fields are ignored for forward
//! compatibility; a literal `null` for request params decodes to absent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ERROR_INVALID_JSON, ERROR_MISSING_FIELD, ERROR_UNKNOWN_TYPE};

/// Structured framing error carrying the offending field for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError {
    pub code: &'static str,
    pub field: Option<&'static str>,
    pub message: String,
}

impl FrameError {
    fn invalid_json(message: String) -> Self {
        Self {
            code: ERROR_INVALID_JSON,
            field: None,
            message,
        }
    }

    fn missing_field(field: &'static str, message: &str) -> Self {
        Self {
            code: ERROR_MISSING_FIELD,
            field: Some(field),
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.field {
            Some(field) => write!(
                f,
                "frame error [{}]: {} (field={})",
                self.code, self.message, field
            ),
            None => write!(f, "frame error [{}]: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for FrameError {}

/// Error object carried in failed responses and invoke results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    #[serde(default)]
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
}

/// Decoded frame union.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(RequestFrame),
    Response(ResponseFrame),
    Event(EventFrame),
}

/// Decode a single wire frame.
pub fn parse_frame(data: &str) -> Result<Frame, FrameError> {
    let value: Value = serde_json::from_str(data)
        .map_err(|e| FrameError::invalid_json(format!("invalid frame JSON: {e}")))?;

    let frame_type = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if frame_type.is_empty() {
        return Err(FrameError::missing_field(
            "type",
            "frame missing required \"type\" field",
        ));
    }

    match frame_type {
        "req" => {
            // A literal null for params deserializes to None, satisfying the
            // null-means-absent rule.
            let req: RequestFrame = serde_json::from_value(value)
                .map_err(|e| FrameError::invalid_json(format!("invalid request frame JSON: {e}")))?;
            if req.id.is_empty() {
                return Err(FrameError::missing_field(
                    "id",
                    "request frame missing required \"id\" field",
                ));
            }
            if req.method.is_empty() {
                return Err(FrameError::missing_field(
                    "method",
                    "request frame missing required \"method\" field",
                ));
            }
            Ok(Frame::Request(req))
        }
        "res" => {
            let res: ResponseFrame = serde_json::from_value(value).map_err(|e| {
                FrameError::invalid_json(format!("invalid response frame JSON: {e}"))
            })?;
            if res.id.is_empty() {
                return Err(FrameError::missing_field(
                    "id",
                    "response frame missing required \"id\" field",
                ));
            }
            Ok(Frame::Response(res))
        }
        "event" => {
            let evt: EventFrame = serde_json::from_value(value)
                .map_err(|e| FrameError::invalid_json(format!("invalid event frame JSON: {e}")))?;
            if evt.event.is_empty() {
                return Err(FrameError::missing_field(
                    "event",
                    "event frame missing required \"event\" field",
                ));
            }
            Ok(Frame::Event(evt))
        }
        other => Err(FrameError {
            code: ERROR_UNKNOWN_TYPE,
            field: None,
            message: format!("unknown frame type: {other:?}"),
        }),
    }
}

fn tag(value: Value, frame_type: &str) -> String {
    let mut obj = match value {
        Value::Object(obj) => obj,
        _ => serde_json::Map::new(),
    };
    obj.insert("type".to_string(), Value::String(frame_type.to_string()));
    // Serializing a Map<String, Value> cannot fail.
    Value::Object(obj).to_string()
}

/// Build a JSON-encoded request frame.
pub fn marshal_request(id: &str, method: &str, params: Option<Value>) -> Result<String, FrameError> {
    if id.is_empty() {
        return Err(FrameError::missing_field(
            "id",
            "request frame missing required \"id\" field",
        ));
    }
    if method.is_empty() {
        return Err(FrameError::missing_field(
            "method",
            "request frame missing required \"method\" field",
        ));
    }
    let frame = RequestFrame {
        id: id.to_string(),
        method: method.to_string(),
        params,
    };
    let value = serde_json::to_value(&frame)
        .map_err(|e| FrameError::invalid_json(format!("failed to marshal request frame: {e}")))?;
    Ok(tag(value, "req"))
}

/// Build a JSON-encoded response frame.
pub fn marshal_response(
    id: &str,
    ok: bool,
    payload: Option<Value>,
    error: Option<ErrorShape>,
) -> Result<String, FrameError> {
    if id.is_empty() {
        return Err(FrameError::missing_field(
            "id",
            "response frame missing required \"id\" field",
        ));
    }
    let frame = ResponseFrame {
        id: id.to_string(),
        ok,
        payload,
        error,
    };
    let value = serde_json::to_value(&frame)
        .map_err(|e| FrameError::invalid_json(format!("failed to marshal response frame: {e}")))?;
    Ok(tag(value, "res"))
}

/// Build a JSON-encoded event frame.
pub fn marshal_event(event: &str, payload: Option<Value>) -> Result<String, FrameError> {
    if event.is_empty() {
        return Err(FrameError::missing_field(
            "event",
            "event frame missing required \"event\" field",
        ));
    }
    let frame = EventFrame {
        event: event.to_string(),
        payload,
        seq: None,
    };
    let value = serde_json::to_value(&frame)
        .map_err(|e| FrameError::invalid_json(format!("failed to marshal event frame: {e}")))?;
    Ok(tag(value, "event"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_request_frame() {
        let frame = parse_frame(r#"{"type":"req","id":"r1","method":"connect","params":{"a":1}}"#)
            .unwrap();
        match frame {
            Frame::Request(req) => {
                assert_eq!(req.id, "r1");
                assert_eq!(req.method, "connect");
                assert_eq!(req.params, Some(json!({"a": 1})));
            }
            other => panic!("expected request frame, got {other:?}"),
        }
    }

    #[test]
    fn parse_request_null_params_becomes_absent() {
        let frame = parse_frame(r#"{"type":"req","id":"r1","method":"ping","params":null}"#)
            .unwrap();
        match frame {
            Frame::Request(req) => assert_eq!(req.params, None),
            other => panic!("expected request frame, got {other:?}"),
        }
    }

    #[test]
    fn parse_response_frame_with_error() {
        let frame = parse_frame(
            r#"{"type":"res","id":"r1","ok":false,"error":{"code":"UNAUTHORIZED","message":"no"}}"#,
        )
        .unwrap();
        match frame {
            Frame::Response(res) => {
                assert!(!res.ok);
                assert_eq!(res.error.unwrap().code, "UNAUTHORIZED");
                assert!(res.payload.is_none());
            }
            other => panic!("expected response frame, got {other:?}"),
        }
    }

    #[test]
    fn parse_event_frame_with_seq() {
        let frame =
            parse_frame(r#"{"type":"event","event":"tick","payload":{"ts":1},"seq":7}"#).unwrap();
        match frame {
            Frame::Event(evt) => {
                assert_eq!(evt.event, "tick");
                assert_eq!(evt.seq, Some(7));
            }
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_invalid_json() {
        let err = parse_frame("{not json").unwrap_err();
        assert_eq!(err.code, "INVALID_JSON");
    }

    #[test]
    fn parse_rejects_missing_type() {
        let err = parse_frame(r#"{"id":"r1","method":"connect"}"#).unwrap_err();
        assert_eq!(err.code, "MISSING_FIELD");
        assert_eq!(err.field, Some("type"));
    }

    #[test]
    fn parse_rejects_unknown_type() {
        let err = parse_frame(r#"{"type":"bogus"}"#).unwrap_err();
        assert_eq!(err.code, "UNKNOWN_TYPE");
    }

    #[test]
    fn parse_rejects_missing_request_fields() {
        let err = parse_frame(r#"{"type":"req","method":"connect"}"#).unwrap_err();
        assert_eq!(err.code, "MISSING_FIELD");
        assert_eq!(err.field, Some("id"));

        let err = parse_frame(r#"{"type":"req","id":"r1"}"#).unwrap_err();
        assert_eq!(err.field, Some("method"));

        let err = parse_frame(r#"{"type":"event","payload":{}}"#).unwrap_err();
        assert_eq!(err.field, Some("event"));

        let err = parse_frame(r#"{"type":"res","ok":true}"#).unwrap_err();
        assert_eq!(err.field, Some("id"));
    }

    #[test]
    fn parse_ignores_unknown_fields() {
        let frame = parse_frame(
            r#"{"type":"req","id":"r1","method":"connect","futureField":true}"#,
        )
        .unwrap();
        assert!(matches!(frame, Frame::Request(_)));
    }

    #[test]
    fn marshal_round_trips() {
        let encoded = marshal_request("r1", "connect", Some(json!({"minProtocol": 3}))).unwrap();
        let decoded = parse_frame(&encoded).unwrap();
        assert_eq!(
            decoded,
            Frame::Request(RequestFrame {
                id: "r1".to_string(),
                method: "connect".to_string(),
                params: Some(json!({"minProtocol": 3})),
            })
        );

        let encoded = marshal_response(
            "r1",
            false,
            None,
            Some(ErrorShape::new("NOT_PAIRED", "{\"requestId\":\"x\"}")),
        )
        .unwrap();
        let decoded = parse_frame(&encoded).unwrap();
        match decoded {
            Frame::Response(res) => assert_eq!(res.error.unwrap().code, "NOT_PAIRED"),
            other => panic!("expected response frame, got {other:?}"),
        }

        let encoded = marshal_event("shutdown", None).unwrap();
        let decoded = parse_frame(&encoded).unwrap();
        match decoded {
            Frame::Event(evt) => {
                assert_eq!(evt.event, "shutdown");
                assert!(evt.payload.is_none());
            }
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    #[test]
    fn marshal_validates_required_fields() {
        assert_eq!(
            marshal_request("", "connect", None).unwrap_err().field,
            Some("id")
        );
        assert_eq!(
            marshal_request("r1", "", None).unwrap_err().field,
            Some("method")
        );
        assert_eq!(
            marshal_response("", true, None, None).unwrap_err().field,
            Some("id")
        );
        assert_eq!(marshal_event("", None).unwrap_err().field, Some("event"));
    }

    #[test]
    fn payload_and_error_never_both_serialized() {
        // A failed response carries error only; payload stays absent.
        let encoded = marshal_response("r1", false, None, Some(ErrorShape::new("X", "y"))).unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert!(value.get("payload").is_none());
        assert!(value.get("error").is_some());
    }
}
