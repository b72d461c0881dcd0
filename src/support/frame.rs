//! OCPP-J message framing
//!
//! The OCPP-J transport envelope is a JSON array of fixed arity per
//! message type:
//!
//! - **Call**       `[2, "<messageId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<messageId>", {<payload>}]`
//! - **CallError**  `[4, "<messageId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`

use serde_json::{json, Value};

use super::errors::{ErrorCode, OcppError};

pub const MESSAGE_TYPE_CALL: u64 = 2;
pub const MESSAGE_TYPE_CALL_RESULT: u64 = 3;
pub const MESSAGE_TYPE_CALL_ERROR: u64 = 4;

/// A parsed OCPP-J envelope.
#[derive(Debug, Clone)]
pub enum Frame {
    Call {
        message_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        message_id: String,
        payload: Value,
    },
    CallError {
        message_id: String,
        code: String,
        description: String,
        details: Value,
    },
}

impl Frame {
    /// Parse raw JSON text into a frame.
    pub fn parse(text: &str) -> Result<Self, OcppError> {
        let arr: Vec<Value> = serde_json::from_str(text).map_err(|e| {
            OcppError::new(ErrorCode::GenericError, format!("Invalid JSON: {}", e))
        })?;

        let message_type = arr
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| protocol_error("messageTypeId must be a number"))?;
        let message_id = arr
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| protocol_error("messageId must be a string"))?
            .to_string();

        match message_type {
            MESSAGE_TYPE_CALL => {
                if arr.len() < 4 {
                    return Err(protocol_error("CALL frame requires 4 elements"));
                }
                let action = arr[2]
                    .as_str()
                    .ok_or_else(|| protocol_error("action must be a string"))?
                    .to_string();
                Ok(Self::Call {
                    message_id,
                    action,
                    payload: arr[3].clone(),
                })
            }
            MESSAGE_TYPE_CALL_RESULT => {
                if arr.len() < 3 {
                    return Err(protocol_error("CALLRESULT frame requires 3 elements"));
                }
                Ok(Self::CallResult {
                    message_id,
                    payload: arr[2].clone(),
                })
            }
            MESSAGE_TYPE_CALL_ERROR => {
                if arr.len() < 4 {
                    return Err(protocol_error("CALLERROR frame requires at least 4 elements"));
                }
                Ok(Self::CallError {
                    message_id,
                    code: arr[2].as_str().unwrap_or("GenericError").to_string(),
                    description: arr
                        .get(3)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    details: arr.get(4).cloned().unwrap_or_else(|| json!({})),
                })
            }
            other => Err(protocol_error(format!(
                "Unknown message type id {}",
                other
            ))),
        }
    }

    /// Serialize the frame to its wire representation.
    pub fn serialize(&self) -> String {
        let arr = match self {
            Self::Call {
                message_id,
                action,
                payload,
            } => json!([MESSAGE_TYPE_CALL, message_id, action, payload]),
            Self::CallResult {
                message_id,
                payload,
            } => json!([MESSAGE_TYPE_CALL_RESULT, message_id, payload]),
            Self::CallError {
                message_id,
                code,
                description,
                details,
            } => json!([
                MESSAGE_TYPE_CALL_ERROR,
                message_id,
                code,
                description,
                details
            ]),
        };
        arr.to_string()
    }

    pub fn message_id(&self) -> &str {
        match self {
            Self::Call { message_id, .. }
            | Self::CallResult { message_id, .. }
            | Self::CallError { message_id, .. } => message_id,
        }
    }

    /// Build a CALLERROR frame answering `message_id` with `error`.
    pub fn error_response(message_id: impl Into<String>, error: &OcppError) -> Self {
        Self::CallError {
            message_id: message_id.into(),
            code: error.code.as_str().to_string(),
            description: error.description.clone(),
            details: error.details.clone().unwrap_or_else(|| json!({})),
        }
    }
}

fn protocol_error(description: impl Into<String>) -> OcppError {
    OcppError::new(ErrorCode::ProtocolError, description)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_call() {
        let text = r#"[2,"m1","Reset",{"type":"Hard"}]"#;
        match Frame::parse(text).unwrap() {
            Frame::Call {
                message_id,
                action,
                payload,
            } => {
                assert_eq!(message_id, "m1");
                assert_eq!(action, "Reset");
                assert_eq!(payload["type"], "Hard");
            }
            other => panic!("expected CALL, got {:?}", other),
        }
    }

    #[test]
    fn parses_call_result() {
        let text = r#"[3,"m2",{"status":"Accepted","interval":30}]"#;
        match Frame::parse(text).unwrap() {
            Frame::CallResult {
                message_id,
                payload,
            } => {
                assert_eq!(message_id, "m2");
                assert_eq!(payload["interval"], 30);
            }
            other => panic!("expected CALLRESULT, got {:?}", other),
        }
    }

    #[test]
    fn parses_call_error_with_defaults() {
        let text = r#"[4,"m3","NotImplemented","nope",{}]"#;
        match Frame::parse(text).unwrap() {
            Frame::CallError {
                code, description, ..
            } => {
                assert_eq!(code, "NotImplemented");
                assert_eq!(description, "nope");
            }
            other => panic!("expected CALLERROR, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_message_type() {
        let err = Frame::parse(r#"[7,"m4",{}]"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn rejects_short_call() {
        assert!(Frame::parse(r#"[2,"m5"]"#).is_err());
    }

    #[test]
    fn serialize_parse_round_trip() {
        let frame = Frame::Call {
            message_id: "m6".into(),
            action: "Heartbeat".into(),
            payload: json!({}),
        };
        let parsed = Frame::parse(&frame.serialize()).unwrap();
        assert_eq!(parsed.message_id(), "m6");
    }

    #[test]
    fn error_response_carries_code_and_description() {
        let err = OcppError::not_implemented("FooBar");
        let frame = Frame::error_response("m7", &err);
        let text = frame.serialize();
        assert!(text.starts_with(r#"[4,"m7","NotImplemented""#));
    }
}
