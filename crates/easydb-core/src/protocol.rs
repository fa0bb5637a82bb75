//! Wire protocol message types
//!
//! Requests and responses are JSON. Every HTTP response is wrapped in an
//! [`Envelope`]; the websocket stream carries [`StreamMessage`] text frames.

use json_patch::PatchOperation;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::hash::Fingerprint;

/// Path of the full-document endpoint (GET fetches, POST replaces)
pub const DATA_PATH: &str = "data";

/// Path of the patch endpoint
pub const DATA_UPDATES_PATH: &str = "dataUpdates";

/// Path of the change stream
pub const UPDATES_PATH: &str = "updates";

/// Response body wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error detail, only present when the server runs with `debug`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl Envelope {
    /// Successful response, optionally carrying a result
    pub fn ok(result: Option<Value>) -> Self {
        Self {
            status: true,
            result,
            message: None,
            stack: None,
        }
    }

    /// Failed response
    pub fn error(message: impl Into<String>, stack: Option<String>) -> Self {
        Self {
            status: false,
            result: None,
            message: Some(message.into()),
            stack,
        }
    }
}

/// Body of a patch request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub updates: Vec<PatchOperation>,
    /// Fingerprint of the document the patch was computed against
    #[serde(
        rename = "previousHash",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub previous_hash: Option<Fingerprint>,
}

impl UpdateRequest {
    /// Validate a raw request body
    ///
    /// `updates` must be an array of patch operations. A `previousHash` that
    /// is not a number is ignored, which turns the request into an
    /// unconditional patch.
    pub fn from_value(body: Value) -> SyncResult<Self> {
        let Value::Object(mut body) = body else {
            return Err(SyncError::Validation(
                "request body must be an object".to_string(),
            ));
        };

        let updates = match body.remove("updates") {
            Some(updates @ Value::Array(_)) => serde_json::from_value(updates)
                .map_err(|e| SyncError::Validation(format!("invalid patch operation: {}", e)))?,
            _ => {
                return Err(SyncError::Validation(
                    "parameter 'updates' is not defined".to_string(),
                ))
            }
        };

        let previous_hash = body.get("previousHash").and_then(Value::as_u64);

        Ok(Self {
            updates,
            previous_hash,
        })
    }
}

/// Change notification pushed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum StreamMessage {
    /// The whole document was replaced
    Set {
        data: Value,
        /// Server fingerprint before the change
        #[serde(rename = "previousHash")]
        previous_hash: Fingerprint,
    },

    /// A patch was applied
    Update {
        data: Vec<PatchOperation>,
        /// Server fingerprint before the change
        #[serde(rename = "previousHash")]
        previous_hash: Fingerprint,
    },
}

impl StreamMessage {
    /// The `method` tag of this message
    pub fn method(&self) -> &'static str {
        match self {
            StreamMessage::Set { .. } => "set",
            StreamMessage::Update { .. } => "update",
        }
    }

    /// Server fingerprint before the change
    pub fn previous_hash(&self) -> Fingerprint {
        match self {
            StreamMessage::Set { previous_hash, .. } | StreamMessage::Update { previous_hash, .. } => {
                *previous_hash
            }
        }
    }

    /// Encode as a JSON text frame
    pub fn encode(&self) -> SyncResult<String> {
        serde_json::to_string(self)
            .map_err(|e| SyncError::Protocol(format!("Failed to encode message: {}", e)))
    }

    /// Decode a JSON text frame
    ///
    /// Unparseable payloads and unknown methods are protocol errors: they mean
    /// the peers disagree on the protocol, not that the network is flaky.
    pub fn decode(text: &str) -> SyncResult<Self> {
        let value: Value = serde_json::from_str(text).map_err(|e| {
            SyncError::Protocol(format!("Message {:?} can not be parsed: {}", text, e))
        })?;

        match value.get("method").and_then(Value::as_str) {
            Some("set") | Some("update") => serde_json::from_value(value)
                .map_err(|e| SyncError::Protocol(format!("Malformed message: {}", e))),
            Some(other) => Err(SyncError::Protocol(format!(
                "Method {} is not supported",
                other
            ))),
            None => Err(SyncError::Protocol(format!(
                "Message {:?} has no method",
                text
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ops(value: Value) -> Vec<PatchOperation> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_envelope_ok_omits_empty_fields() {
        let body = serde_json::to_value(Envelope::ok(None)).unwrap();
        assert_eq!(body, json!({"status": true}));

        let body = serde_json::to_value(Envelope::ok(Some(json!({"a": 1})))).unwrap();
        assert_eq!(body, json!({"status": true, "result": {"a": 1}}));
    }

    #[test]
    fn test_envelope_error() {
        let body = serde_json::to_value(Envelope::error("Not found", None)).unwrap();
        assert_eq!(body, json!({"status": false, "message": "Not found"}));
    }

    #[test]
    fn test_update_request_wire_names() {
        let request = UpdateRequest {
            updates: ops(json!([{"op": "add", "path": "/b", "value": 2}])),
            previous_hash: Some(17),
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["previousHash"], json!(17));
        assert_eq!(body["updates"][0]["op"], json!("add"));
    }

    #[test]
    fn test_update_request_validation() {
        let request = UpdateRequest::from_value(json!({
            "updates": [{"op": "remove", "path": "/a"}],
            "previousHash": 5
        }))
        .unwrap();
        assert_eq!(request.updates.len(), 1);
        assert_eq!(request.previous_hash, Some(5));

        // Non-numeric hash is ignored
        let request =
            UpdateRequest::from_value(json!({"updates": [], "previousHash": "5"})).unwrap();
        assert_eq!(request.previous_hash, None);

        assert!(matches!(
            UpdateRequest::from_value(json!({"previousHash": 5})),
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            UpdateRequest::from_value(json!({"updates": {"op": "add"}})),
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            UpdateRequest::from_value(json!({"updates": [{"op": "explode", "path": "/"}]})),
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            UpdateRequest::from_value(json!([1, 2])),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn test_stream_message_encoding() {
        let msg = StreamMessage::Set {
            data: json!({"a": 1}),
            previous_hash: 99,
        };
        let frame: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            frame,
            json!({"method": "set", "data": {"a": 1}, "previousHash": 99})
        );
    }

    #[test]
    fn test_stream_message_decoding() {
        let msg = StreamMessage::decode(
            r#"{"method":"update","data":[{"op":"replace","path":"/a","value":3}],"previousHash":4}"#,
        )
        .unwrap();

        match msg {
            StreamMessage::Update {
                data,
                previous_hash,
            } => {
                assert_eq!(data.len(), 1);
                assert_eq!(previous_hash, 4);
            }
            _ => panic!("Expected Update message"),
        }
    }

    #[test]
    fn test_stream_message_rejects_garbage() {
        let err = StreamMessage::decode("not json").unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));

        let err = StreamMessage::decode(r#"{"method":"delete","data":{}}"#).unwrap_err();
        assert_eq!(
            err,
            SyncError::Protocol("Method delete is not supported".to_string())
        );

        let err = StreamMessage::decode(r#"{"data":{}}"#).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));

        let err = StreamMessage::decode(r#"{"method":"update","data":{"x":1}}"#).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }
}
