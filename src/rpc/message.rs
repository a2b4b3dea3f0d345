//! JSON-RPC line format
//!
//! One JSON object per line. Classification is by field presence:
//!
//! - request: `id` + `method`, no `result`/`error`
//! - response: `id` + (`result` or `error`)
//! - notification: `method`, no `id`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Request sent to the backend
#[derive(Debug, Serialize)]
pub struct OutgoingRequest<'a> {
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

/// Notification sent to the backend
#[derive(Debug, Serialize)]
pub struct OutgoingNotification<'a> {
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Answer to a server-initiated request
#[derive(Debug, Serialize)]
pub struct OutgoingResponse<'a> {
    pub id: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

/// `error` member of a response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Server-initiated request; must be answered with the same id
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRequest {
    pub id: Value,
    pub method: String,
    pub params: Value,
}

/// Response to one of our requests
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Value,
    pub outcome: std::result::Result<Value, RpcErrorObject>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

/// A classified incoming line
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request(ServerRequest),
    Response(Response),
    Notification(Notification),
}

/// Why a line could not be classified
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseLineError {
    /// Not valid JSON
    #[error("invalid JSON: {0}")]
    Json(String),
    /// Valid JSON but not a request, response or notification
    #[error("not a JSON-RPC request, response or notification")]
    Shape,
}

impl RpcMessage {
    /// Parse and classify one line
    pub fn parse(line: &str) -> std::result::Result<Self, ParseLineError> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| ParseLineError::Json(e.to_string()))?;
        match value {
            Value::Object(object) => Self::classify(object),
            _ => Err(ParseLineError::Shape),
        }
    }

    fn classify(mut object: Map<String, Value>) -> std::result::Result<Self, ParseLineError> {
        let id = object.remove("id").filter(|id| !id.is_null());
        let method = match object.remove("method") {
            Some(Value::String(method)) => Some(method),
            Some(_) => return Err(ParseLineError::Shape),
            None => None,
        };
        let result = object.remove("result");
        let error = object.remove("error");
        let params = object.remove("params").unwrap_or(Value::Null);

        match (id, method) {
            (Some(id), _) if result.is_some() || error.is_some() => {
                let outcome = match error {
                    Some(error) => Err(parse_error_object(error)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                Ok(Self::Response(Response { id, outcome }))
            }
            (Some(id), Some(method)) => Ok(Self::Request(ServerRequest { id, method, params })),
            (None, Some(method)) => Ok(Self::Notification(Notification { method, params })),
            _ => Err(ParseLineError::Shape),
        }
    }
}

fn parse_error_object(error: Value) -> RpcErrorObject {
    match error {
        Value::String(message) => RpcErrorObject {
            message,
            ..Default::default()
        },
        other => serde_json::from_value(other).unwrap_or_else(|_| RpcErrorObject {
            message: "unknown error".to_string(),
            ..Default::default()
        }),
    }
}
