use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const VERSION: &str = "2.0";

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

fn version() -> String {
    VERSION.to_string()
}

/// A call or notification. A request without an `id` is one-way and MUST
/// NOT be answered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    #[serde(default = "version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl Request {
    pub fn new(method: &str, params: Value, id: u64) -> Self {
        Request {
            jsonrpc: version(),
            method: method.to_string(),
            params: Some(params),
            id: Some(id),
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Request {
            jsonrpc: version(),
            method: method.to_string(),
            params: Some(params),
            id: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    #[serde(default = "version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    pub id: Option<u64>,
}

impl Response {
    pub fn success(id: u64, result: Value) -> Self {
        Response {
            jsonrpc: version(),
            result: Some(result),
            error: None,
            id: Some(id),
        }
    }

    pub fn failure(id: Option<u64>, error: &RpcError) -> Self {
        Response {
            jsonrpc: version(),
            result: None,
            error: Some(error.to_object()),
            id,
        }
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        if let Some(error) = self.error {
            return Err(RpcError::from_object(error));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Errors surfaced inline in the JSON-RPC `error` object.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("method not found: `{0}`")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcError {
    pub fn code(&self) -> i64 {
        match self {
            RpcError::MethodNotFound(_) => METHOD_NOT_FOUND,
            RpcError::InvalidParams(_) => INVALID_PARAMS,
            RpcError::Internal(_) => INTERNAL_ERROR,
        }
    }

    pub fn to_object(&self) -> ErrorObject {
        ErrorObject {
            code: self.code(),
            message: self.to_string(),
        }
    }

    pub fn from_object(object: ErrorObject) -> Self {
        match object.code {
            METHOD_NOT_FOUND => RpcError::MethodNotFound(object.message),
            INVALID_PARAMS => RpcError::InvalidParams(object.message),
            _ => RpcError::Internal(object.message),
        }
    }
}

/// Anything that can arrive on an established channel.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn parse(frame: &[u8]) -> Result<Message, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}

pub fn serialize_request(request: &Request) -> Vec<u8> {
    serde_json::to_vec(request).expect("request serializes")
}

pub fn serialize_response(response: &Response) -> Vec<u8> {
    serde_json::to_vec(response).expect("response serializes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let request = Request::new("get_all_object_hashes", json!({"paths": ["/app"]}), 4);
        let parsed = Message::parse(&serialize_request(&request)).unwrap();
        assert_eq!(parsed, Message::Request(request));
    }

    #[test]
    fn test_notification_round_trip() {
        let request = Request::notification("pty_input", json!({"data": "6c73"}));
        let parsed = Message::parse(&serialize_request(&request)).unwrap();
        match parsed {
            Message::Request(r) => assert!(r.is_notification()),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_response_parses_as_response() {
        let response = Response::success(9, json!([1, 2, 3]));
        let parsed = Message::parse(&serialize_response(&response)).unwrap();
        assert_eq!(parsed, Message::Response(response));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(RpcError::MethodNotFound("x".into()).code(), -32601);
        assert_eq!(RpcError::InvalidParams("x".into()).code(), -32602);
        assert_eq!(RpcError::Internal("x".into()).code(), -32603);
    }

    #[test]
    fn test_error_code_survives_the_wire() {
        let error = RpcError::InvalidParams("missing field".into());
        let roundtripped = RpcError::from_object(error.to_object());
        assert_eq!(roundtripped.code(), error.code());
        assert!(roundtripped.to_string().contains("missing field"));
    }
}
