//! Wire codecs for protocol messages.
//!
//! A [`Codec`] turns a [`Message`] into an opaque byte payload and back.
//! Two formats ship with the crate:
//!
//! - [`JsonRpcCodec`]: JSON-RPC 2.0 text, readable and interoperable
//! - [`MsgpackCodec`]: MessagePack, compact binary
//!
//! Decoding never panics on hostile input. Failures are reported as a
//! [`DecodeError`] that carries the request id whenever it could be
//! recovered, so the receiver can still key a parse-error reply.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DecodeError, ProtocolError, Result};
use crate::messages::{ErrorResponse, Kwargs, Message, Request, RequestId, Response};

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Encode/decode contract shared by every wire format.
pub trait Codec: Send + Sync {
    /// Short format name for logs and configuration.
    fn name(&self) -> &'static str;

    /// Serialize a message.
    fn encode(&self, message: &Message) -> Result<Vec<u8>>;

    /// Deserialize a message.
    fn decode(&self, bytes: &[u8]) -> std::result::Result<Message, DecodeError>;
}

/// Selectable codec kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// JSON-RPC 2.0.
    #[default]
    Json,
    /// MessagePack.
    Msgpack,
}

impl CodecKind {
    /// Instantiate the codec.
    pub fn build(self) -> Arc<dyn Codec> {
        match self {
            CodecKind::Json => Arc::new(JsonRpcCodec),
            CodecKind::Msgpack => Arc::new(MsgpackCodec),
        }
    }
}

impl std::str::FromStr for CodecKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "jsonrpc" => Ok(CodecKind::Json),
            "msgpack" | "messagepack" => Ok(CodecKind::Msgpack),
            other => Err(format!("unknown codec: {}", other)),
        }
    }
}

// ============================================================================
// JSON-RPC 2.0
// ============================================================================

/// JSON-RPC 2.0 codec.
///
/// Positional arguments travel as a `params` array, named arguments as a
/// `params` object; `params` is omitted when both are empty. A request
/// without `id` (or with a null `id`) is a notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRpcCodec;

impl JsonRpcCodec {
    fn request_to_value(request: &Request) -> Result<Value> {
        request
            .validate()
            .map_err(ProtocolError::Serialization)?;

        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        obj.insert("method".into(), Value::from(request.method.clone()));
        if !request.args.is_empty() {
            obj.insert("params".into(), Value::Array(request.args.clone()));
        } else if !request.kwargs.is_empty() {
            let params: Map<String, Value> = request
                .kwargs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            obj.insert("params".into(), Value::Object(params));
        }
        if let Some(id) = &request.id {
            obj.insert("id".into(), serde_json::to_value(id)?);
        }
        Ok(Value::Object(obj))
    }

    fn response_to_value(response: &Response) -> Result<Value> {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        obj.insert("id".into(), serde_json::to_value(&response.id)?);
        obj.insert("result".into(), response.result.clone());
        Ok(Value::Object(obj))
    }

    fn error_to_value(error: &ErrorResponse) -> Result<Value> {
        let mut detail = Map::new();
        detail.insert("code".into(), Value::from(error.code));
        detail.insert("message".into(), Value::from(error.message.clone()));
        if let Some(data) = error.data.as_ref().filter(|d| !d.is_null()) {
            detail.insert("data".into(), data.clone());
        }

        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        obj.insert("id".into(), serde_json::to_value(&error.id)?);
        obj.insert("error".into(), Value::Object(detail));
        Ok(Value::Object(obj))
    }

    fn parse_id(value: Option<&Value>) -> std::result::Result<Option<RequestId>, String> {
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(|n| Some(RequestId::Number(n)))
                .ok_or_else(|| format!("unsupported numeric id: {}", n)),
            Some(Value::String(s)) => Ok(Some(RequestId::String(s.clone()))),
            Some(other) => Err(format!("id must be a number or string, got {}", other)),
        }
    }

    fn parse_request(
        obj: &Map<String, Value>,
        id: Option<RequestId>,
    ) -> std::result::Result<Request, String> {
        let method = match obj.get("method") {
            Some(Value::String(m)) => m.clone(),
            _ => return Err("method must be a string".to_string()),
        };

        let (args, kwargs) = match obj.get("params") {
            None | Some(Value::Null) => (Vec::new(), Kwargs::new()),
            Some(Value::Array(args)) => (args.clone(), Kwargs::new()),
            Some(Value::Object(kwargs)) => (
                Vec::new(),
                kwargs.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ),
            Some(_) => return Err("params must be an array or an object".to_string()),
        };

        Ok(Request {
            id,
            method,
            args,
            kwargs,
        })
    }

    fn parse_error(
        detail: &Value,
        id: Option<RequestId>,
    ) -> std::result::Result<ErrorResponse, String> {
        let detail = detail
            .as_object()
            .ok_or_else(|| "error must be an object".to_string())?;
        let code = detail
            .get("code")
            .and_then(Value::as_i64)
            .and_then(|c| i32::try_from(c).ok())
            .ok_or_else(|| "error.code must be a 32-bit integer".to_string())?;
        let message = detail
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| "error.message must be a string".to_string())?
            .to_string();
        let data = detail.get("data").cloned().filter(|d| !d.is_null());

        Ok(ErrorResponse {
            id,
            code,
            message,
            data,
        })
    }
}

impl Codec for JsonRpcCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let value = match message {
            Message::Request(request) => Self::request_to_value(request)?,
            Message::Response(response) => Self::response_to_value(response)?,
            Message::Error(error) => Self::error_to_value(error)?,
        };
        Ok(serde_json::to_vec(&value)?)
    }

    fn decode(&self, bytes: &[u8]) -> std::result::Result<Message, DecodeError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| DecodeError::new(format!("invalid JSON: {}", e)))?;

        let obj = match value {
            Value::Object(obj) => obj,
            Value::Array(_) => return Err(DecodeError::new("batch messages are not supported")),
            _ => return Err(DecodeError::new("message must be a JSON object")),
        };

        // Salvage the id first so every later failure can be correlated.
        let id = Self::parse_id(obj.get("id")).map_err(DecodeError::new)?;
        let fail = |reason: String| DecodeError::new(reason).with_id(id.clone());

        match obj.get("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            _ => return Err(fail("jsonrpc must be \"2.0\"".to_string())),
        }

        if obj.contains_key("method") {
            return Self::parse_request(&obj, id.clone())
                .map(Message::Request)
                .map_err(fail);
        }

        if let Some(detail) = obj.get("error") {
            return Self::parse_error(detail, id.clone())
                .map(Message::Error)
                .map_err(fail);
        }

        if let Some(result) = obj.get("result") {
            let id = id
                .clone()
                .ok_or_else(|| fail("response is missing its id".to_string()))?;
            return Ok(Message::Response(Response {
                id,
                result: result.clone(),
            }));
        }

        Err(fail(
            "message has neither method, result nor error".to_string(),
        ))
    }
}

// ============================================================================
// MessagePack
// ============================================================================

/// MessagePack codec.
///
/// Messages are encoded with named fields so that a damaged payload remains
/// self-describing enough to salvage its id.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgpackCodec;

impl MsgpackCodec {
    fn salvage_id(bytes: &[u8]) -> Option<RequestId> {
        let value: Value = rmp_serde::from_slice(bytes).ok()?;
        let id = value.get("data")?.get("id")?;
        serde_json::from_value(id.clone()).ok()
    }
}

impl Codec for MsgpackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        if let Message::Request(request) = message {
            request
                .validate()
                .map_err(ProtocolError::Serialization)?;
        }
        Ok(rmp_serde::to_vec_named(message)?)
    }

    fn decode(&self, bytes: &[u8]) -> std::result::Result<Message, DecodeError> {
        rmp_serde::from_slice::<Message>(bytes).map_err(|e| {
            DecodeError::new(format!("invalid MessagePack: {}", e))
                .with_id(Self::salvage_id(bytes))
        })
    }
}
