//! Message model for SigRPC.
//!
//! This module defines the three message shapes carried by the protocol
//! (request, response, error) independently of any wire format, plus the
//! per-client request id generator.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Dynamic argument and result value.
pub use serde_json::Value;

/// Named arguments of a request.
pub type Kwargs = BTreeMap<String, Value>;

/// Correlation token for a request.
///
/// Serialized untagged so that JSON-RPC peers see a bare number or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id, as produced by [`IdGenerator`].
    Number(u64),
    /// Opaque string id supplied by a foreign peer.
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

/// Monotonic request id source.
///
/// Ids start at the given value and increase by one on every call. A `u64`
/// counter never wraps in practice, so an id handed out once is never handed
/// out again by the same generator.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a generator whose first id is `start`.
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Return the next id.
    pub fn next_id(&self) -> RequestId {
        RequestId::Number(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Stable error kinds carried in [`ErrorResponse::code`].
///
/// The numeric values follow JSON-RPC 2.0; application failures use the
/// first code of the implementation-defined server error range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The payload could not be decoded.
    ParseError,
    /// The payload decoded but is not a valid request.
    InvalidRequest,
    /// No handler is registered under the requested name.
    MethodNotFound,
    /// Arguments do not match the handler's parameter contract.
    InvalidParams,
    /// The handler crashed or the server failed internally.
    InternalError,
    /// The handler reported a domain-level failure.
    ApplicationError,
}

impl ErrorCode {
    /// Integer code used on the wire.
    pub const fn code(self) -> i32 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::ApplicationError => -32000,
        }
    }

    /// Map a wire code back to a known kind.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -32700 => Some(ErrorCode::ParseError),
            -32600 => Some(ErrorCode::InvalidRequest),
            -32601 => Some(ErrorCode::MethodNotFound),
            -32602 => Some(ErrorCode::InvalidParams),
            -32603 => Some(ErrorCode::InternalError),
            -32000 => Some(ErrorCode::ApplicationError),
            _ => None,
        }
    }

    /// Default human-readable message for this kind.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::ApplicationError => "Application error",
        }
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

/// A method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id; `None` marks a notification.
    pub id: Option<RequestId>,
    /// Method name.
    pub method: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Named arguments.
    #[serde(default)]
    pub kwargs: Kwargs,
}

impl Request {
    /// Build a request that expects a reply.
    pub fn call(
        id: RequestId,
        method: impl Into<String>,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Self {
        Self {
            id: Some(id),
            method: method.into(),
            args,
            kwargs,
        }
    }

    /// Build a one-way request.
    pub fn notification(method: impl Into<String>, args: Vec<Value>, kwargs: Kwargs) -> Self {
        Self {
            id: None,
            method: method.into(),
            args,
            kwargs,
        }
    }

    /// Whether this request expects no reply.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Check the request shape.
    ///
    /// A method name is required, and positional and named arguments are
    /// mutually exclusive.
    pub fn validate(&self) -> Result<(), String> {
        if self.method.is_empty() {
            return Err("method name must not be empty".to_string());
        }
        if !self.args.is_empty() && !self.kwargs.is_empty() {
            return Err("positional and named arguments cannot be mixed".to_string());
        }
        Ok(())
    }

    /// Build the success reply for this request, if it expects one.
    pub fn respond(&self, result: Value) -> Option<Response> {
        self.id.clone().map(|id| Response { id, result })
    }

    /// Build the error reply for this request, if it expects one.
    pub fn error_respond(
        &self,
        code: ErrorCode,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Option<ErrorResponse> {
        self.id
            .as_ref()
            .map(|id| ErrorResponse::new(Some(id.clone()), code, message, data))
    }
}

/// Successful reply to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the answered request.
    pub id: RequestId,
    /// Handler return value.
    pub result: Value,
}

/// Failed reply to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Id of the answered request, `None` if it could not be determined.
    pub id: Option<RequestId>,
    /// Error kind, see [`ErrorCode`].
    pub code: i32,
    /// Human-readable description.
    pub message: String,
    /// Optional structured detail.
    ///
    /// `Some(Value::Null)` is not representable on the wire: both codecs
    /// omit it and decode it back as `None`. [`ErrorResponse::new`]
    /// normalises it up front.
    #[serde(default, skip_serializing_if = "data_is_absent")]
    pub data: Option<Value>,
}

fn data_is_absent(data: &Option<Value>) -> bool {
    data.as_ref().is_none_or(Value::is_null)
}

impl ErrorResponse {
    /// Create an error reply.
    pub fn new(
        id: Option<RequestId>,
        code: ErrorCode,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            id,
            code: code.code(),
            message: message.into(),
            // An explicit null is indistinguishable from "absent" on the wire.
            data: data.filter(|d| !d.is_null()),
        }
    }

    /// Known kind of this error, if the code is a standard one.
    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }
}

/// Any message carried by the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    /// Method invocation or notification.
    Request(Request),
    /// Successful reply.
    Response(Response),
    /// Failed reply.
    Error(ErrorResponse),
}

impl Message {
    /// Correlation id carried by this message, if any.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(r) => r.id.as_ref(),
            Message::Response(r) => Some(&r.id),
            Message::Error(e) => e.id.as_ref(),
        }
    }

    /// Whether this message is a well-formed reply to `request`.
    pub fn answers(&self, request: &Request) -> bool {
        match (self, request.id.as_ref()) {
            (Message::Response(r), Some(id)) => &r.id == id,
            (Message::Error(e), Some(id)) => e.id.as_ref() == Some(id),
            _ => false,
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

impl From<ErrorResponse> for Message {
    fn from(error: ErrorResponse) -> Self {
        Message::Error(error)
    }
}
