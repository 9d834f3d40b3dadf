//! RPC client.
//!
//! Over a duplex channel many calls can be in flight at once. Each call
//! registers a pending slot keyed by its request id, and a background reader
//! task routes every reply to the slot with the matching id. Over a one-shot
//! channel calls are serialized: one request, one reply, then the next.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use protocol::{
    Codec, ErrorCode, IdGenerator, Kwargs, Message, ProtocolError, Request, RequestId, Value,
};
use serde::de::DeserializeOwned;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::transport::{Channel, Delivery, TransportError};

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Local error codes for failures that never reach the server.
pub mod local_codes {
    /// No reply within the timeout.
    pub const TIMEOUT: i32 = -32010;
    /// The channel closed before a reply arrived.
    pub const CHANNEL_CLOSED: i32 = -32011;
    /// The carrier failed to send or receive.
    pub const TRANSPORT: i32 = -32012;
    /// A reply arrived that does not answer the request.
    pub const UNEXPECTED_REPLY: i32 = -32013;
}

/// Errors returned to callers.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The server answered with an error.
    #[error("remote error {code}: {message}")]
    Remote {
        /// Error code from the reply.
        code: i32,
        /// Message from the reply.
        message: String,
        /// Structured detail from the reply.
        data: Option<Value>,
    },

    /// No reply arrived in time. The pending slot has been released.
    #[error("call to '{method}' timed out after {after:?}")]
    Timeout {
        /// Method that was called.
        method: String,
        /// Timeout that elapsed.
        after: Duration,
    },

    /// The channel closed before a reply arrived.
    #[error("channel closed")]
    ChannelClosed,

    /// The carrier failed.
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// The request could not be encoded or the reply decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The request is malformed and was not sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A reply arrived that does not answer the request.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl RpcError {
    /// Stable integer code for this error.
    pub fn code(&self) -> i32 {
        match self {
            RpcError::Remote { code, .. } => *code,
            RpcError::Timeout { .. } => local_codes::TIMEOUT,
            RpcError::ChannelClosed => local_codes::CHANNEL_CLOSED,
            RpcError::Transport(_) => local_codes::TRANSPORT,
            RpcError::Protocol(_) => ErrorCode::ParseError.code(),
            RpcError::InvalidRequest(_) => ErrorCode::InvalidRequest.code(),
            RpcError::UnexpectedReply(_) => local_codes::UNEXPECTED_REPLY,
        }
    }

    /// Known protocol error kind for remote errors.
    pub fn kind(&self) -> Option<ErrorCode> {
        match self {
            RpcError::Remote { code, .. } => ErrorCode::from_code(*code),
            _ => None,
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => RpcError::ChannelClosed,
            other => RpcError::Transport(other),
        }
    }
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout applied by [`RpcClient::call`] and [`RpcClient::notify`].
    pub default_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

type Reply = Result<Value, RpcError>;

struct ClientInner {
    channel: Channel,
    codec: Arc<dyn Codec>,
    ids: IdGenerator,
    pending: DashMap<RequestId, oneshot::Sender<Reply>>,
    /// Serializes one-shot exchanges.
    exchange: Mutex<()>,
}

/// Removes a pending slot when the waiting call goes away.
struct PendingGuard<'a> {
    pending: &'a DashMap<RequestId, oneshot::Sender<Reply>>,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl ClientInner {
    /// Deliver a reply to its pending call.
    fn route(&self, body: &[u8]) {
        let message = match self.codec.decode(body) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "discarding undecodable reply");
                return;
            }
        };

        let (id, reply) = match message {
            Message::Response(response) => (response.id, Ok(response.result)),
            Message::Error(error) => match error.id {
                Some(id) => (
                    id,
                    Err(RpcError::Remote {
                        code: error.code,
                        message: error.message,
                        data: error.data,
                    }),
                ),
                None => {
                    warn!(code = error.code, message = %error.message, "server error without request id");
                    return;
                }
            },
            Message::Request(request) => {
                warn!(method = %request.method, "ignoring request sent to client");
                return;
            }
        };

        match self.pending.remove(&id) {
            Some((_, slot)) => {
                // The caller may have given up between removal and send
                let _ = slot.send(reply);
            }
            None => debug!(%id, "discarding reply for unknown or expired request"),
        }
    }

    /// Fail every pending call with `ChannelClosed`.
    fn fail_pending(&self) {
        let ids: Vec<RequestId> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, slot)) = self.pending.remove(&id) {
                let _ = slot.send(Err(RpcError::ChannelClosed));
            }
        }
    }
}

/// Issues calls and notifications over one channel.
pub struct RpcClient {
    inner: Arc<ClientInner>,
    config: ClientConfig,
    reader: Option<JoinHandle<()>>,
}

impl RpcClient {
    /// Wrap an open channel.
    ///
    /// For duplex channels this spawns the reply reader, so it must be
    /// called within a tokio runtime.
    pub fn new(channel: Channel, codec: Arc<dyn Codec>, config: ClientConfig) -> Self {
        let delivery = channel.delivery();
        let inner = Arc::new(ClientInner {
            channel,
            codec,
            ids: IdGenerator::default(),
            pending: DashMap::new(),
            exchange: Mutex::new(()),
        });

        let reader = match delivery {
            Delivery::Duplex => Some(tokio::spawn(read_replies(inner.clone()))),
            Delivery::OneShot => None,
        };

        Self {
            inner,
            config,
            reader,
        }
    }

    /// Call `method` with positional arguments and the default timeout.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.call_with_timeout(method, args, self.config.default_timeout)
            .await
    }

    /// Call `method` with named arguments and the default timeout.
    pub async fn call_kwargs(&self, method: &str, kwargs: Kwargs) -> Result<Value, RpcError> {
        self.request(method, Vec::new(), kwargs, self.config.default_timeout)
            .await
    }

    /// Call `method` with an explicit timeout.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.request(method, args, Kwargs::new(), timeout).await
    }

    /// Call `method` and deserialize the result.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<T, RpcError> {
        let value = self.call(method, args).await?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::UnexpectedReply(format!("result of '{}': {}", method, e)))
    }

    /// Send a notification with positional arguments.
    ///
    /// Returns once the payload has been handed to the carrier; the server's
    /// outcome is never reported back.
    pub async fn notify(&self, method: &str, args: Vec<Value>) -> Result<(), RpcError> {
        self.send_notification(Request::notification(method, args, Kwargs::new()))
            .await
    }

    /// Send a notification with named arguments.
    pub async fn notify_kwargs(&self, method: &str, kwargs: Kwargs) -> Result<(), RpcError> {
        self.send_notification(Request::notification(method, Vec::new(), kwargs))
            .await
    }

    /// Number of calls waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether the underlying channel has closed.
    pub fn is_closed(&self) -> bool {
        self.inner.channel.is_closed()
    }

    /// Close the channel and fail every pending call with `ChannelClosed`.
    pub async fn close(&self) -> Result<(), RpcError> {
        let closed = self.inner.channel.close().await;
        self.inner.fail_pending();
        closed.map_err(RpcError::from)
    }

    fn encode(&self, request: Request) -> Result<Vec<u8>, RpcError> {
        request.validate().map_err(RpcError::InvalidRequest)?;
        Ok(self.inner.codec.encode(&Message::Request(request))?)
    }

    async fn request(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::ChannelClosed);
        }

        let id = self.inner.ids.next_id();
        let body = self.encode(Request::call(id.clone(), method, args, kwargs))?;
        debug!(%id, method, "sending call");

        let outcome = match self.inner.channel.delivery() {
            Delivery::Duplex => tokio::time::timeout(timeout, self.duplex_call(id, &body)).await,
            Delivery::OneShot => tokio::time::timeout(timeout, self.exchange(id, &body)).await,
        };

        outcome.unwrap_or_else(|_| {
            Err(RpcError::Timeout {
                method: method.to_string(),
                after: timeout,
            })
        })
    }

    async fn duplex_call(&self, id: RequestId, body: &[u8]) -> Result<Value, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id,
        };

        // The reader drains pending slots after marking the channel closed,
        // so a slot inserted after the drain is caught here.
        if self.is_closed() {
            return Err(RpcError::ChannelClosed);
        }

        self.inner.channel.send(body).await?;
        rx.await.unwrap_or(Err(RpcError::ChannelClosed))
    }

    async fn exchange(&self, id: RequestId, body: &[u8]) -> Result<Value, RpcError> {
        let _turn = self.inner.exchange.lock().await;
        self.inner.channel.send(body).await?;

        loop {
            let reply = self
                .inner
                .channel
                .receive()
                .await?
                .ok_or(RpcError::ChannelClosed)?;
            let message = self.inner.codec.decode(&reply).map_err(ProtocolError::from)?;
            match message {
                Message::Response(response) if response.id == id => return Ok(response.result),
                Message::Error(error) if error.id.as_ref() == Some(&id) || error.id.is_none() => {
                    return Err(RpcError::Remote {
                        code: error.code,
                        message: error.message,
                        data: error.data,
                    })
                }
                other => {
                    debug!(expected = %id, got = ?other.id(), "discarding stale reply");
                }
            }
        }
    }

    async fn send_notification(&self, request: Request) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::ChannelClosed);
        }
        let method = request.method.clone();
        let body = self.encode(request)?;
        debug!(method = %method, "sending notification");

        let send = async {
            let _turn = match self.inner.channel.delivery() {
                Delivery::OneShot => Some(self.inner.exchange.lock().await),
                Delivery::Duplex => None,
            };
            self.inner.channel.send(&body).await
        };

        match tokio::time::timeout(self.config.default_timeout, send).await {
            Ok(sent) => sent.map_err(RpcError::from),
            Err(_) => Err(RpcError::Timeout {
                method,
                after: self.config.default_timeout,
            }),
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn read_replies(inner: Arc<ClientInner>) {
    loop {
        match inner.channel.receive().await {
            Ok(Some(body)) => inner.route(&body),
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "reply reader stopped");
                let _ = inner.channel.close().await;
                break;
            }
        }
    }
    debug!(pending = inner.pending.len(), "channel closed, failing pending calls");
    inner.fail_pending();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelOptions, MemoryCarrier};
    use protocol::{Authenticator, ErrorResponse, Identity, JsonRpcCodec, Response, TrustPolicy};
    use serde_json::json;

    /// A client plus the raw server end of its channel.
    async fn client_and_peer() -> (RpcClient, Channel) {
        let (left, right) = MemoryCarrier::pair();
        let a = Arc::new(Authenticator::new(Identity::generate(), TrustPolicy::first_seen()));
        let b = Arc::new(Authenticator::new(Identity::generate(), TrustPolicy::first_seen()));
        let (client_channel, peer) = tokio::join!(
            Channel::open(left, a, ChannelOptions::default()),
            Channel::open(right, b, ChannelOptions::default()),
        );
        let client = RpcClient::new(
            client_channel.unwrap(),
            Arc::new(JsonRpcCodec),
            ClientConfig::default(),
        );
        (client, peer.unwrap())
    }

    async fn next_request(peer: &Channel) -> Request {
        let body = peer.receive().await.unwrap().unwrap();
        match JsonRpcCodec.decode(&body).unwrap() {
            Message::Request(request) => request,
            other => panic!("expected request, got {:?}", other),
        }
    }

    async fn reply(peer: &Channel, message: Message) {
        peer.send(&JsonRpcCodec.encode(&message).unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_call_and_reply() {
        let (client, peer) = client_and_peer().await;

        let server = tokio::spawn(async move {
            let request = next_request(&peer).await;
            assert_eq!(request.method, "add");
            let response = request.respond(json!(5)).unwrap();
            reply(&peer, response.into()).await;
            peer
        });

        let result = client.call("add", vec![json!(2), json!(3)]).await.unwrap();
        assert_eq!(result, json!(5));
        assert_eq!(client.pending_calls(), 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_increasing() {
        let (client, peer) = client_and_peer().await;

        let server = tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..3 {
                let request = next_request(&peer).await;
                ids.push(request.id.clone().unwrap());
                reply(&peer, request.respond(Value::Null).unwrap().into()).await;
            }
            ids
        });

        for _ in 0..3 {
            client.call("noop", vec![]).await.unwrap();
        }
        assert_eq!(
            server.await.unwrap(),
            vec![RequestId::Number(1), RequestId::Number(2), RequestId::Number(3)]
        );
    }

    #[tokio::test]
    async fn test_remote_error() {
        let (client, peer) = client_and_peer().await;

        tokio::spawn(async move {
            let request = next_request(&peer).await;
            let error = request
                .error_respond(ErrorCode::MethodNotFound, "Method not found: nope", None)
                .unwrap();
            reply(&peer, error.into()).await;
            peer
        });

        let err = client.call("nope", vec![]).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorCode::MethodNotFound));
        assert_eq!(err.code(), -32601);
    }

    #[tokio::test]
    async fn test_timeout_releases_slot_and_late_reply_is_dropped() {
        let (client, peer) = client_and_peer().await;

        let err = client
            .call_with_timeout("slow", vec![], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout { ref method, .. } if method == "slow"));
        assert_eq!(err.code(), local_codes::TIMEOUT);
        assert_eq!(client.pending_calls(), 0);

        // Reply to the timed-out call, then serve the next one
        let late = next_request(&peer).await;
        let server = tokio::spawn(async move {
            reply(&peer, late.respond(json!("late")).unwrap().into()).await;
            let request = next_request(&peer).await;
            reply(&peer, request.respond(json!("fresh")).unwrap().into()).await;
            peer
        });

        assert_eq!(client.call("fast", vec![]).await.unwrap(), json!("fresh"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let (client, _peer) = client_and_peer().await;
        let client = Arc::new(client);

        let calls: Vec<_> = (0..3)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move { client.call("wait", vec![json!(i)]).await })
            })
            .collect();

        while client.pending_calls() < 3 {
            tokio::task::yield_now().await;
        }
        client.close().await.unwrap();

        for call in calls {
            assert!(matches!(call.await.unwrap(), Err(RpcError::ChannelClosed)));
        }
        assert!(matches!(
            client.call("after", vec![]).await,
            Err(RpcError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_peer_disconnect_fails_pending_calls() {
        let (client, peer) = client_and_peer().await;

        let server = tokio::spawn(async move {
            let _request = next_request(&peer).await;
            peer.close().await.unwrap();
        });

        assert!(matches!(
            client.call("wait", vec![]).await,
            Err(RpcError::ChannelClosed)
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_and_idless_replies_are_ignored() {
        let (client, peer) = client_and_peer().await;

        let server = tokio::spawn(async move {
            let request = next_request(&peer).await;
            reply(
                &peer,
                Response {
                    id: RequestId::Number(999),
                    result: json!("stray"),
                }
                .into(),
            )
            .await;
            reply(
                &peer,
                ErrorResponse::new(None, ErrorCode::ParseError, "Parse error", None).into(),
            )
            .await;
            reply(&peer, request.respond(json!("real")).unwrap().into()).await;
            peer
        });

        assert_eq!(client.call("x", vec![]).await.unwrap(), json!("real"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_notify_sends_without_id() {
        let (client, peer) = client_and_peer().await;

        client.notify("log", vec![json!("hi")]).await.unwrap();
        let request = next_request(&peer).await;
        assert!(request.is_notification());
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_call_as_typed() {
        let (client, peer) = client_and_peer().await;

        tokio::spawn(async move {
            for result in [json!(42), json!("nope")] {
                let request = next_request(&peer).await;
                reply(&peer, request.respond(result).unwrap().into()).await;
            }
            peer
        });

        let n: i64 = client.call_as("answer", vec![]).await.unwrap();
        assert_eq!(n, 42);
        let err = client.call_as::<i64>("answer", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::UnexpectedReply(_)));
    }

    #[tokio::test]
    async fn test_mixed_arguments_not_sent() {
        let (client, _peer) = client_and_peer().await;
        let mut kwargs = Kwargs::new();
        kwargs.insert("b".into(), json!(1));

        let err = client
            .request("m", vec![json!(1)], kwargs, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidRequest(_)));
        assert_eq!(client.pending_calls(), 0);
    }

    #[test]
    fn test_transport_closed_maps_to_channel_closed() {
        assert!(matches!(
            RpcError::from(TransportError::Closed),
            RpcError::ChannelClosed
        ));
        assert!(matches!(
            RpcError::from(TransportError::Send("boom".into())),
            RpcError::Transport(_)
        ));
    }
}
