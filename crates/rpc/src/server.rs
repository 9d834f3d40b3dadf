//! RPC server loop.
//!
//! Receives verified payloads from a channel, decodes them, hands requests
//! to the [`Dispatcher`] and sends the encoded outcome back on the same
//! channel. On duplex channels every request runs on its own task, so a slow
//! handler never holds up the requests behind it.

use std::sync::Arc;

use protocol::{Authenticator, Codec, ErrorCode, ErrorResponse, Message};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::transport::{Channel, ChannelOptions, Delivery, HttpServerCarrier, StreamListener};

/// Default bound on concurrently running handlers per channel.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 64;

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Handlers allowed to run at once on one duplex channel.
    pub max_concurrent_requests: usize,
    /// Options for channels opened by the accept loops.
    pub channel: ChannelOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            channel: ChannelOptions::default(),
        }
    }
}

/// Serves a dispatcher over any number of channels.
///
/// Cloning is cheap; clones share the dispatcher and the shutdown token.
#[derive(Clone)]
pub struct RpcServer {
    dispatcher: Arc<Dispatcher>,
    codec: Arc<dyn Codec>,
    config: ServerConfig,
    shutdown: CancellationToken,
}

impl RpcServer {
    /// Create a server for `dispatcher` speaking `codec`.
    pub fn new(dispatcher: Dispatcher, codec: Arc<dyn Codec>, config: ServerConfig) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            codec,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// The dispatcher being served.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Token that stops every serve loop of this server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting work. In-flight requests still complete.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Turn one inbound body into the reply body, if any.
    ///
    /// Undecodable payloads get a `ParseError` carrying whatever request id
    /// could be salvaged. Stray responses and errors are dropped.
    pub async fn handle_body(&self, body: &[u8]) -> Option<Vec<u8>> {
        let reply = match self.codec.decode(body) {
            Ok(Message::Request(request)) => self.dispatcher.dispatch(request).await?,
            Ok(other) => {
                warn!(id = ?other.id(), "ignoring reply sent to server");
                return None;
            }
            Err(e) => {
                debug!(error = %e, id = ?e.id, "undecodable request");
                ErrorResponse::new(
                    e.id,
                    ErrorCode::ParseError,
                    format!("{}: {}", ErrorCode::ParseError.default_message(), e.reason),
                    None,
                )
                .into()
            }
        };

        match self.codec.encode(&reply) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(error = %e, id = ?reply.id(), "failed to encode reply");
                let fallback = ErrorResponse::new(
                    reply.id().cloned(),
                    ErrorCode::InternalError,
                    ErrorCode::InternalError.default_message(),
                    None,
                );
                self.codec.encode(&fallback.into()).ok()
            }
        }
    }

    /// Serve requests arriving on `channel` until it closes or the server
    /// shuts down.
    ///
    /// Returns after every request already received has been answered.
    pub async fn serve_channel(&self, channel: Channel) {
        let channel = Arc::new(channel);
        match channel.delivery() {
            Delivery::Duplex => self.serve_duplex(channel.clone()).await,
            Delivery::OneShot => self.serve_one_shot(&channel).await,
        }
        if let Err(e) = channel.close().await {
            debug!(error = %e, "channel close failed");
        }
    }

    async fn serve_duplex(&self, channel: Arc<Channel>) {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_requests.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = channel.receive() => received,
            };

            let body = match received {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "receive failed, dropping channel");
                    break;
                }
            };

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let server = self.clone();
            let channel = channel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                if let Some(reply) = server.handle_body(&body).await {
                    if let Err(e) = channel.send(&reply).await {
                        debug!(error = %e, "could not deliver reply");
                    }
                }
            });

            while tasks.try_join_next().is_some() {}
        }

        while tasks.join_next().await.is_some() {}
    }

    async fn serve_one_shot(&self, channel: &Channel) {
        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                received = channel.receive() => received,
            };

            let body = match received {
                Ok(Some(body)) => body,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "receive failed");
                    return;
                }
            };

            let delivered = match self.handle_body(&body).await {
                Some(reply) => channel.send(&reply).await,
                None => channel.complete_exchange().await,
            };
            if let Err(e) = delivered {
                debug!(error = %e, "could not finish exchange");
            }
        }
    }

    /// Accept stream connections and serve each on its own task.
    ///
    /// `authenticator` is called once per connection, so each connection
    /// can get its own trust state. Returns after shutdown once every
    /// connection has finished.
    pub async fn serve_listener<F>(&self, listener: StreamListener, authenticator: F)
    where
        F: Fn() -> Arc<Authenticator> + Send + Sync,
    {
        if let Ok(endpoint) = listener.local_endpoint() {
            info!(endpoint = %endpoint, "serving stream connections");
        }
        let mut connections = JoinSet::new();

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (carrier, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let server = self.clone();
            let auth = authenticator();
            let options = self.config.channel.clone();
            connections.spawn(async move {
                match Channel::open(carrier, auth, options).await {
                    Ok(channel) => {
                        info!(
                            peer = %peer_addr,
                            key = %channel.peer().map(|p| p.fingerprint()).unwrap_or_default(),
                            "connection authenticated"
                        );
                        server.serve_channel(channel).await;
                        debug!(peer = %peer_addr, "connection finished");
                    }
                    Err(e) => warn!(peer = %peer_addr, error = %e, "handshake failed"),
                }
            });

            while connections.try_join_next().is_some() {}
        }

        while connections.join_next().await.is_some() {}
    }

    /// Serve HTTP exchanges from `carrier` until shutdown.
    ///
    /// Each POST becomes a one-shot channel verified against
    /// `authenticator`'s trust policy.
    pub async fn serve_http(&self, mut carrier: HttpServerCarrier, authenticator: Arc<Authenticator>) {
        info!(addr = %carrier.local_addr(), "serving HTTP exchanges");
        let mut exchanges = JoinSet::new();

        loop {
            let exchange = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                exchange = carrier.accept() => match exchange {
                    Some(exchange) => exchange,
                    None => break,
                },
            };

            let server = self.clone();
            let auth = authenticator.clone();
            let options = self.config.channel.clone();
            exchanges.spawn(async move {
                match Channel::open(exchange, auth, options).await {
                    Ok(channel) => server.serve_channel(channel).await,
                    Err(e) => warn!(error = %e, "could not open exchange"),
                }
            });

            while exchanges.try_join_next().is_some() {}
        }

        while exchanges.join_next().await.is_some() {}
        carrier.shutdown().await;
    }
}
