//! One-shot carriers over HTTP.
//!
//! Each POST carries one signed payload. The response is `200` with the
//! signed reply as its body, or `204 No Content` when there is no reply
//! (notifications, and payloads that failed verification).

use std::net::SocketAddr;
use std::sync::Mutex;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Carrier, CarrierFuture, CarrierReceiver, CarrierSender, Delivery, TransportError};

/// Default request body limit for the HTTP server carrier.
pub const DEFAULT_MAX_BODY_SIZE: usize = 4096;

const CONTENT_TYPE: &str = "application/octet-stream";
const EXCHANGE_QUEUE_CAPACITY: usize = 256;

// ============================================================================
// Client side
// ============================================================================

/// Client carrier that POSTs each payload to a fixed URL.
///
/// The reply body of each exchange is queued for the next `recv`.
pub struct HttpClientCarrier {
    client: reqwest::Client,
    url: String,
}

impl HttpClientCarrier {
    /// Carrier posting to `url` with a default client.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    /// Carrier posting to `url` with a caller-configured client.
    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl Carrier for HttpClientCarrier {
    fn delivery(&self) -> Delivery {
        Delivery::OneShot
    }

    fn split(self: Box<Self>) -> (Box<dyn CarrierSender>, Box<dyn CarrierReceiver>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Box::new(HttpClientSender {
                client: self.client,
                url: self.url,
                replies: Mutex::new(Some(tx)),
            }),
            Box::new(HttpClientReceiver { replies: rx }),
        )
    }
}

struct HttpClientSender {
    client: reqwest::Client,
    url: String,
    replies: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl HttpClientSender {
    fn replies(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.replies.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl CarrierSender for HttpClientSender {
    fn send<'a>(&'a self, payload: Vec<u8>) -> CarrierFuture<'a, ()> {
        Box::pin(async move {
            let replies = self.replies().ok_or(TransportError::Closed)?;

            let response = self
                .client
                .post(&self.url)
                .header(header::CONTENT_TYPE, CONTENT_TYPE)
                .body(payload)
                .send()
                .await
                .map_err(|e| TransportError::Send(e.to_string()))?;

            match response.status() {
                reqwest::StatusCode::NO_CONTENT => Ok(()),
                reqwest::StatusCode::OK => {
                    let body = response
                        .bytes()
                        .await
                        .map_err(|e| TransportError::Receive(e.to_string()))?;
                    if !body.is_empty() {
                        replies
                            .send(body.to_vec())
                            .map_err(|_| TransportError::Closed)?;
                    }
                    Ok(())
                }
                status => Err(TransportError::Send(format!("HTTP {}", status))),
            }
        })
    }

    fn close<'a>(&'a self) -> CarrierFuture<'a, ()> {
        Box::pin(async move {
            self.replies.lock().unwrap_or_else(|e| e.into_inner()).take();
            Ok(())
        })
    }
}

struct HttpClientReceiver {
    replies: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl CarrierReceiver for HttpClientReceiver {
    fn recv<'a>(&'a mut self) -> CarrierFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move { Ok(self.replies.recv().await) })
    }
}

// ============================================================================
// Server side
// ============================================================================

/// HTTP endpoint that turns each POST into an [`HttpExchange`].
///
/// Stopping happens on [`HttpServerCarrier::shutdown`] or drop.
pub struct HttpServerCarrier {
    local_addr: SocketAddr,
    exchanges: mpsc::Receiver<HttpExchange>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[derive(Clone)]
struct EndpointState {
    exchanges: mpsc::Sender<HttpExchange>,
}

impl HttpServerCarrier {
    /// Bind to `addr` and start serving.
    ///
    /// Bodies above `max_body_size` are refused with `413` before they are
    /// queued.
    pub async fn bind(addr: &str, max_body_size: usize) -> Result<Self, TransportError> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (tx, rx) = mpsc::channel(EXCHANGE_QUEUE_CAPACITY);
        let app = Router::new()
            .fallback(handle_post)
            .with_state(EndpointState { exchanges: tx })
            .layer(DefaultBodyLimit::max(max_body_size));

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "HTTP endpoint stopped with error");
            }
        });

        info!(addr = %local_addr, max_body_size, "HTTP endpoint listening");
        Ok(Self {
            local_addr,
            exchanges: rx,
            shutdown,
            task: Some(task),
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next POST. `None` once the endpoint has stopped.
    pub async fn accept(&mut self) -> Option<HttpExchange> {
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            exchange = self.exchanges.recv() => exchange,
        }
    }

    /// Stop accepting requests and wait for the HTTP server to wind down.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        self.exchanges.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for HttpServerCarrier {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn handle_post(State(state): State<EndpointState>, method: Method, body: Bytes) -> Response {
    if method != Method::POST {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    let exchange = HttpExchange {
        body: body.to_vec(),
        reply: reply_tx,
    };
    if state.exchanges.send(exchange).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    match reply_rx.await {
        Ok(Some(reply)) => ([(header::CONTENT_TYPE, CONTENT_TYPE)], reply).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(_) => {
            debug!("exchange finished without a reply");
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

/// One HTTP request awaiting at most one reply.
pub struct HttpExchange {
    body: Vec<u8>,
    reply: oneshot::Sender<Option<Vec<u8>>>,
}

impl Carrier for HttpExchange {
    fn delivery(&self) -> Delivery {
        Delivery::OneShot
    }

    fn split(self: Box<Self>) -> (Box<dyn CarrierSender>, Box<dyn CarrierReceiver>) {
        (
            Box::new(ExchangeSender {
                reply: Mutex::new(Some(self.reply)),
            }),
            Box::new(ExchangeReceiver {
                body: Some(self.body),
            }),
        )
    }
}

struct ExchangeSender {
    reply: Mutex<Option<oneshot::Sender<Option<Vec<u8>>>>>,
}

impl ExchangeSender {
    fn fulfil(&self, reply: Option<Vec<u8>>) -> Result<(), TransportError> {
        let slot = self.reply.lock().unwrap_or_else(|e| e.into_inner()).take();
        match slot {
            Some(tx) => tx.send(reply).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Send("exchange already answered".to_string())),
        }
    }
}

impl CarrierSender for ExchangeSender {
    fn send<'a>(&'a self, payload: Vec<u8>) -> CarrierFuture<'a, ()> {
        Box::pin(async move { self.fulfil(Some(payload)) })
    }

    fn complete_exchange<'a>(&'a self) -> CarrierFuture<'a, ()> {
        Box::pin(async move { self.fulfil(None) })
    }

    fn close<'a>(&'a self) -> CarrierFuture<'a, ()> {
        Box::pin(async move {
            self.reply.lock().unwrap_or_else(|e| e.into_inner()).take();
            Ok(())
        })
    }
}

struct ExchangeReceiver {
    body: Option<Vec<u8>>,
}

impl CarrierReceiver for ExchangeReceiver {
    fn recv<'a>(&'a mut self) -> CarrierFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move { Ok(self.body.take()) })
    }
}
