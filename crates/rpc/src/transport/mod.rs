//! Authenticated byte channels over interchangeable carriers.
//!
//! A carrier moves opaque payloads between two peers: an in-process queue,
//! a TCP or Unix stream, or an HTTP exchange. A [`Channel`] wraps exactly one
//! carrier and signs every outbound payload and verifies every inbound one
//! with the [`Authenticator`] it was built with. Nothing above the channel
//! ever sees unsigned bytes.
//!
//! Carriers come in two delivery models:
//! - [`Delivery::Duplex`]: a long-lived connection; both peers may send at
//!   any time and many calls can be in flight.
//! - [`Delivery::OneShot`]: one request, at most one reply, then the
//!   exchange is over (HTTP).

pub mod http;
pub mod memory;
pub mod stream;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use protocol::{AuthError, Authenticator, Handshake, PeerIdentity, ProtocolError, SignedPayload};
use tokio::sync::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};

pub use http::{HttpClientCarrier, HttpExchange, HttpServerCarrier};
pub use memory::MemoryCarrier;
pub use stream::{StreamCarrier, StreamListener};

/// Boxed future returned by carrier methods.
pub type CarrierFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Default time allowed for the duplex handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How a carrier delivers payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Bidirectional connection carrying any number of payloads.
    Duplex,
    /// A single request/reply exchange.
    OneShot,
}

/// Write half of a carrier.
pub trait CarrierSender: Send + Sync {
    /// Hand one payload to the underlying transport.
    fn send<'a>(&'a self, payload: Vec<u8>) -> CarrierFuture<'a, ()>;

    /// Finish a one-shot exchange without a reply payload.
    ///
    /// Duplex carriers have nothing to complete.
    fn complete_exchange<'a>(&'a self) -> CarrierFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Release the underlying transport. Must tolerate repeated calls.
    fn close<'a>(&'a self) -> CarrierFuture<'a, ()>;
}

/// Read half of a carrier.
pub trait CarrierReceiver: Send {
    /// Next inbound payload; `None` once the peer is gone.
    fn recv<'a>(&'a mut self) -> CarrierFuture<'a, Option<Vec<u8>>>;
}

/// A transport collaborator that can be wrapped in a [`Channel`].
pub trait Carrier: Send {
    /// Delivery model of this carrier.
    fn delivery(&self) -> Delivery;

    /// Split into independently usable halves.
    fn split(self: Box<Self>) -> (Box<dyn CarrierSender>, Box<dyn CarrierReceiver>);
}

/// Errors raised by carriers and channels.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The underlying send primitive failed.
    #[error("send failed: {0}")]
    Send(String),

    /// The underlying receive primitive failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// The channel or carrier has been closed.
    #[error("channel closed")]
    Closed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// A frame or envelope could not be processed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An operation did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Options applied when opening a channel.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Time allowed for the duplex handshake.
    pub handshake_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// An authenticated wrapper around one carrier.
///
/// Channels are shared behind an `Arc`: the client's reader task and its
/// callers, or the server loop and its dispatch tasks, all hold the same
/// channel. Sends are serialized so payloads never interleave.
pub struct Channel {
    delivery: Delivery,
    authenticator: Arc<Authenticator>,
    peer: Option<PeerIdentity>,
    sender: Mutex<Box<dyn CarrierSender>>,
    receiver: Mutex<Box<dyn CarrierReceiver>>,
    closed: CancellationToken,
    close_started: AtomicBool,
}

impl Channel {
    /// Wrap `carrier`.
    ///
    /// Duplex carriers run the mutual handshake first; the returned channel
    /// then only accepts payloads signed by the key the peer proved. One-shot
    /// carriers verify each payload against the trust policy on its own.
    pub async fn open<C>(
        carrier: C,
        authenticator: Arc<Authenticator>,
        options: ChannelOptions,
    ) -> Result<Self, TransportError>
    where
        C: Carrier + 'static,
    {
        Self::open_boxed(Box::new(carrier), authenticator, options).await
    }

    /// [`Channel::open`] for an already boxed carrier.
    pub async fn open_boxed(
        carrier: Box<dyn Carrier>,
        authenticator: Arc<Authenticator>,
        options: ChannelOptions,
    ) -> Result<Self, TransportError> {
        let delivery = carrier.delivery();
        let (sender, mut receiver) = carrier.split();

        let peer = match delivery {
            Delivery::Duplex => {
                let handshake = handshake(sender.as_ref(), receiver.as_mut(), &authenticator);
                match tokio::time::timeout(options.handshake_timeout, handshake).await {
                    Ok(Ok(peer)) => Some(peer),
                    Ok(Err(e)) => {
                        let _ = sender.close().await;
                        return Err(e);
                    }
                    Err(_) => {
                        let _ = sender.close().await;
                        return Err(TransportError::Timeout(options.handshake_timeout));
                    }
                }
            }
            Delivery::OneShot => None,
        };

        if let Some(peer) = &peer {
            debug!(peer = %peer.fingerprint(), "channel authenticated");
        }

        Ok(Self {
            delivery,
            authenticator,
            peer,
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
            closed: CancellationToken::new(),
            close_started: AtomicBool::new(false),
        })
    }

    /// Delivery model of the wrapped carrier.
    pub fn delivery(&self) -> Delivery {
        self.delivery
    }

    /// The peer authenticated by the handshake (duplex only).
    pub fn peer(&self) -> Option<&PeerIdentity> {
        self.peer.as_ref()
    }

    /// Sign `body` and send it.
    pub async fn send(&self, body: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let sealed = self.authenticator.seal(body)?;
        let sender = self.sender.lock().await;
        sender.send(sealed).await
    }

    /// Finish a one-shot exchange without replying.
    pub async fn complete_exchange(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let sender = self.sender.lock().await;
        sender.complete_exchange().await
    }

    /// Next verified inbound body.
    ///
    /// Payloads that fail verification are dropped and logged; the peer gets
    /// no reply for them. Returns `Ok(None)` once the channel is closed
    /// locally or by the peer.
    pub async fn receive(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut receiver = self.receiver.lock().await;
        loop {
            let raw = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Ok(None),
                raw = receiver.recv() => raw,
            };

            let raw = match raw {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    debug!("carrier reached end of stream");
                    self.closed.cancel();
                    return Ok(None);
                }
                Err(e) => {
                    if self.is_closed() {
                        return Ok(None);
                    }
                    return Err(e);
                }
            };

            match self.verify(&raw) {
                Ok(body) => return Ok(Some(body)),
                Err(e) => {
                    warn!(error = %e, len = raw.len(), "dropping unverifiable payload");
                }
            }
        }
    }

    fn verify(&self, raw: &[u8]) -> Result<Vec<u8>, AuthError> {
        match &self.peer {
            Some(peer) => self.authenticator.open_from(raw, peer),
            None => self.authenticator.open(raw),
        }
    }

    /// Close the channel.
    ///
    /// Wakes any blocked [`Channel::receive`] and releases the carrier.
    /// Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        if self.close_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let sender = self.sender.lock().await;
        sender.close().await
    }

    /// Whether the channel has been closed locally or by the peer.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the channel is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("delivery", &self.delivery)
            .field("peer", &self.peer.as_ref().map(|p| p.fingerprint()))
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Mutual challenge/response over a fresh duplex carrier.
///
/// Both sides run the same sequence: send Hello, read the peer's Hello,
/// send Proof, read the peer's Proof. The peer's Hello is checked against
/// the trust policy; its Proof must be signed by the same key and name our
/// challenge as received and its own as issued. A peer presenting our own
/// key or our own challenge is a reflection and is rejected.
pub(crate) async fn handshake(
    sender: &dyn CarrierSender,
    receiver: &mut dyn CarrierReceiver,
    authenticator: &Authenticator,
) -> Result<PeerIdentity, TransportError> {
    let ours = Handshake::challenge();
    let hello = Handshake::Hello { challenge: ours };
    sender.send(authenticator.seal(&hello.to_bytes()?)?).await?;

    let raw = next_payload(receiver).await?;
    let envelope = SignedPayload::from_bytes(&raw)?;
    // Checked before the trust policy so a first-seen policy never records us
    if envelope.signer_public_key == authenticator.identity().public_key_bytes() {
        return Err(AuthError::HandshakeFailed("peer presented our own key".to_string()).into());
    }
    let theirs = match Handshake::from_bytes(authenticator.verify(&envelope)?)? {
        Handshake::Hello { challenge } if challenge == ours => {
            return Err(AuthError::HandshakeFailed("reflected challenge".to_string()).into())
        }
        Handshake::Hello { challenge } => challenge,
        Handshake::Proof { .. } => {
            return Err(AuthError::HandshakeFailed("expected hello".to_string()).into())
        }
    };
    let peer = envelope.signer()?;

    let proof = Handshake::proof(ours, theirs);
    sender.send(authenticator.seal(&proof.to_bytes()?)?).await?;

    let raw = next_payload(receiver).await?;
    match Handshake::from_bytes(&authenticator.open_from(&raw, &peer)?)? {
        proof @ Handshake::Proof { .. } if proof.proves(&ours, &theirs) => Ok(peer),
        Handshake::Proof { .. } => {
            Err(AuthError::HandshakeFailed("challenge mismatch".to_string()).into())
        }
        Handshake::Hello { .. } => {
            Err(AuthError::HandshakeFailed("expected proof".to_string()).into())
        }
    }
}

async fn next_payload(receiver: &mut dyn CarrierReceiver) -> Result<Vec<u8>, TransportError> {
    receiver.recv().await?.ok_or(TransportError::Closed)
}
