//! Framed duplex carrier over TCP or Unix domain sockets.
//!
//! Payloads are wrapped with [`FrameCodec`] so message boundaries survive
//! the byte stream. Endpoints are written as `host:port` for TCP or
//! `unix:/path/to/socket` for a Unix socket.

use std::io;
use std::path::{Path, PathBuf};

use bytes::{Buf, BytesMut};
use protocol::FrameCodec;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::debug;

use super::{Carrier, CarrierFuture, CarrierReceiver, CarrierSender, Delivery, TransportError};

const UNIX_PREFIX: &str = "unix:";
const READ_CHUNK: usize = 8 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A connected byte stream carrying length-prefixed frames.
pub struct StreamCarrier {
    reader: BoxedReader,
    writer: BoxedWriter,
    codec: FrameCodec,
}

impl StreamCarrier {
    /// Wrap an already connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        Self::from_halves(Box::new(reader), Box::new(writer))
    }

    /// Wrap an already connected Unix stream.
    pub fn from_unix(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::from_halves(Box::new(reader), Box::new(writer))
    }

    fn from_halves(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader,
            writer,
            codec: FrameCodec::new(),
        }
    }

    /// Connect to `endpoint` (`host:port` or `unix:/path`).
    pub async fn connect(endpoint: &str) -> Result<Self, TransportError> {
        match endpoint.strip_prefix(UNIX_PREFIX) {
            Some(path) => Ok(Self::from_unix(UnixStream::connect(path).await?)),
            None => Ok(Self::from_tcp(TcpStream::connect(endpoint).await?)),
        }
    }
}

impl Carrier for StreamCarrier {
    fn delivery(&self) -> Delivery {
        Delivery::Duplex
    }

    fn split(self: Box<Self>) -> (Box<dyn CarrierSender>, Box<dyn CarrierReceiver>) {
        let this = *self;
        (
            Box::new(StreamSender {
                writer: Mutex::new(Some(this.writer)),
                codec: this.codec.clone(),
            }),
            Box::new(StreamReceiver {
                reader: this.reader,
                codec: this.codec,
                buffer: BytesMut::with_capacity(READ_CHUNK),
            }),
        )
    }
}

struct StreamSender {
    writer: Mutex<Option<BoxedWriter>>,
    codec: FrameCodec,
}

impl CarrierSender for StreamSender {
    fn send<'a>(&'a self, payload: Vec<u8>) -> CarrierFuture<'a, ()> {
        Box::pin(async move {
            let frame = self.codec.encode(&payload)?;
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(TransportError::Closed)?;
            writer.write_all(&frame).await?;
            writer.flush().await?;
            Ok(())
        })
    }

    fn close<'a>(&'a self) -> CarrierFuture<'a, ()> {
        Box::pin(async move {
            if let Some(mut writer) = self.writer.lock().await.take() {
                // The peer may already be gone
                if let Err(e) = writer.shutdown().await {
                    debug!(error = %e, "stream shutdown failed");
                }
            }
            Ok(())
        })
    }
}

struct StreamReceiver {
    reader: BoxedReader,
    codec: FrameCodec,
    buffer: BytesMut,
}

impl CarrierReceiver for StreamReceiver {
    fn recv<'a>(&'a mut self) -> CarrierFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            loop {
                if let Some((payload, used)) = self.codec.try_decode(&self.buffer)? {
                    self.buffer.advance(used);
                    return Ok(Some(payload));
                }

                self.buffer.reserve(READ_CHUNK);
                let read = self.reader.read_buf(&mut self.buffer).await?;
                if read == 0 {
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    return Err(TransportError::Receive(format!(
                        "connection closed mid-frame with {} bytes buffered",
                        self.buffer.len()
                    )));
                }
            }
        })
    }
}

/// Accepts stream connections on a TCP address or Unix socket path.
pub enum StreamListener {
    /// TCP listener.
    Tcp(TcpListener),
    /// Unix domain socket listener and its path.
    Unix(UnixListener, PathBuf),
}

impl StreamListener {
    /// Bind to `endpoint` (`host:port` or `unix:/path`).
    pub async fn bind(endpoint: &str) -> Result<Self, io::Error> {
        match endpoint.strip_prefix(UNIX_PREFIX) {
            Some(path) => Self::bind_unix(Path::new(path)),
            None => Ok(StreamListener::Tcp(TcpListener::bind(endpoint).await?)),
        }
    }

    /// Bind a Unix socket at `path`.
    ///
    /// Missing parent directories are created and a stale socket file at
    /// the path is removed first.
    pub fn bind_unix(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        Ok(StreamListener::Unix(listener, path.to_path_buf()))
    }

    /// Wait for the next connection.
    ///
    /// Returns the carrier and a printable peer address.
    pub async fn accept(&self) -> Result<(StreamCarrier, String), io::Error> {
        match self {
            StreamListener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((StreamCarrier::from_tcp(stream), addr.to_string()))
            }
            StreamListener::Unix(listener, path) => {
                let (stream, _addr) = listener.accept().await?;
                Ok((StreamCarrier::from_unix(stream), path.display().to_string()))
            }
        }
    }

    /// The bound endpoint in the same syntax [`StreamListener::bind`] takes.
    pub fn local_endpoint(&self) -> Result<String, io::Error> {
        match self {
            StreamListener::Tcp(listener) => Ok(listener.local_addr()?.to_string()),
            StreamListener::Unix(_, path) => Ok(format!("{}{}", UNIX_PREFIX, path.display())),
        }
    }
}
