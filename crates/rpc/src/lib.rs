//! # SigRPC runtime
//!
//! Method dispatch, request/response correlation and signature-verified
//! channels on top of the [`protocol`] crate.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐                              ┌──────────────┐
//! │  RpcClient   │                              │  RpcServer   │
//! │  (pending    │                              │  Dispatcher  │
//! │   table)     │                              │              │
//! ├──────────────┤      signed payloads         ├──────────────┤
//! │   Channel    │ ───────────────────────────► │   Channel    │
//! │ (sign/verify)│ ◄─────────────────────────── │ (sign/verify)│
//! ├──────────────┤                              ├──────────────┤
//! │   Carrier    │  memory | tcp | unix | http  │   Carrier    │
//! └──────────────┘                              └──────────────┘
//! ```
//!
//! A [`Carrier`](transport::Carrier) only moves opaque byte payloads. A
//! [`Channel`](transport::Channel) signs everything it sends and drops
//! everything it cannot verify, so the client and server above it only
//! ever see authenticated bodies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use protocol::{Authenticator, CodecKind, Identity, TrustPolicy};
//! use rpc::dispatcher::{Dispatcher, ParamSpec, Params};
//! use rpc::transport::{Channel, ChannelOptions, MemoryCarrier};
//! use rpc::{ClientConfig, RpcClient, RpcServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server_id = Identity::generate();
//!     let client_id = Identity::generate();
//!     let server_auth = Arc::new(Authenticator::new(
//!         server_id.clone(),
//!         TrustPolicy::pinned(client_id.to_peer_identity()),
//!     ));
//!     let client_auth = Arc::new(Authenticator::new(
//!         client_id,
//!         TrustPolicy::pinned(server_id.to_peer_identity()),
//!     ));
//!
//!     let mut dispatcher = Dispatcher::new();
//!     dispatcher.register("add", ParamSpec::new().required("a").required("b"), |p: Params| async move {
//!         let a: i64 = p.get(0, "a")?;
//!         let b: i64 = p.get(1, "b")?;
//!         Ok::<_, rpc::HandlerError>(serde_json::json!(a + b))
//!     })?;
//!
//!     let codec = CodecKind::Json.build();
//!     let (near, far) = MemoryCarrier::pair();
//!     let server = RpcServer::new(dispatcher, codec.clone(), ServerConfig::default());
//!     tokio::spawn(async move {
//!         let channel = Channel::open(far, server_auth, ChannelOptions::default()).await?;
//!         server.serve_channel(channel).await;
//!         Ok::<_, anyhow::Error>(())
//!     });
//!
//!     let channel = Channel::open(near, client_auth, ChannelOptions::default()).await?;
//!     let client = RpcClient::new(channel, codec, ClientConfig::default());
//!     let sum = client.call("add", vec![2.into(), 3.into()]).await?;
//!     assert_eq!(sum, serde_json::json!(5));
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`transport`]: Carriers and the verifying [`Channel`](transport::Channel)
//! - [`dispatcher`]: Method registry and invocation
//! - [`client`]: Calls, notifications and reply correlation
//! - [`server`]: Serving loops for channels, listeners and HTTP
//! - [`config`]: TOML configuration for the `sigrpc` binary

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod server;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

// Re-export client types for convenience
pub use client::{ClientConfig, RpcClient, RpcError, DEFAULT_CALL_TIMEOUT};

// Re-export config types for convenience
pub use config::Config;

// Re-export dispatcher types for convenience
pub use dispatcher::{
    Dispatcher, HandlerError, NotificationFailure, ParamSpec, Params, RegistryError,
};

// Re-export server types for convenience
pub use server::{RpcServer, ServerConfig, DEFAULT_MAX_CONCURRENT_REQUESTS};

// Re-export transport types for convenience
pub use transport::{
    Carrier, Channel, ChannelOptions, Delivery, HttpClientCarrier, HttpServerCarrier,
    MemoryCarrier, StreamCarrier, StreamListener, TransportError,
};
