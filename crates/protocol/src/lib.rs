//! # SigRPC Protocol Library
//!
//! Message model, wire codecs and payload signatures for SigRPC, a
//! transport-agnostic RPC framework where every payload is signed.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      Request / Response / Error          │  messages
//! ├─────────────────────────────────────────┤
//! │      JSON-RPC 2.0 or MessagePack         │  codec
//! ├─────────────────────────────────────────┤
//! │      Signed envelope (Ed25519)           │  auth, crypto
//! ├─────────────────────────────────────────┤
//! │      Frames (stream carriers only)       │  framing
//! └─────────────────────────────────────────┘
//! ```
//!
//! Nothing in this crate performs I/O; carriers, channels and the client
//! and server live in the `rpc` crate.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Authenticator, Codec, Identity, JsonRpcCodec, TrustPolicy};
//! use protocol::messages::{Kwargs, Message, Request, RequestId};
//!
//! let client = Authenticator::new(Identity::generate(), TrustPolicy::first_seen());
//! let server = Authenticator::new(Identity::generate(), TrustPolicy::first_seen());
//!
//! let request = Request::call(RequestId::Number(1), "add", vec![2.into(), 3.into()], Kwargs::new());
//! let body = JsonRpcCodec.encode(&Message::Request(request)).unwrap();
//!
//! let sealed = client.seal(&body).unwrap();
//! let opened = server.open(&sealed).unwrap();
//! assert!(matches!(JsonRpcCodec.decode(&opened).unwrap(), Message::Request(_)));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Request, response and error shapes
//! - [`codec`]: JSON-RPC 2.0 and MessagePack codecs
//! - [`crypto`]: Identities, key ids and signatures
//! - [`auth`]: Signed envelopes, trust policies and the handshake
//! - [`framing`]: Frame codec with compression
//! - [`error`]: Error types

pub mod auth;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod messages;

pub use auth::{Authenticator, Handshake, SignedPayload, TrustPolicy, CHALLENGE_LENGTH};
pub use codec::{Codec, CodecKind, JsonRpcCodec, MsgpackCodec};
pub use crypto::{Identity, KeyId, PeerIdentity, Signature, KEY_ID_LENGTH};
pub use error::{AuthError, DecodeError, ProtocolError, Result};
pub use framing::{
    FrameCodec, FrameFlags, COMPRESSION_THRESHOLD, FRAME_HEADER_SIZE, FRAME_MAGIC, MAX_FRAME_SIZE,
};
pub use messages::{
    ErrorCode, ErrorResponse, IdGenerator, Kwargs, Message, Request, RequestId, Response, Value,
};
